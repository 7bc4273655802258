// Kernel Logging Subsystem
//
// Provides the multi-level, timestamped, origin-tagged log output used by the
// memory subsystem for diagnostics and bring-up tracing.
//
// Key responsibilities:
// - Provide standardized log levels (Debug, Info, Warn, Error, Panic)
// - Attach timestamps and subsystem origin to every log entry
// - Include source location only for DEBUG entries (file:line)
// - Forward formatted records to a single registered sink
//
// Design principles:
// - Zero-cost filtering: log messages below the current level are dropped early
// - Early-boot friendly: records emitted before a sink exists are discarded
// - Deterministic output suitable for debugging kernel bring-up
//
// Implementation details:
// - The level lives in an `AtomicU8`, so filtering needs no lock
// - The sink and the tick source are registered once through `spin::Once`
// - Timestamps are derived from the tick source (10 ms per tick by default)
// - Each log includes severity, timestamp, subsystem origin, and message
//
// Developer ergonomics:
// - Convenience macros (`log_debug!`, `log_info!`, etc.) wrap `_log`
// - Macros automatically capture `file!()` and `line!()` for debug context

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Panic = 4,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Panic => "PANIC",
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Panic,
        }
    }
}

/// Destination for formatted log lines (serial port, ring buffer, test capture).
pub trait LogSink: Sync {
    fn write_line(&self, level: LogLevel, line: fmt::Arguments);
}

static SINK: spin::Once<&'static dyn LogSink> = spin::Once::new();
static TICKS: spin::Once<fn() -> u64> = spin::Once::new();
static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);

const MS_PER_TICK: u64 = 10;

pub fn init(sink: &'static dyn LogSink, level: LogLevel) {
    SINK.call_once(|| sink);
    set_level(level);
}

pub fn set_tick_source(ticks: fn() -> u64) {
    TICKS.call_once(|| ticks);
}

pub fn set_level(level: LogLevel) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_raw(CURRENT_LOG_LEVEL.load(Ordering::Relaxed))
}

fn get_timestamp_ms() -> u64 {
    TICKS.get().map_or(0, |ticks| ticks() * MS_PER_TICK)
}

fn format_timestamp(ms: u64) -> (u64, u64) {
    let seconds = ms / 1000;
    let milliseconds = ms % 1000;
    (seconds, milliseconds)
}

pub fn _log(level: LogLevel, origin: &str, args: fmt::Arguments, file: &str, line: u32) {
    if level < get_level() {
        return;
    }

    let Some(sink) = SINK.get() else {
        return;
    };

    let (seconds, milliseconds) = format_timestamp(get_timestamp_ms());
    let level_str = level.as_str();

    if level == LogLevel::Debug {
        sink.write_line(
            level,
            format_args!(
                "[t={}.{:03}s] [{}] [{}] {} ({}:{})",
                seconds, milliseconds, level_str, origin, args, file, line
            ),
        );
    } else {
        sink.write_line(
            level,
            format_args!(
                "[t={}.{:03}s] [{}] [{}] {}",
                seconds, milliseconds, level_str, origin, args
            ),
        );
    }
}

#[macro_export]
macro_rules! log_debug {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Debug,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Info,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Warn,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Error,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_panic {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Panic,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}
