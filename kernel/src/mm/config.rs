// Memory Subsystem Configuration
//
// Boot-time tunables for the frame table and the user-memory primitives.
// Values are fixed once `MemorySubsystem::init` runs; there is no runtime
// reconfiguration.

use crate::log::LogLevel;

/// First address that is not user memory. Everything at or above it belongs
/// to the kernel half (or is non-canonical) and is rejected without a probe.
pub const USER_TOP: usize = 0x0000_8000_0000_0000;

/// Size of the kernel bounce buffer used when streaming user buffers.
pub const MAX_COPY_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub user_top: usize,
    pub copy_chunk: usize,
    pub log_level: LogLevel,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            user_top: USER_TOP,
            copy_chunk: MAX_COPY_CHUNK,
            log_level: LogLevel::Debug,
        }
    }

    pub const fn with_user_top(mut self, user_top: usize) -> Self {
        self.user_top = user_top;
        self
    }

    pub const fn with_copy_chunk(mut self, copy_chunk: usize) -> Self {
        self.copy_chunk = copy_chunk;
        self
    }

    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Chunk size actually used: never zero, never larger than the bounce buffer.
    pub const fn effective_chunk(&self) -> usize {
        if self.copy_chunk == 0 {
            1
        } else if self.copy_chunk > MAX_COPY_CHUNK {
            MAX_COPY_CHUNK
        } else {
            self.copy_chunk
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
