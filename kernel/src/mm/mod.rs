// Memory Management Subsystem
//
// Serves as the top-level entry point for the kernel's user-page memory
// management: the frame table that backs user pages with physical pages,
// the clock policy that reclaims them under pressure, and the fault-tolerant
// primitives system calls use to touch user memory.
//
// Key responsibilities:
// - Wire the frame table to its collaborators (page source, accessed-bit
//   accessor, writeback) in one place, once, during boot
// - Wire the user-memory primitives to the architecture's fault-capable access
// - Encapsulate MM submodules behind a unified namespace
//
// Initialization flow:
// - The log level from `VmConfig` is applied first
// - `FrameTable::new` builds an empty table (no frames resident)
// - `UserMemory::new` captures the user boundary and copy chunk size
//
// Design principles:
// - Strict layering: the frame table knows nothing about system calls, and
//   the user-memory primitives know nothing about frames
// - Collaborators are traits, so the subsystem runs unchanged on bare metal
//   and in host-side tests
//
// Correctness and safety notes:
// - The page-fault handler must call `arch::recover_user_access_fault`
//   before its fail-stop path, or user-memory probes will crash the kernel
// - Thread teardown must call `FrameTable::clear_all` before releasing the
//   thread's supplemental page table
//
// Intended usage:
// - Called once during kernel boot, before spawning user threads

pub mod accessed;
pub mod clock;
pub mod config;
pub mod frame;
pub mod pmm;
pub mod transition;
pub mod uaccess;

#[cfg(test)]
pub(crate) mod testing;

pub use accessed::{AccessedBits, AddressSpaceLookup, PageTableWalker};
pub use config::VmConfig;
pub use frame::{
    AllocError, Frame, FrameId, FrameTable, FreeOutcome, PageEntry, PageWriteback,
    SupplementalTable,
};
pub use pmm::{AllocFlags, BitmapPageSource, PagePools, PageSource};
pub use uaccess::{FaultingAccess, InvalidUserAddress, UserMemory, UserStrError};

use crate::log;
use crate::log_info;

const LOG_ORIGIN: &str = "mm";

pub struct MemorySubsystem<S, D, W, A> {
    frames: FrameTable<S, D, W>,
    user: UserMemory<A>,
    config: VmConfig,
}

impl<S, D, W, A> MemorySubsystem<S, D, W, A>
where
    S: PageSource,
    D: AccessedBits,
    W: PageWriteback,
    A: FaultingAccess,
{
    pub fn init(config: VmConfig, source: S, accessed: D, writeback: W, access: A) -> Self {
        log::set_level(config.log_level);

        let frames = FrameTable::new(source, accessed, writeback);
        let user = UserMemory::new(access, &config);

        log_info!(
            LOG_ORIGIN,
            "Memory subsystem ready: user_top={:#X}, copy_chunk={}",
            config.user_top,
            config.effective_chunk()
        );

        Self {
            frames,
            user,
            config,
        }
    }

    pub fn frames(&self) -> &FrameTable<S, D, W> {
        &self.frames
    }

    pub fn user(&self) -> &UserMemory<A> {
        &self.user
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }
}
