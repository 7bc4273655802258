// Atom VM: user-page memory management core
//
// This crate holds the virtual-memory core of the kernel: the frame table
// that binds physical pages to user pages, second-chance (clock) eviction,
// the transition barrier that keeps thread teardown away from frames under
// eviction, and fault-tolerant access to user memory for system calls.
//
// Key responsibilities:
// - Allocate, pin, unpin, free, and reclaim user frames
// - Read and clear hardware accessed bits through the page tables
// - Copy to and from user memory without ever faulting the kernel
// - Provide the kernel's origin-tagged logging to all of the above
//
// Design and implementation:
// - `no_std` with `alloc`; the kernel proper supplies the heap, the log
//   sink, the page source, and the writeback path
// - Host test builds link `std` so the subsystem is exercised with threads
//   and in-memory fixtures
// - Only `arch` contains inline assembly, and only for bare-metal targets
//
// Public interface:
// - `mm::MemorySubsystem` as the single boot-time entry point
// - `arch::recover_user_access_fault` for the page-fault handler
// - `log::init` and the `log_*!` macros

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod log;

pub mod arch;
pub mod mm;
pub mod thread;
