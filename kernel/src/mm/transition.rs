// Eviction Transition Barrier
//
// Eviction must not hold the frame-table lock while the writeback
// collaborator runs (that would serialize every allocation behind swap I/O),
// yet thread teardown must not remove table entries while some eviction's
// writeback might still be looking at them.
//
// Protocol:
// - `InFlight` is a plain counter stored inside the lock-protected table
//   state; it is only ever touched with the table lock held
// - An evictor calls `enter` (under the lock) right before dropping the lock
//   for writeback, and `exit` (under the lock) once the table is re-touched
// - When `exit` brings the counter to zero it advances `epoch`, which is the
//   broadcast every waiter is watching
// - `wait_idle` is the condition wait: with the lock held it checks the
//   counter, snapshots the epoch, drops the lock, relaxes until the epoch
//   moves, re-acquires, and checks again
//
// Correctness notes:
// - The epoch is read while the lock is still held, and only advanced with
//   the lock held, so a broadcast between "check" and "sleep" cannot be lost
// - The re-check loop makes the wait immune to a new eviction starting
//   between the broadcast and the waiter re-acquiring the lock
// - This is an exclusive barrier against eviction I/O, not a reader/writer
//   lock: teardown is the only class of waiter
// - Relaxation is a `spin::RelaxStrategy`, so a scheduler-aware kernel can
//   yield instead of spinning

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::relax::{RelaxStrategy, Spin};
use spin::{Mutex, MutexGuard};

/// Number of evictions past victim selection that have not been finalized.
#[derive(Debug, Default)]
pub struct InFlight(usize);

impl InFlight {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn count(&self) -> usize {
        self.0
    }
}

pub struct TransitionBarrier<R = Spin> {
    epoch: AtomicU64,
    _relax: PhantomData<R>,
}

impl<R: RelaxStrategy> TransitionBarrier<R> {
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            _relax: PhantomData,
        }
    }

    /// Records an eviction leaving the lock for its writeback phase.
    pub fn enter(&self, in_flight: &mut InFlight) {
        in_flight.0 += 1;
    }

    /// Records an eviction finishing its writeback phase. Returns `true` when
    /// this was the last one and waiters were woken.
    pub fn exit(&self, in_flight: &mut InFlight) -> bool {
        assert!(
            in_flight.0 > 0,
            "transition barrier: exit without a matching enter"
        );
        in_flight.0 -= 1;

        if in_flight.0 == 0 {
            self.epoch.fetch_add(1, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Blocks until no eviction is in flight, returning the re-acquired guard.
    pub fn wait_idle<'a, T>(
        &self,
        lock: &'a Mutex<T>,
        mut guard: MutexGuard<'a, T>,
        in_flight: impl Fn(&T) -> &InFlight,
    ) -> MutexGuard<'a, T> {
        while in_flight(&guard).count() > 0 {
            let seen = self.epoch.load(Ordering::Acquire);
            drop(guard);

            while self.epoch.load(Ordering::Acquire) == seen {
                R::relax();
            }

            guard = lock.lock();
        }
        guard
    }
}

impl<R: RelaxStrategy> Default for TransitionBarrier<R> {
    fn default() -> Self {
        Self::new()
    }
}
