// Clock Eviction Policy
//
// Second-chance page replacement over the frame table's ring. Every resident
// frame gets one revolution of grace after it was last touched.
//
// Sweep:
// - Advance the hand to the first unpinned frame; if a full revolution
//   finds only pinned frames there is no victim
// - From there, each unpinned frame with its accessed bit set has the bit
//   cleared and is passed over; pinned frames are passed over untouched
// - The first unpinned frame found with a clear bit is the victim; if the
//   sweep comes back to where it started, the starting frame (whose bit is
//   now clear) is the victim
// - The hand is left on the victim
//
// Eviction:
// - The victim is pinned and registered with the transition barrier before
//   the table lock is dropped
// - Writeback runs unlocked; on success the slot is handed to the new owner
//   under a fresh generation, on failure it is unpinned and left in place
// - Either way the barrier is exited with the lock re-acquired
//
// Correctness notes:
// - The sweep is bounded: at most one revolution to find a start and one
//   revolution from it
// - A bit set by hardware after the sweep passed a frame is seen on the
//   next call, not this one

use spin::relax::RelaxStrategy;
use x86_64::VirtAddr;

use super::accessed::AccessedBits;
use super::frame::{AllocError, Frame, FrameTable, FrameTableState, PageWriteback};
use super::pmm::PageSource;
use crate::thread::ThreadId;
use crate::{log_debug, log_panic, log_warn};

const LOG_ORIGIN: &str = "clock";

impl FrameTableState {
    /// Picks the next victim slot and leaves the hand on it. Does not pin.
    pub(super) fn select_victim<D: AccessedBits + ?Sized>(&mut self, accessed: &D) -> Result<u32, AllocError> {
        if self.len() == 0 {
            return Err(AllocError::TableEmpty);
        }

        let mut start = None;
        for _ in 0..self.len() {
            let Some(index) = self.advance(self.hand) else {
                break;
            };
            self.hand = Some(index);
            if self.record_at(index).is_some_and(|record| !record.pinned) {
                start = Some(index);
                break;
            }
        }
        let start = start.ok_or(AllocError::AllPinned)?;

        let mut current = start;
        loop {
            if let Some(record) = self.record_at(current) {
                if !record.pinned {
                    if !accessed.is_accessed(record.owner, record.uaddr) {
                        return Ok(current);
                    }
                    accessed.clear_accessed(record.owner, record.uaddr);
                }
            }

            let Some(next) = self.advance(Some(current)) else {
                return Ok(start);
            };
            self.hand = Some(next);
            if next == start {
                return Ok(start);
            }
            current = next;
        }
    }
}

impl<S, D, W, R> FrameTable<S, D, W, R>
where
    S: PageSource,
    D: AccessedBits,
    W: PageWriteback,
    R: RelaxStrategy,
{
    /// Reclaims a resident frame for `owner`'s page at `uaddr`.
    pub(super) fn evict(&self, owner: ThreadId, uaddr: VirtAddr) -> Result<Frame, AllocError> {
        let mut state = self.state.lock();
        let victim = match state.select_victim(&self.accessed) {
            Ok(victim) => victim,
            Err(err) => {
                let resident = state.len();
                drop(state);
                log_warn!(
                    LOG_ORIGIN,
                    "No eviction victim among {} resident frames: {:?}",
                    resident,
                    err
                );
                return Err(err);
            }
        };

        let Some(record) = state.record_at_mut(victim) else {
            drop(state);
            log_panic!(LOG_ORIGIN, "Clock hand on vacant slot {}", victim);
            panic!("clock: hand on vacant slot {}", victim);
        };
        record.pinned = true;
        let (previous_owner, previous_uaddr) = (record.owner, record.uaddr);
        self.barrier.enter(&mut state.transitions);
        drop(state);

        log_debug!(
            LOG_ORIGIN,
            "Evicting thread {} page {:#X} for thread {} page {:#X}",
            previous_owner,
            previous_uaddr.as_u64(),
            owner,
            uaddr.as_u64()
        );

        let written = self.writeback.evict(previous_owner, previous_uaddr);

        let mut state = self.state.lock();
        let result = if written {
            state.reassign(victim, owner, uaddr)
        } else {
            if let Some(record) = state.record_at_mut(victim) {
                record.pinned = false;
            }
            None
        };
        self.barrier.exit(&mut state.transitions);
        drop(state);

        match result {
            Some(frame) => Ok(frame),
            None if written => {
                log_panic!(LOG_ORIGIN, "Eviction victim {} vanished during writeback", victim);
                panic!("clock: eviction victim {} vanished during writeback", victim);
            }
            None => {
                log_warn!(
                    LOG_ORIGIN,
                    "Writeback of thread {} page {:#X} failed",
                    previous_owner,
                    previous_uaddr.as_u64()
                );
                Err(AllocError::WritebackFailed)
            }
        }
    }
}
