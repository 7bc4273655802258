// Frame Table & Allocator
//
// Tracks every physical page currently backing a user page, and hands out
// frames to the page-fault path. When the page source runs dry, a resident
// frame is reclaimed through the clock policy in `mm::clock`.
//
// Key responsibilities:
// - Bind a kernel page to exactly one (owning thread, user address) pair
// - Keep freshly allocated and freshly evicted frames pinned until the
//   caller finishes installing the mapping and calls `unpin`
// - Remove frames on page release (`free`) and on thread exit (`clear_all`)
//
// Implementation details:
// - Frames live in an arena of slots addressed by `FrameId`; the slot
//   generation is bumped whenever the slot is vacated or handed to a new
//   owner, so an id kept by a stale page-table entry stops resolving
// - Occupied slots are linked into a circular doubly linked list in
//   insertion order; the clock hand walks this ring
// - All structural state sits behind one `spin::Mutex`. The lock is never
//   held across page-source, writeback, or teardown waits
//
// Correctness and safety notes:
// - A pinned frame is never chosen as a victim and never released by `free`
// - `clear_all` waits on the transition barrier, so no eviction is reading
//   a frame while teardown removes it
// - Unpinning an unpinned or vacated frame is a kernel bug and panics

use alloc::vec::Vec;
use core::fmt;
use spin::relax::{RelaxStrategy, Spin};
use spin::Mutex;
use x86_64::VirtAddr;

use super::accessed::AccessedBits;
use super::pmm::{self, AllocFlags, PageSource};
use super::transition::{InFlight, TransitionBarrier};
use crate::thread::ThreadId;
use crate::{log_debug, log_info, log_panic, log_warn};

const LOG_ORIGIN: &str = "frame";

/// Link value marking "no slot".
const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl FrameId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Snapshot of one resident frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub owner: ThreadId,
    pub uaddr: VirtAddr,
    pub kpage: VirtAddr,
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No frame is resident, so there is nothing to reclaim.
    TableEmpty,
    /// Every resident frame is pinned.
    AllPinned,
    /// The victim's contents could not be saved; it stays with its owner.
    WritebackFailed,
}

/// Result of `FrameTable::free`. Every variant is an accepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The frame was removed and its page returned to the source.
    Released,
    /// The frame is pinned; nothing changed.
    Pinned,
    /// The entry had no live frame; any dangling back-reference was cleared.
    NotResident,
}

/// Saves the contents of a page about to be reclaimed (to swap, or back to
/// its file) and unmaps it from the previous owner.
pub trait PageWriteback: Sync {
    fn evict(&self, owner: ThreadId, uaddr: VirtAddr) -> bool;
}

impl<T: PageWriteback + ?Sized> PageWriteback for &T {
    fn evict(&self, owner: ThreadId, uaddr: VirtAddr) -> bool {
        (**self).evict(owner, uaddr)
    }
}

/// One supplemental page-table entry, as far as the frame table cares.
pub trait PageEntry {
    fn frame(&self) -> Option<FrameId>;
    fn set_frame(&mut self, frame: Option<FrameId>);
}

/// A thread's supplemental page table.
pub trait SupplementalTable {
    fn for_each_entry(&mut self, f: &mut dyn FnMut(&mut dyn PageEntry));
}

#[derive(Debug, Clone, Copy)]
pub(super) struct FrameRecord {
    pub(super) owner: ThreadId,
    pub(super) uaddr: VirtAddr,
    pub(super) kpage: VirtAddr,
    pub(super) pinned: bool,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<FrameRecord>,
    prev: u32,
    next: u32,
}

pub(super) struct FrameTableState {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    head: Option<u32>,
    pub(super) hand: Option<u32>,
    len: usize,
    pub(super) transitions: InFlight,
}

impl FrameTableState {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            hand: None,
            len: 0,
            transitions: InFlight::new(),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    fn id_of(&self, index: u32) -> FrameId {
        FrameId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn get(&self, id: FrameId) -> Option<&FrameRecord> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_ref()
    }

    fn get_mut(&mut self, id: FrameId) -> Option<&mut FrameRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_mut()
    }

    /// Record at an occupied slot. Only called with indices taken from the ring.
    pub(super) fn record_at(&self, index: u32) -> Option<&FrameRecord> {
        self.slots.get(index as usize)?.record.as_ref()
    }

    pub(super) fn record_at_mut(&mut self, index: u32) -> Option<&mut FrameRecord> {
        self.slots.get_mut(index as usize)?.record.as_mut()
    }

    /// Slot after `position` in clock order; `None` is the sentinel before
    /// the head.
    pub(super) fn advance(&self, position: Option<u32>) -> Option<u32> {
        match position {
            None => self.head,
            Some(index) => Some(self.slots[index as usize].next),
        }
    }

    pub(super) fn snapshot(&self, index: u32) -> Option<Frame> {
        let record = self.record_at(index)?;
        Some(Frame {
            id: self.id_of(index),
            owner: record.owner,
            uaddr: record.uaddr,
            kpage: record.kpage,
            pinned: record.pinned,
        })
    }

    fn is_bound(&self, owner: ThreadId, uaddr: VirtAddr) -> bool {
        self.slots
            .iter()
            .filter_map(|slot| slot.record.as_ref())
            .any(|record| record.owner == owner && record.uaddr == uaddr)
    }

    /// Links a new record at the tail of the ring.
    fn insert(&mut self, record: FrameRecord) -> Frame {
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: None,
                    prev: NIL,
                    next: NIL,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let (prev, next) = match self.head {
            None => {
                self.head = Some(index);
                (index, index)
            }
            Some(head) => {
                let tail = self.slots[head as usize].prev;
                self.slots[tail as usize].next = index;
                self.slots[head as usize].prev = index;
                (tail, head)
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.record = Some(record);
        slot.prev = prev;
        slot.next = next;
        self.len += 1;

        Frame {
            id: FrameId {
                index,
                generation: slot.generation,
            },
            owner: record.owner,
            uaddr: record.uaddr,
            kpage: record.kpage,
            pinned: record.pinned,
        }
    }

    /// Unlinks a live frame, keeping the clock hand on a live element.
    fn remove(&mut self, id: FrameId) -> Option<FrameRecord> {
        self.get(id)?;
        let index = id.index;
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.prev, slot.next)
        };

        if self.len == 1 {
            self.head = None;
            self.hand = None;
        } else {
            self.slots[prev as usize].next = next;
            self.slots[next as usize].prev = prev;
            if self.head == Some(index) {
                self.head = Some(next);
            }
            if self.hand == Some(index) {
                self.hand = Some(prev);
            }
        }

        let slot = &mut self.slots[index as usize];
        let record = slot.record.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.prev = NIL;
        slot.next = NIL;
        self.vacant.push(index);
        self.len -= 1;
        record
    }

    /// Hands an occupied slot to a new owner under a fresh generation. The
    /// slot keeps its place in the ring.
    pub(super) fn reassign(&mut self, index: u32, owner: ThreadId, uaddr: VirtAddr) -> Option<Frame> {
        let slot = self.slots.get_mut(index as usize)?;
        let record = slot.record.as_mut()?;
        record.owner = owner;
        record.uaddr = uaddr;
        record.pinned = true;
        slot.generation = slot.generation.wrapping_add(1);
        self.snapshot(index)
    }
}

pub struct FrameTable<S, D, W, R = Spin> {
    pub(super) state: Mutex<FrameTableState>,
    pub(super) barrier: TransitionBarrier<R>,
    source: S,
    pub(super) accessed: D,
    pub(super) writeback: W,
}

impl<S, D, W> FrameTable<S, D, W, Spin>
where
    S: PageSource,
    D: AccessedBits,
    W: PageWriteback,
{
    /// Builds an empty table whose teardown waits spin.
    pub fn new(source: S, accessed: D, writeback: W) -> Self {
        Self::with_relax(source, accessed, writeback)
    }
}

impl<S, D, W, R> FrameTable<S, D, W, R>
where
    S: PageSource,
    D: AccessedBits,
    W: PageWriteback,
    R: RelaxStrategy,
{
    /// Builds an empty table whose teardown waits relax through `R`, e.g. a
    /// strategy that yields to the scheduler.
    pub fn with_relax(source: S, accessed: D, writeback: W) -> Self {
        Self {
            state: Mutex::new(FrameTableState::new()),
            barrier: TransitionBarrier::new(),
            source,
            accessed,
            writeback,
        }
    }

    /// Obtains a pinned frame for `owner`'s page at `uaddr`, reclaiming a
    /// resident frame when the page source is exhausted.
    ///
    /// Frames always come from the user pool; `AllocFlags::USER` is implied.
    /// A failure is final for this call; the caller decides whether to retry
    /// or to kill the faulting thread.
    ///
    /// Debug builds also check that `(owner, uaddr)` is not already resident,
    /// which scans the whole table under the lock on every fresh allocation.
    pub fn allocate(&self, owner: ThreadId, uaddr: VirtAddr, flags: AllocFlags) -> Result<Frame, AllocError> {
        let flags = flags | AllocFlags::USER;
        if let Some(kpage) = self.source.obtain(flags) {
            let mut state = self.state.lock();
            debug_assert!(
                !state.is_bound(owner, uaddr),
                "frame table: {:#X} of thread {} is already resident",
                uaddr.as_u64(),
                owner
            );
            let frame = state.insert(FrameRecord {
                owner,
                uaddr,
                kpage,
                pinned: true,
            });
            drop(state);

            log_debug!(
                LOG_ORIGIN,
                "Frame {} -> thread {} at {:#X}",
                frame.id,
                owner,
                uaddr.as_u64()
            );
            return Ok(frame);
        }

        log_debug!(
            LOG_ORIGIN,
            "Page source exhausted, reclaiming for thread {} at {:#X}",
            owner,
            uaddr.as_u64()
        );

        let frame = self.evict(owner, uaddr)?;
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the frame is pinned and now bound to the caller, and the
            // previous owner's mapping was torn down by the writeback.
            unsafe { pmm::zero_page(frame.kpage) };
        }
        Ok(frame)
    }

    /// Releases the frame behind `entry` unless it is pinned.
    pub fn free<E: PageEntry + ?Sized>(&self, entry: &mut E) -> FreeOutcome {
        let Some(id) = entry.frame() else {
            return FreeOutcome::NotResident;
        };

        let mut state = self.state.lock();
        let pinned = match state.get(id) {
            Some(record) => record.pinned,
            None => {
                drop(state);
                entry.set_frame(None);
                log_debug!(LOG_ORIGIN, "Dropped stale reference to frame {}", id);
                return FreeOutcome::NotResident;
            }
        };
        if pinned {
            return FreeOutcome::Pinned;
        }

        let record = state.remove(id);
        drop(state);

        entry.set_frame(None);
        match record {
            Some(record) => {
                self.source.release(record.kpage);
                FreeOutcome::Released
            }
            None => FreeOutcome::NotResident,
        }
    }

    /// Makes a pinned frame eligible for eviction again.
    pub fn unpin(&self, id: FrameId) {
        let mut state = self.state.lock();
        let pinned = state.get_mut(id).map(|record| core::mem::replace(&mut record.pinned, false));
        drop(state);

        match pinned {
            Some(true) => {}
            Some(false) => {
                log_panic!(LOG_ORIGIN, "Unpin of unpinned frame {}", id);
                panic!("frame table: unpin of unpinned frame {}", id);
            }
            None => {
                log_panic!(LOG_ORIGIN, "Unpin of stale frame {}", id);
                panic!("frame table: unpin of stale frame {}", id);
            }
        }
    }

    /// Removes every frame referenced by `owner`'s supplemental table.
    ///
    /// Blocks until no eviction is in flight. Pinned frames are removed as
    /// well: the owner is exiting and nothing else may reference them.
    ///
    /// The table lock is held for the whole walk of `table`, not per frame.
    /// Once the barrier is idle no eviction may start until every entry is
    /// gone, so teardown costs O(entries) of lock hold time.
    pub fn clear_all<T: SupplementalTable + ?Sized>(&self, owner: ThreadId, table: &mut T) {
        let state = self.state.lock();
        let mut state = self.barrier.wait_idle(&self.state, state, |s| &s.transitions);

        let mut released: Vec<VirtAddr> = Vec::new();
        let mut foreign = 0usize;
        table.for_each_entry(&mut |entry: &mut dyn PageEntry| {
            let Some(id) = entry.frame() else {
                return;
            };
            if let Some(record) = state.remove(id) {
                if record.owner != owner {
                    foreign += 1;
                }
                released.push(record.kpage);
            }
            entry.set_frame(None);
        });
        drop(state);

        if foreign > 0 {
            log_warn!(
                LOG_ORIGIN,
                "Thread {} teardown removed {} frames owned by other threads",
                owner,
                foreign
            );
        }

        for page in &released {
            self.source.release(*page);
        }

        log_info!(
            LOG_ORIGIN,
            "Cleared {} frames of thread {}",
            released.len(),
            owner
        );
    }

    pub fn frame(&self, id: FrameId) -> Option<Frame> {
        let state = self.state.lock();
        state.get(id)?;
        state.snapshot(id.index)
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evictions currently between victim selection and finalization.
    pub fn in_flight(&self) -> usize {
        self.state.lock().transitions.count()
    }

    pub fn page_source(&self) -> &S {
        &self.source
    }

    pub fn accessed_bits(&self) -> &D {
        &self.accessed
    }

    pub fn writeback(&self) -> &W {
        &self.writeback
    }
}
