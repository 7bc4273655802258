// Host-side stand-ins for the memory subsystem's collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use spin::Mutex;
use x86_64::VirtAddr;

use super::accessed::AccessedBits;
use super::frame::{FrameId, PageEntry, PageWriteback, SupplementalTable};
use super::pmm::PAGE_SIZE;
use super::uaccess::FaultingAccess;
use crate::thread::ThreadId;

#[repr(C, align(4096))]
struct Page([u8; PAGE_SIZE]);

/// Leaks `pages` page-aligned pages and returns `(base, pages)`.
pub fn page_region(pages: usize) -> (VirtAddr, usize) {
    let region: Vec<Page> = (0..pages.max(1)).map(|_| Page([0; PAGE_SIZE])).collect();
    let region = Box::leak(region.into_boxed_slice());
    (VirtAddr::new(region.as_mut_ptr() as u64), pages)
}

/// Byte-granular fake user address space. Unmapped bytes fault.
pub struct UserSpace {
    bytes: Mutex<BTreeMap<usize, u8>>,
    accesses: AtomicUsize,
}

impl UserSpace {
    pub fn new() -> Self {
        Self {
            bytes: Mutex::new(BTreeMap::new()),
            accesses: AtomicUsize::new(0),
        }
    }

    pub fn map(&self, addr: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        for (offset, &byte) in data.iter().enumerate() {
            bytes.insert(addr + offset, byte);
        }
    }

    pub fn unmap_byte(&self, addr: usize) {
        self.bytes.lock().remove(&addr);
    }

    pub fn read(&self, addr: usize, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        (addr..addr + len)
            .map(|a| bytes.get(&a).copied().unwrap_or(0))
            .collect()
    }

    /// Loads and stores that reached the "hardware".
    pub fn hardware_accesses(&self) -> usize {
        self.accesses.load(Ordering::SeqCst)
    }
}

unsafe impl FaultingAccess for UserSpace {
    fn load(&self, addr: usize) -> Option<u8> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        self.bytes.lock().get(&addr).copied()
    }

    fn store(&self, addr: usize, value: u8) -> bool {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        match self.bytes.lock().get_mut(&addr) {
            Some(byte) => {
                *byte = value;
                true
            }
            None => false,
        }
    }
}

/// Accessed bits kept as a set of touched (thread, page) pairs.
pub struct AccessedSet {
    touched: Mutex<BTreeSet<(u64, u64)>>,
}

impl AccessedSet {
    pub fn new() -> Self {
        Self {
            touched: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn touch(&self, owner: ThreadId, uaddr: VirtAddr) {
        self.touched.lock().insert((owner.raw(), uaddr.as_u64()));
    }

    pub fn is_set(&self, owner: ThreadId, uaddr: VirtAddr) -> bool {
        self.touched.lock().contains(&(owner.raw(), uaddr.as_u64()))
    }
}

impl AccessedBits for AccessedSet {
    fn is_accessed(&self, owner: ThreadId, uaddr: VirtAddr) -> bool {
        self.is_set(owner, uaddr)
    }

    fn clear_accessed(&self, owner: ThreadId, uaddr: VirtAddr) {
        self.touched.lock().remove(&(owner.raw(), uaddr.as_u64()));
    }
}

/// Records writeback calls. Can be told to fail, or to block until released.
pub struct Writeback {
    calls: Mutex<Vec<(ThreadId, VirtAddr)>>,
    fail: AtomicBool,
    gated: AtomicBool,
    entered: AtomicBool,
    released: AtomicBool,
}

impl Writeback {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            entered: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<(ThreadId, VirtAddr)> {
        self.calls.lock().clone()
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Makes the next writebacks block until `release`.
    pub fn hold(&self) {
        self.released.store(false, Ordering::SeqCst);
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn wait_until_entered(&self) {
        while !self.entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl PageWriteback for Writeback {
    fn evict(&self, owner: ThreadId, uaddr: VirtAddr) -> bool {
        self.calls.lock().push((owner, uaddr));
        self.entered.store(true, Ordering::SeqCst);

        if self.gated.load(Ordering::SeqCst) {
            while !self.released.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        }

        !self.fail.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct Entry {
    frame: Option<FrameId>,
}

impl Entry {
    pub fn resident(frame: FrameId) -> Self {
        Self { frame: Some(frame) }
    }
}

impl PageEntry for Entry {
    fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    fn set_frame(&mut self, frame: Option<FrameId>) {
        self.frame = frame;
    }
}

#[derive(Debug, Default)]
pub struct Spt {
    pub entries: Vec<Entry>,
}

impl SupplementalTable for Spt {
    fn for_each_entry(&mut self, f: &mut dyn FnMut(&mut dyn PageEntry)) {
        for entry in &mut self.entries {
            f(entry);
        }
    }
}
