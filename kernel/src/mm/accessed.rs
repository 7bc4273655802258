// Accessed-Bit Accessor
//
// The clock sweep needs exactly two questions answered about a resident
// page: "has the hardware touched it since we last looked?" and "forget that
// it was touched". This module defines that collaborator and the x86_64
// implementation that answers it by walking the owner's page tables.
//
// Implementation details:
// - `AddressSpaceLookup` resolves a thread to the physical address of its
//   PML4; the thread layer owns that mapping
// - Page-table frames are reached through the kernel's linear map of physical
//   memory at `phys_offset`
// - The walk stops at the first non-present entry, and treats a huge-page
//   entry as the leaf
// - Clearing the bit invalidates the TLB entry for the page, so the next
//   access sets it again
//
// Correctness and safety notes:
// - The MMU writes ACCESSED and DIRTY into the same entries concurrently, so
//   entries are only ever touched as `AtomicU64` words: one load to read, one
//   `fetch_and` to clear. A plain read-modify-write could drop a DIRTY bit
//   set in between, and the page would then be evicted without being saved
// - No `&mut PageTable` is ever formed over a live hierarchy
// - Constructing a walker is `unsafe` because every physical address it
//   meets must be reachable through `phys_offset`

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::structures::paging::{PageTableFlags, PageTableIndex};
use x86_64::{PhysAddr, VirtAddr};

use crate::thread::ThreadId;

pub trait AccessedBits: Sync {
    fn is_accessed(&self, owner: ThreadId, uaddr: VirtAddr) -> bool;
    fn clear_accessed(&self, owner: ThreadId, uaddr: VirtAddr);
}

impl<T: AccessedBits + ?Sized> AccessedBits for &T {
    fn is_accessed(&self, owner: ThreadId, uaddr: VirtAddr) -> bool {
        (**self).is_accessed(owner, uaddr)
    }

    fn clear_accessed(&self, owner: ThreadId, uaddr: VirtAddr) {
        (**self).clear_accessed(owner, uaddr)
    }
}

pub trait AddressSpaceLookup: Sync {
    /// Physical address of the PML4 backing `owner`'s address space.
    fn root_table(&self, owner: ThreadId) -> Option<PhysAddr>;
}

impl<F> AddressSpaceLookup for F
where
    F: Fn(ThreadId) -> Option<PhysAddr> + Sync,
{
    fn root_table(&self, owner: ThreadId) -> Option<PhysAddr> {
        self(owner)
    }
}

pub struct PageTableWalker<L> {
    lookup: L,
    phys_offset: VirtAddr,
}

impl<L: AddressSpaceLookup> PageTableWalker<L> {
    /// # Safety
    ///
    /// All physical memory holding page tables must be mapped at
    /// `phys_offset`, and the tables must outlive the walker.
    pub unsafe fn new(lookup: L, phys_offset: VirtAddr) -> Self {
        Self {
            lookup,
            phys_offset,
        }
    }

    /// The entry word at `index` of the table at `table`.
    fn entry_at(&self, table: PhysAddr, index: PageTableIndex) -> &AtomicU64 {
        let base: *const AtomicU64 = (self.phys_offset + table.as_u64()).as_ptr();
        // SAFETY: `new` guarantees the table is reachable through the linear
        // map and outlives `self`; a table is 512 naturally aligned words.
        unsafe { &*base.add(usize::from(index)) }
    }

    /// The present leaf entry mapping `uaddr`, if any.
    fn leaf(&self, owner: ThreadId, uaddr: VirtAddr) -> Option<&AtomicU64> {
        let indices: [PageTableIndex; 4] = [
            uaddr.p4_index(),
            uaddr.p3_index(),
            uaddr.p2_index(),
            uaddr.p1_index(),
        ];

        let mut table = self.lookup.root_table(owner)?;
        for (level, index) in indices.into_iter().enumerate() {
            let entry = self.entry_at(table, index);
            let word = entry.load(Ordering::Acquire);
            let flags = PageTableFlags::from_bits_truncate(word);

            if !flags.contains(PageTableFlags::PRESENT) {
                return None;
            }
            if level == indices.len() - 1 || flags.contains(PageTableFlags::HUGE_PAGE) {
                return Some(entry);
            }

            table = PhysAddr::new(word & ENTRY_ADDR_MASK);
        }

        None
    }
}

/// Physical address bits of a page-table entry.
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

impl<L: AddressSpaceLookup> AccessedBits for PageTableWalker<L> {
    fn is_accessed(&self, owner: ThreadId, uaddr: VirtAddr) -> bool {
        self.leaf(owner, uaddr).is_some_and(|entry| {
            PageTableFlags::from_bits_truncate(entry.load(Ordering::Acquire))
                .contains(PageTableFlags::ACCESSED)
        })
    }

    fn clear_accessed(&self, owner: ThreadId, uaddr: VirtAddr) {
        let Some(entry) = self.leaf(owner, uaddr) else {
            return;
        };
        entry.fetch_and(!PageTableFlags::ACCESSED.bits(), Ordering::AcqRel);

        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        x86_64::instructions::tlb::flush(uaddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use x86_64::structures::paging::PageTable;

    /// Four linked tables mapping one user page, with the host heap standing
    /// in for physical memory (offset zero).
    struct Hierarchy {
        tables: Vec<Box<PageTable>>,
    }

    impl Hierarchy {
        fn mapping(uaddr: VirtAddr, leaf_flags: PageTableFlags) -> Self {
            let mut tables: Vec<Box<PageTable>> = (0..4).map(|_| Box::new(PageTable::new())).collect();
            let indices = [
                uaddr.p4_index(),
                uaddr.p3_index(),
                uaddr.p2_index(),
                uaddr.p1_index(),
            ];
            let link = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

            for level in 0..3 {
                let child = PhysAddr::new(&*tables[level + 1] as *const PageTable as u64);
                tables[level][indices[level]].set_addr(child, link);
            }
            tables[3][indices[3]].set_addr(PhysAddr::new(0x5000), leaf_flags);

            Self { tables }
        }

        fn root(&self) -> PhysAddr {
            PhysAddr::new(&*self.tables[0] as *const PageTable as u64)
        }
    }

    #[test]
    fn reads_and_clears_the_leaf_accessed_bit() {
        let owner = ThreadId::from_raw(11);
        let uaddr = VirtAddr::new(0x40_3000);
        let hierarchy = Hierarchy::mapping(
            uaddr,
            PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::ACCESSED,
        );
        let root = hierarchy.root();
        let lookup = move |tid: ThreadId| (tid == owner).then_some(root);
        let walker = unsafe { PageTableWalker::new(lookup, VirtAddr::new(0)) };

        assert!(walker.is_accessed(owner, uaddr));
        walker.clear_accessed(owner, uaddr);
        assert!(!walker.is_accessed(owner, uaddr));

        let leaf = &hierarchy.tables[3][uaddr.p1_index()];
        assert!(leaf.flags().contains(PageTableFlags::PRESENT));
        assert_eq!(leaf.addr(), PhysAddr::new(0x5000));
    }

    #[test]
    fn unmapped_pages_and_unknown_threads_read_as_untouched() {
        let owner = ThreadId::from_raw(12);
        let uaddr = VirtAddr::new(0x40_3000);
        let hierarchy = Hierarchy::mapping(uaddr, PageTableFlags::PRESENT | PageTableFlags::ACCESSED);
        let root = hierarchy.root();
        let lookup = move |tid: ThreadId| (tid == owner).then_some(root);
        let walker = unsafe { PageTableWalker::new(lookup, VirtAddr::new(0)) };

        assert!(!walker.is_accessed(owner, VirtAddr::new(0x40_4000)));
        assert!(!walker.is_accessed(ThreadId::from_raw(99), uaddr));
        walker.clear_accessed(ThreadId::from_raw(99), uaddr);
        assert!(walker.is_accessed(owner, uaddr));
    }

    #[test]
    fn dirty_bits_set_by_hardware_survive_concurrent_clears() {
        let owner = ThreadId::from_raw(13);
        let uaddr = VirtAddr::new(0x40_3000);
        let hierarchy = Hierarchy::mapping(uaddr, PageTableFlags::PRESENT | PageTableFlags::ACCESSED);
        let root = hierarchy.root();
        let lookup = move |tid: ThreadId| (tid == owner).then_some(root);
        let walker = unsafe { PageTableWalker::new(lookup, VirtAddr::new(0)) };

        let leaf = &hierarchy.tables[3][uaddr.p1_index()] as *const _ as *const AtomicU64;
        // SAFETY: a page-table entry is a transparent u64; the MMU stand-in
        // below only ever touches it atomically.
        let mmu = unsafe { &*leaf };

        thread::scope(|s| {
            s.spawn(|| {
                for round in 0..20_000 {
                    mmu.fetch_or(PageTableFlags::ACCESSED.bits(), Ordering::AcqRel);
                    if round == 10_000 {
                        mmu.fetch_or(PageTableFlags::DIRTY.bits(), Ordering::AcqRel);
                    }
                }
            });
            for _ in 0..20_000 {
                walker.clear_accessed(owner, uaddr);
            }
        });

        let flags = PageTableFlags::from_bits_truncate(mmu.load(Ordering::Acquire));
        assert!(flags.contains(PageTableFlags::DIRTY | PageTableFlags::PRESENT));
        walker.clear_accessed(owner, uaddr);
        assert!(!walker.is_accessed(owner, uaddr));
    }
}
