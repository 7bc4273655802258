// Physical Page Source
//
// Defines the collaborator the frame table draws fresh physical pages from,
// and the bitmap-backed implementation used by the kernel.
//
// Key responsibilities:
// - `PageSource`: obtain one kernel-addressable page honoring `AllocFlags`
//   (zero-fill, pool selection) or report exhaustion; release it later
// - `BitmapPageSource`: track a contiguous, kernel-mapped region one bit
//   per page (0 = free, 1 = allocated)
// - `PagePools`: route user-pool and kernel-pool requests to separate regions
//
// Implementation details:
// - Bitmap words are 64 bits wide and live behind a `spin::Mutex`
// - `next_free_hint` provides a simple next-fit search that wraps around
// - Zero-filling happens after the lock is dropped; the page is already
//   exclusively owned by the caller at that point
//
// Correctness and safety notes:
// - The region handed to `BitmapPageSource::new` must stay mapped and
//   unused by anything else for the lifetime of the source
// - Releasing an address outside the region, unaligned, or already free is
//   logged and ignored rather than corrupting the bitmap

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::{log_debug, log_info, log_warn};

pub const PAGE_SIZE: usize = 4096;

const BITS_PER_WORD: usize = u64::BITS as usize;
const LOG_ORIGIN: &str = "pmm";

bitflags! {
    /// Flags passed through to the page source on allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Fill the page with zeroes before handing it out.
        const ZERO = 1 << 0;
        /// Draw from the user pool instead of the kernel pool.
        const USER = 1 << 1;
    }
}

pub trait PageSource: Sync {
    /// Returns the kernel virtual base of a free page, or `None` when exhausted.
    fn obtain(&self, flags: AllocFlags) -> Option<VirtAddr>;

    /// Gives a page previously returned by `obtain` back to the source.
    fn release(&self, page: VirtAddr);
}

impl<T: PageSource + ?Sized> PageSource for &T {
    fn obtain(&self, flags: AllocFlags) -> Option<VirtAddr> {
        (**self).obtain(flags)
    }

    fn release(&self, page: VirtAddr) {
        (**self).release(page)
    }
}

/// Fills one page with zeroes.
///
/// # Safety
///
/// `page` must be the kernel-mapped base of a page the caller exclusively owns.
pub unsafe fn zero_page(page: VirtAddr) {
    core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
}

struct Bitmap {
    words: Vec<u64>,
    total: usize,
    free: usize,
    next_free_hint: usize,
}

impl Bitmap {
    fn new(total: usize) -> Self {
        Self {
            words: vec![0; total.div_ceil(BITS_PER_WORD)],
            total,
            free: total,
            next_free_hint: 0,
        }
    }

    fn is_page_free(&self, page: usize) -> bool {
        self.words[page / BITS_PER_WORD] & (1 << (page % BITS_PER_WORD)) == 0
    }

    fn set_page_allocated(&mut self, page: usize) {
        self.words[page / BITS_PER_WORD] |= 1 << (page % BITS_PER_WORD);
    }

    fn set_page_free(&mut self, page: usize) {
        self.words[page / BITS_PER_WORD] &= !(1 << (page % BITS_PER_WORD));
    }

    fn alloc_page(&mut self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }

        let start = self.next_free_hint;
        for offset in 0..self.total {
            let page = (start + offset) % self.total;
            if self.is_page_free(page) {
                self.set_page_allocated(page);
                self.free -= 1;
                self.next_free_hint = (page + 1) % self.total;
                return Some(page);
            }
        }

        None
    }
}

pub struct BitmapPageSource {
    base: VirtAddr,
    bitmap: Mutex<Bitmap>,
}

impl BitmapPageSource {
    /// Tracks `pages` pages starting at `base`.
    ///
    /// # Safety
    ///
    /// The region must be page aligned, mapped in the kernel address space,
    /// and owned exclusively by this source for as long as it lives.
    pub unsafe fn new(base: VirtAddr, pages: usize) -> Self {
        assert!(
            base.is_aligned(PAGE_SIZE as u64),
            "page source region must be page aligned"
        );

        log_info!(
            LOG_ORIGIN,
            "Page source initialized: base={:#X}, pages={}",
            base.as_u64(),
            pages
        );

        Self {
            base,
            bitmap: Mutex::new(Bitmap::new(pages)),
        }
    }

    pub fn contains(&self, page: VirtAddr) -> bool {
        let total = self.bitmap.lock().total;
        let end = self.base.as_u64() + (total * PAGE_SIZE) as u64;
        page >= self.base && page.as_u64() < end
    }

    /// `(total, free)` page counts.
    pub fn get_stats(&self) -> (usize, usize) {
        let bitmap = self.bitmap.lock();
        (bitmap.total, bitmap.free)
    }

    fn page_index(&self, page: VirtAddr) -> Option<usize> {
        if page < self.base || !page.is_aligned(PAGE_SIZE as u64) {
            return None;
        }
        Some(((page - self.base) as usize) / PAGE_SIZE)
    }
}

impl PageSource for BitmapPageSource {
    fn obtain(&self, flags: AllocFlags) -> Option<VirtAddr> {
        let index = self.bitmap.lock().alloc_page()?;
        let page = self.base + (index * PAGE_SIZE) as u64;

        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the page lies in the region promised to `new` and was
            // just marked allocated, so nobody else references it.
            unsafe { zero_page(page) };
        }

        Some(page)
    }

    fn release(&self, page: VirtAddr) {
        let Some(index) = self.page_index(page) else {
            log_warn!(
                LOG_ORIGIN,
                "Ignoring release of unaligned or foreign page {:#X}",
                page.as_u64()
            );
            return;
        };

        let mut bitmap = self.bitmap.lock();
        if index >= bitmap.total {
            drop(bitmap);
            log_warn!(
                LOG_ORIGIN,
                "Ignoring release of page {:#X} outside the region",
                page.as_u64()
            );
            return;
        }

        if bitmap.is_page_free(index) {
            drop(bitmap);
            log_warn!(LOG_ORIGIN, "Double release of page {:#X}", page.as_u64());
            return;
        }

        bitmap.set_page_free(index);
        bitmap.free += 1;
    }
}

/// Kernel and user pools, selected by `AllocFlags::USER`.
pub struct PagePools {
    kernel: BitmapPageSource,
    user: BitmapPageSource,
}

impl PagePools {
    pub fn new(kernel: BitmapPageSource, user: BitmapPageSource) -> Self {
        Self { kernel, user }
    }

    pub fn kernel_pool(&self) -> &BitmapPageSource {
        &self.kernel
    }

    pub fn user_pool(&self) -> &BitmapPageSource {
        &self.user
    }
}

impl PageSource for PagePools {
    fn obtain(&self, flags: AllocFlags) -> Option<VirtAddr> {
        if flags.contains(AllocFlags::USER) {
            self.user.obtain(flags)
        } else {
            self.kernel.obtain(flags)
        }
    }

    fn release(&self, page: VirtAddr) {
        if self.user.contains(page) {
            self.user.release(page);
        } else if self.kernel.contains(page) {
            self.kernel.release(page);
        } else {
            log_debug!(
                LOG_ORIGIN,
                "Page {:#X} belongs to neither pool",
                page.as_u64()
            );
        }
    }
}
