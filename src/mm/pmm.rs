//! Page-based host memory allocation.
//!
//! The allocator is a binary buddy: the same scheme Linux runs for physical
//! pages, described in [Chapter 6  Physical Page Allocation].
//!
//! A [`Pmm`] manages one contiguous host region. For every order `k` in
//! `0..=MAX_ORDER` it keeps a free list of `2^k`-page blocks, the list nodes
//! written into the free blocks themselves, and a packed bitset with one bit
//! per order-`k` block, set iff that block is currently allocated *at* order
//! `k`. The bitsets and the control structure live at the high end of the
//! managed region, so the handle itself stays trivially movable.
//!
//! ## Allocation API
//!
//! | API | Description |
//! | --- | ----------- |
//! | [`alloc_pages`] | Allocate a power-of-two number of contiguous pages |
//! | [`alloc_pages_min`] | Allocate the largest power-of-two count in a range |
//! | [`free_pages`] | Free a run; its size is deduced from the bitsets |
//!
//! All addresses returned are host addresses aligned to the run size.
//!
//! [Chapter 6  Physical Page Allocation]: https://www.kernel.org/doc/gorman/html/understand/understand009.html
//! [`alloc_pages`]: Pmm::alloc_pages
//! [`alloc_pages_min`]: Pmm::alloc_pages_min
//! [`free_pages`]: Pmm::free_pages

use core::mem::size_of;

use log::debug;
use spin::Mutex;
use static_assertions as sa;

use crate::host::HostMem;
use crate::mm::{MemError, PAGE_SIZE, PAGE_SIZE_BITS};
use crate::util::align::{align_down, align_up, floor_log2, is_aligned};
use crate::util::bit::{clear_bit, set_bit, test_bit};
use crate::util::list::{self, List};

/// Largest allocation order: a single request can span `2^MAX_ORDER` pages.
pub const MAX_ORDER: usize = 8;

const ORDER_COUNT: usize = MAX_ORDER + 1;

/// Usable memory starts aligned to the largest block size, so every block's
/// host address is naturally aligned to its own size and buddy pairs differ
/// in exactly one address bit.
const BLOCK_ALIGN_ORDER: usize = PAGE_SIZE_BITS + MAX_ORDER;

// A free block must be able to hold its embedded list node.
sa::const_assert!(size_of::<List>() <= PAGE_SIZE);

#[repr(C)]
struct FreeArea {
    free_list: List,
    bitmap: *mut u8,
}

/// Control structure, placed inside the managed region right below its high
/// end. Keeping it (and with it the free-list ring heads) at a fixed address
/// lets the [`Pmm`] handle move freely.
#[repr(C)]
struct PmmCtl {
    free_areas: [FreeArea; ORDER_COUNT],
    /// Bytes currently free across all orders.
    free_size: usize,
    /// Usable range, page aligned, below the bitsets.
    start: usize,
    end: usize,
}

struct CtlRef(*mut PmmCtl);

// The control structure is only reached through the mutex.
unsafe impl Send for CtlRef {}

/// Buddy allocator over one contiguous host region.
pub struct Pmm {
    ctl: Mutex<CtlRef>,
    cap: usize,
    /// Present when the region was mapped by [`Pmm::create_from_os`].
    backing: Option<HostMem>,
}

impl Pmm {
    /// Create a buddy allocator over the caller-provided region
    /// `[ptr, ptr + len)`.
    ///
    /// Fails with [`MemError::OutOfMemory`] when the region cannot hold the
    /// control structure, the per-order bitsets and at least one usable block.
    ///
    /// # Safety
    ///
    /// The region must be readable and writable, must outlive the returned
    /// handle, and must not be accessed by anything else while the handle
    /// lives.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Result<Pmm, MemError> {
        let ctl = init_region(ptr as usize, len)?;
        let cap = (*ctl).end - (*ctl).start;
        Ok(Pmm {
            ctl: Mutex::new(CtlRef(ctl)),
            cap,
            backing: None,
        })
    }

    /// Create a buddy allocator over a fresh OS mapping of at least `len`
    /// bytes. The mapping is released when the handle drops.
    pub fn create_from_os(len: usize) -> Result<Pmm, MemError> {
        let backing = HostMem::map(len)?;
        let mut pmm = unsafe { Pmm::new(backing.addr() as *mut u8, backing.len())? };
        pmm.backing = Some(backing);
        Ok(pmm)
    }

    /// Allocate `npages` contiguous pages. `npages` must be a positive power
    /// of two; a count above `2^MAX_ORDER` or an exhausted region yields 0.
    ///
    /// The returned address is aligned to `npages * PAGE_SIZE`. The run stays
    /// a single unit: it must later be released with [`Pmm::free_pages`] as a
    /// whole.
    pub fn alloc_pages(&self, npages: usize) -> usize {
        assert!(npages.is_power_of_two(), "npages must be a power of two");
        let order = floor_log2(npages);
        if order > MAX_ORDER {
            return 0;
        }

        let mut ctl = self.ctl.lock();
        unsafe { alloc_order(&mut *ctl.0, order) }
    }

    /// Allocate the largest power-of-two page count that fits, between `min`
    /// and `*npages` (both rounded to powers of two). On success `*npages` is
    /// updated to the count actually reserved; on exhaustion returns 0 and
    /// leaves `*npages` untouched.
    pub fn alloc_pages_min(&self, npages: &mut usize, min: usize) -> usize {
        debug_assert!(*npages > 0 && min > 0 && min <= *npages);
        let min = min.next_power_of_two();
        if min > 1 << MAX_ORDER {
            return 0;
        }
        let mut n = (*npages).next_power_of_two().min(1 << MAX_ORDER);
        loop {
            let addr = self.alloc_pages(n);
            if addr != 0 {
                *npages = n;
                return addr;
            }
            if n <= min {
                return 0;
            }
            n >>= 1;
        }
    }

    /// Free the run starting at `addr`. The run's size is deduced from the
    /// order bitsets, so `addr` must be exactly a value previously returned by
    /// [`Pmm::alloc_pages`] (or [`Pmm::alloc_pages_min`]) and not yet freed.
    pub fn free_pages(&self, addr: usize) {
        if addr == 0 {
            debug_assert!(false);
            return;
        }

        let mut ctl = self.ctl.lock();
        unsafe { free_block(&mut *ctl.0, addr) }
    }

    /// Total bytes managed (allocated or free).
    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Bytes currently free, across all orders.
    pub fn avail_total(&self) -> usize {
        let ctl = self.ctl.lock();
        unsafe { (*ctl.0).free_size }
    }

    /// Size in bytes of the largest run a single allocation could currently
    /// obtain.
    pub fn avail_maxregion(&self) -> usize {
        let ctl = self.ctl.lock();
        unsafe {
            let ctl = &*ctl.0;
            for k in (0..ORDER_COUNT).rev() {
                if !list::is_empty(&ctl.free_areas[k].free_list) {
                    return PAGE_SIZE << k;
                }
            }
        }
        0
    }

    /// Log the per-order free-list population. Debugging aid.
    pub fn dump(&self) {
        let ctl = self.ctl.lock();
        unsafe {
            let ctl = &*ctl.0;
            debug!(
                "pmm: {:#x}..{:#x}, {} of {} bytes free",
                ctl.start,
                ctl.end,
                ctl.free_size,
                ctl.end - ctl.start
            );
            for (k, area) in ctl.free_areas.iter().enumerate() {
                let n = list::count(&area.free_list);
                if n != 0 {
                    debug!("  order {:>2}: {} free block(s)", k, n);
                }
            }
        }
    }
}

////////////////////// Inner Impl ///////////////////////////

/// Carve control structure, bitsets and the usable range out of the raw
/// region, then seed the free lists.
unsafe fn init_region(region: usize, len: usize) -> Result<*mut PmmCtl, MemError> {
    let base = align_up(region, BLOCK_ALIGN_ORDER);
    let region_end = region + len;
    let ctl_addr = align_down(
        region_end.saturating_sub(size_of::<PmmCtl>()),
        crate::util::align::get_order(core::mem::align_of::<PmmCtl>()),
    );
    if ctl_addr <= base {
        return Err(MemError::OutOfMemory);
    }

    // Size the per-order bitsets against an upper bound of the page count;
    // two spare bytes per order absorb the past-the-end buddy sentinel.
    let npages_max = (ctl_addr - base) >> PAGE_SIZE_BITS;
    let ctl = ctl_addr as *mut PmmCtl;
    let mut cursor = ctl_addr;
    for k in 0..ORDER_COUNT {
        let nbytes = ((npages_max >> k) + 7) / 8 + 2;
        cursor = match cursor.checked_sub(nbytes) {
            Some(c) if c > base => c,
            _ => return Err(MemError::OutOfMemory),
        };
        (*ctl).free_areas[k].bitmap = cursor as *mut u8;
        (*ctl).free_areas[k].free_list = List::new();
        list::init_empty(&mut (*ctl).free_areas[k].free_list);
    }
    (cursor as *mut u8).write_bytes(0, ctl_addr - cursor);

    let end = align_down(cursor, PAGE_SIZE_BITS);
    if end <= base {
        return Err(MemError::OutOfMemory);
    }
    (*ctl).free_size = 0;
    (*ctl).start = base;
    (*ctl).end = end;

    seed(&mut *ctl);
    Ok(ctl)
}

/// Seed the free lists: repeatedly take the largest power-of-two page count
/// that fits in the remaining usable span, capped at `2^MAX_ORDER`.
///
/// Below `MAX_ORDER`, seed orders strictly decrease, so a seeded block's
/// buddy is never a single same-order block: it is either carved into
/// smaller seeds or truncated by the region end. Its bit is set as a
/// sentinel so merging always stops at the seed boundary. (At `MAX_ORDER`
/// adjacent seeds *are* real buddy pairs, but merging never runs past the
/// top order, so no sentinel is needed.)
unsafe fn seed(ctl: &mut PmmCtl) {
    let mut cur = ctl.start;
    while cur < ctl.end {
        let remain_pages = (ctl.end - cur) >> PAGE_SIZE_BITS;
        let order = MAX_ORDER.min(floor_log2(remain_pages));
        let size = PAGE_SIZE << order;
        debug_assert!(is_aligned(cur - ctl.start, PAGE_SIZE_BITS + order));

        list::head_append(&mut ctl.free_areas[order].free_list, cur as *mut List);
        ctl.free_size += size;

        if order < MAX_ORDER {
            let buddy = buddy_of(ctl, cur, order);
            set_bit(ctl.free_areas[order].bitmap, block_index(ctl, buddy, order));
        }
        cur += size;
    }
}

#[inline(always)]
fn block_index(ctl: &PmmCtl, addr: usize, order: usize) -> usize {
    (addr - ctl.start) >> (PAGE_SIZE_BITS + order)
}

/// The same-order neighbor this block merges with: one address bit apart,
/// computed on offsets from the usable base.
#[inline(always)]
fn buddy_of(ctl: &PmmCtl, addr: usize, order: usize) -> usize {
    ctl.start + ((addr - ctl.start) ^ (PAGE_SIZE << order))
}

#[inline(always)]
unsafe fn test_block_bit(ctl: &PmmCtl, addr: usize, order: usize) -> bool {
    test_bit(ctl.free_areas[order].bitmap, block_index(ctl, addr, order))
}

#[inline(always)]
unsafe fn set_block_bit(ctl: &mut PmmCtl, addr: usize, order: usize) {
    set_bit(ctl.free_areas[order].bitmap, block_index(ctl, addr, order));
}

#[inline(always)]
unsafe fn clear_block_bit(ctl: &mut PmmCtl, addr: usize, order: usize) {
    clear_bit(ctl.free_areas[order].bitmap, block_index(ctl, addr, order));
}

/// Pop a block of `order`, splitting a larger block when the order's own free
/// list is empty. Splitting marks the kept (low) half allocated at every order
/// it passes through; the split-off high halves go back on their free lists
/// with clear bits. The net effect is the order-deduction invariant: walking
/// the bitsets upward from order 0, the first set bit for an allocated address
/// is at its allocation order.
unsafe fn alloc_order(ctl: &mut PmmCtl, order: usize) -> usize {
    for k in order..ORDER_COUNT {
        let node = list::pop_front(&mut ctl.free_areas[k].free_list);
        if node.is_null() {
            continue;
        }
        let block = node as usize;
        set_block_bit(ctl, block, k);

        let mut size = PAGE_SIZE << k;
        for j in (order..k).rev() {
            size >>= 1;
            let buddy = block + size;
            list::head_append(&mut ctl.free_areas[j].free_list, buddy as *mut List);
            set_block_bit(ctl, block, j);
        }

        ctl.free_size -= PAGE_SIZE << order;
        return block;
    }
    0
}

/// Free one run, deducing its order by probing the bitsets upward, then merge
/// with free buddies as far as possible.
unsafe fn free_block(ctl: &mut PmmCtl, addr: usize) {
    assert!(
        addr >= ctl.start && addr < ctl.end && is_aligned(addr, PAGE_SIZE_BITS),
        "free of foreign address {:#x}",
        addr
    );

    // An allocation at order k has its order-k bit set and, below k, only
    // bits belonging to other blocks; the first set bit found going up is
    // this run's allocation order.
    let mut order = 0usize;
    while order <= MAX_ORDER && !test_block_bit(ctl, addr, order) {
        order += 1;
    }
    assert!(order <= MAX_ORDER, "free of unallocated address {:#x}", addr);

    ctl.free_size += PAGE_SIZE << order;
    clear_block_bit(ctl, addr, order);

    let mut block = addr;
    while order < MAX_ORDER {
        let buddy = buddy_of(ctl, block, order);
        if test_block_bit(ctl, buddy, order) {
            // Buddy allocated (or the past-the-end sentinel).
            break;
        }
        list::delete(buddy as *mut List);
        block = block.min(buddy);
        order += 1;
        debug_assert!(test_block_bit(ctl, block, order));
        clear_block_bit(ctl, block, order);
    }
    list::head_append(&mut ctl.free_areas[order].free_list, block as *mut List);
}
