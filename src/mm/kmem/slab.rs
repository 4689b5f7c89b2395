//! Size-class slab heaps.
//!
//! One [`SlabHeap`] per power-of-two size class. Each heap owns blocks of
//! exactly `SLABHEAP_BLOCK_SIZE` bytes, naturally aligned, carved from the
//! sub-heaps. A block starts with its header; the rest is a bump region of
//! equal-size chunks. Freed chunks thread a singly linked recycle list
//! through themselves. A block lives on its class's *usable* list while at
//! least one chunk is free, and moves to the *full* list when the bump region
//! is spent and the recycle list is empty.
//!
//! Freeing recovers the owning block by masking the chunk address with
//! [`SLABHEAP_BLOCK_MASK`]; that is what the natural alignment buys.

use core::mem::size_of;
use core::ptr::null_mut;

use static_assertions as sa;

use crate::mm::PAGE_SIZE;
use crate::util::align::align_up_by;
use crate::util::forward_list::{self, ForwardList};

/// Smallest slab chunk size.
pub const SLABHEAP_MIN_SIZE: usize = 8;
/// Number of size classes: `SLABHEAP_MIN_SIZE << i` for `i < SLABHEAP_COUNT`.
pub const SLABHEAP_COUNT: usize = 7;
/// Largest slab chunk size; bigger requests fall through to the sub-heaps.
pub const SLABHEAP_MAX_SIZE: usize = SLABHEAP_MIN_SIZE << (SLABHEAP_COUNT - 1);
/// Slab block size. A multiple of the page size, and blocks are always
/// allocated at this alignment.
pub const SLABHEAP_BLOCK_SIZE: usize = 4 * PAGE_SIZE;
/// Recovers a block address from any chunk address inside it.
pub const SLABHEAP_BLOCK_MASK: usize = !(SLABHEAP_BLOCK_SIZE - 1);

sa::const_assert!(SLABHEAP_BLOCK_SIZE % PAGE_SIZE == 0);
sa::const_assert!(SLABHEAP_MAX_SIZE * 2 <= SLABHEAP_BLOCK_SIZE);
// A freed chunk must be able to hold the recycle link.
sa::const_assert!(SLABHEAP_MIN_SIZE >= size_of::<ForwardList>());

/// Block header, at the start of every block.
#[repr(C)]
struct SlabBlock {
    /// Neighbors on the class's usable or full list.
    next: *mut SlabBlock,
    prev: *mut SlabBlock,
    /// Freed chunks, threaded through the chunks themselves.
    recycle: ForwardList,
    /// Chunks the block holds in total.
    cap: u32,
    /// Chunks ever handed out from the bump region.
    len: u32,
}

sa::const_assert!(size_of::<SlabBlock>() <= SLABHEAP_MIN_SIZE * 4);

/// First chunk offset for a class: the header rounded up to the chunk size,
/// which keeps every chunk naturally aligned inside the aligned block.
#[inline(always)]
fn data_offset(size: usize) -> usize {
    align_up_by(size_of::<SlabBlock>(), size)
}

pub(crate) struct SlabHeap {
    /// Chunk size of this class.
    size: usize,
    /// Blocks with at least one free chunk.
    usable: *mut SlabBlock,
    /// Blocks with no free chunk.
    full: *mut SlabBlock,
}

impl SlabHeap {
    pub const fn new(size: usize) -> SlabHeap {
        SlabHeap {
            size,
            usable: null_mut(),
            full: null_mut(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the class has a block that can serve an allocation right away.
    #[inline]
    pub fn has_usable(&self) -> bool {
        !self.usable.is_null()
    }

    /// Take one chunk from the first usable block, recycled chunks first.
    /// Returns `None` when every block is full (the caller grows the class
    /// with [`SlabHeap::add_block`]).
    pub fn alloc(&mut self) -> Option<usize> {
        let block = self.usable;
        if block.is_null() {
            return None;
        }
        unsafe {
            let chunk = if !(*block).recycle.is_empty() {
                forward_list::pop_next(&mut (*block).recycle) as usize
            } else {
                debug_assert!((*block).len < (*block).cap);
                let chunk =
                    block as usize + data_offset(self.size) + (*block).len as usize * self.size;
                (*block).len += 1;
                chunk
            };
            if (*block).recycle.is_empty() && (*block).len == (*block).cap {
                unlink(&mut self.usable, block);
                push(&mut self.full, block);
            }
            Some(chunk)
        }
    }

    /// Return `chunk` to its owning block. If the block was full it moves
    /// back to the usable list, unlinked from wherever it sits on the full
    /// list.
    pub fn free(&mut self, chunk: usize) {
        let block = (chunk & SLABHEAP_BLOCK_MASK) as *mut SlabBlock;
        unsafe {
            debug_assert!(chunk >= block as usize + data_offset(self.size));
            debug_assert!(
                (chunk - block as usize - data_offset(self.size)) % self.size == 0
            );
            let was_full = (*block).recycle.is_empty() && (*block).len == (*block).cap;
            if was_full {
                unlink(&mut self.full, block);
                push(&mut self.usable, block);
            }
            forward_list::insert_after(&mut (*block).recycle, chunk as *mut ForwardList);
        }
    }

    /// Adopt a fresh `SLABHEAP_BLOCK_SIZE`-byte, naturally aligned region as
    /// a block of this class.
    ///
    /// # Safety
    ///
    /// The region must be writable, unused and owned by this heap from now
    /// on.
    pub unsafe fn add_block(&mut self, addr: usize) {
        debug_assert!(addr & !SLABHEAP_BLOCK_MASK == 0);
        let block = addr as *mut SlabBlock;
        (*block).recycle = ForwardList::new_empty();
        (*block).cap = ((SLABHEAP_BLOCK_SIZE - data_offset(self.size)) / self.size) as u32;
        (*block).len = 0;
        push(&mut self.usable, block);
    }
}

unsafe fn push(head: &mut *mut SlabBlock, block: *mut SlabBlock) {
    (*block).prev = null_mut();
    (*block).next = *head;
    if !(*head).is_null() {
        (**head).prev = block;
    }
    *head = block;
}

unsafe fn unlink(head: &mut *mut SlabBlock, block: *mut SlabBlock) {
    if (*block).prev.is_null() {
        debug_assert!(*head == block);
        *head = (*block).next;
    } else {
        (*(*block).prev).next = (*block).next;
    }
    if !(*block).next.is_null() {
        (*(*block).next).prev = (*block).prev;
    }
}
