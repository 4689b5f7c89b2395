//! Bitmap-indexed sub-heap: chunk-granular allocation inside one page run.
//!
//! A sub-heap owns a run obtained from the page manager. The low end of the
//! run is the chunk region, the high end holds a packed bitset with one bit
//! per chunk (set iff the chunk is in use). A multi-chunk allocation occupies
//! a contiguous run of chunks; the sub-heap does **not** record run lengths,
//! so deallocation is told the size by the caller.

use crate::mm::PAGE_SIZE_BITS;
use crate::util::align::{align_up_by, get_order, is_aligned};
use crate::util::bit::{clear_bits, set_bits, test_bit};

/// Sub-heap accounting granule. One machine word of bitset tracks one
/// word-size batch of chunks, hence 8 bytes per word of payload per bit.
pub const CHUNK_SIZE: usize = 8 * core::mem::size_of::<usize>();

/// Requests of at least this many chunks use best fit; smaller ones take the
/// first qualifying run.
pub const BEST_FIT_THRESHOLD: usize = 4;

pub(crate) struct SubHeap {
    /// Chunk region base: the run's start address. Page aligned, and (being a
    /// buddy run) naturally aligned to the run size.
    chunks: usize,
    /// In-use bitset at the high end of the run.
    bitset: *mut u8,
    chunk_cap: usize,
    chunk_len: usize,
    npages: usize,
}

impl SubHeap {
    /// Lay a sub-heap over the run `[run_addr, run_addr + npages * PAGE_SIZE)`.
    ///
    /// # Safety
    ///
    /// The run must be writable, unused, and owned by the caller for the
    /// sub-heap's lifetime.
    pub unsafe fn new(run_addr: usize, npages: usize) -> SubHeap {
        debug_assert!(is_aligned(run_addr, PAGE_SIZE_BITS));
        let total = npages << PAGE_SIZE_BITS;
        let chunk_cap = max_cap(total);
        let bitset_len = (chunk_cap + 7) / 8;
        let bitset = (run_addr + total - bitset_len) as *mut u8;
        bitset.write_bytes(0, bitset_len);
        SubHeap {
            chunks: run_addr,
            bitset,
            chunk_cap,
            chunk_len: 0,
            npages,
        }
    }

    /// Allocate at least `size` bytes at the given power-of-two `alignment`.
    /// Returns the address and the number of bytes actually reserved (a
    /// multiple of `CHUNK_SIZE`), or `None` when no qualifying run exists.
    pub fn alloc(&mut self, size: usize, alignment: usize) -> Option<(usize, usize)> {
        debug_assert!(size > 0 && alignment.is_power_of_two());
        let nchunks = (size + CHUNK_SIZE - 1) / CHUNK_SIZE;
        let chunks_align = (alignment / CHUNK_SIZE).max(1);
        if self.chunk_cap - self.chunk_len < nchunks {
            return None;
        }
        // Chunk strides only deliver the promised alignment when the region
        // base carries it as well.
        debug_assert!(chunks_align == 1 || is_aligned(self.chunks, get_order(alignment)));

        let start = self.find_run(nchunks, chunks_align)?;
        unsafe {
            set_bits(self.bitset, start, nchunks);
        }
        self.chunk_len += nchunks;
        Some((self.chunks + start * CHUNK_SIZE, nchunks * CHUNK_SIZE))
    }

    /// Free the `size`-byte allocation at `addr`. `size` must be the reserved
    /// size the matching [`SubHeap::alloc`] reported.
    pub fn free(&mut self, addr: usize, size: usize) {
        assert!(size > 0 && size % CHUNK_SIZE == 0);
        debug_assert!(self.contains(addr));
        debug_assert!(is_aligned(addr - self.chunks, get_order(CHUNK_SIZE)));
        let index = (addr - self.chunks) / CHUNK_SIZE;
        let nchunks = size / CHUNK_SIZE;
        unsafe {
            assert!(test_bit(self.bitset, index), "free of unallocated chunk");
            clear_bits(self.bitset, index, nchunks);
        }
        self.chunk_len -= nchunks;
    }

    /// Whether `addr` falls inside this sub-heap's chunk region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.chunks && addr < self.chunks + self.chunk_cap * CHUNK_SIZE
    }

    /// Bytes not currently reserved.
    #[inline]
    pub fn avail(&self) -> usize {
        (self.chunk_cap - self.chunk_len) * CHUNK_SIZE
    }

    /// Total chunk-region bytes.
    #[inline]
    pub fn cap(&self) -> usize {
        self.chunk_cap * CHUNK_SIZE
    }

    #[inline]
    pub fn run_addr(&self) -> usize {
        self.chunks
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Search the bitset for a run of `nchunks` clear bits starting at a
    /// multiple of `stride`. Small requests take the first qualifying run;
    /// large ones take the smallest qualifying run, ties broken by lowest
    /// index.
    fn find_run(&self, nchunks: usize, stride: usize) -> Option<usize> {
        let best_fit = nchunks >= BEST_FIT_THRESHOLD;
        let mut best: Option<(usize, usize)> = None; // (width, start)

        let mut i = 0usize;
        while i < self.chunk_cap {
            if unsafe { test_bit(self.bitset, i) } {
                i += 1;
                continue;
            }
            let run_start = i;
            while i < self.chunk_cap && !(unsafe { test_bit(self.bitset, i) }) {
                i += 1;
            }
            let run_end = i;

            let cand = align_up_by(run_start, stride);
            if cand + nchunks <= run_end {
                if !best_fit {
                    return Some(cand);
                }
                let width = run_end - run_start;
                match best {
                    Some((w, _)) if w <= width => {}
                    _ => best = Some((width, cand)),
                }
            }
        }
        best.map(|(_, start)| start)
    }
}

/// Largest chunk count whose chunk region plus bitset fits in `total` bytes.
fn max_cap(total: usize) -> usize {
    let fits = |cap: usize| cap * CHUNK_SIZE + (cap + 7) / 8 <= total;
    let mut lo = 0usize;
    let mut hi = total / CHUNK_SIZE;
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostMem;
    use crate::mm::PAGE_SIZE;

    fn mkheap(npages: usize) -> (HostMem, SubHeap) {
        let m = HostMem::map(npages * PAGE_SIZE).unwrap();
        let sh = unsafe { SubHeap::new(m.addr(), npages) };
        (m, sh)
    }

    #[test]
    fn cap_leaves_room_for_the_bitset() {
        let (_m, sh) = mkheap(1);
        // 63 chunks of 64 bytes plus an 8-byte bitset fit one page; 64 would
        // overflow it.
        assert_eq!(sh.chunk_cap, (PAGE_SIZE * 8 - 7) / (CHUNK_SIZE * 8 + 1));
        assert!(sh.cap() + (sh.chunk_cap + 7) / 8 <= PAGE_SIZE);
    }

    #[test]
    fn alloc_rounds_to_chunks_and_frees_back() {
        let (_m, mut sh) = mkheap(1);
        let avail = sh.avail();
        let (p, len) = sh.alloc(100, 1).unwrap();
        assert_eq!(len, 2 * CHUNK_SIZE);
        assert_eq!(sh.avail(), avail - len);
        assert!(sh.contains(p));
        sh.free(p, len);
        assert_eq!(sh.avail(), avail);
    }

    #[test]
    fn early_reject_when_capacity_short() {
        let (_m, mut sh) = mkheap(1);
        assert!(sh.alloc((sh.chunk_cap + 1) * CHUNK_SIZE, 1).is_none());
    }

    #[test]
    fn aligned_allocation_lands_on_stride() {
        let (_m, mut sh) = mkheap(4);
        // Knock the heap off balance with an odd-size allocation first.
        let (a, alen) = sh.alloc(CHUNK_SIZE, 1).unwrap();
        let (p, plen) = sh.alloc(100, 512).unwrap();
        assert_eq!(p % 512, 0);
        sh.free(p, plen);
        sh.free(a, alen);
    }

    #[test]
    fn first_fit_vs_best_fit_hole_selection() {
        let (_m, mut sh) = mkheap(1);
        // Layout: [keep 1][hole 5][keep 1][hole 4][keep 1][tail...]
        let (k0, _) = sh.alloc(CHUNK_SIZE, 1).unwrap();
        let (h0, h0len) = sh.alloc(5 * CHUNK_SIZE, 1).unwrap();
        let (k1, _) = sh.alloc(CHUNK_SIZE, 1).unwrap();
        let (h1, h1len) = sh.alloc(4 * CHUNK_SIZE, 1).unwrap();
        let (k2, _) = sh.alloc(CHUNK_SIZE, 1).unwrap();
        // Park the tail so the holes are the only candidates besides it.
        let tail_chunks = sh.chunk_cap - 12;
        let (t, tlen) = sh.alloc(tail_chunks * CHUNK_SIZE, 1).unwrap();
        sh.free(h0, h0len);
        sh.free(h1, h1len);

        // At the threshold: best fit prefers the exactly-fitting later hole.
        let (big, blen) = sh.alloc(BEST_FIT_THRESHOLD * CHUNK_SIZE, 1).unwrap();
        assert_eq!(big, h1);
        // Below the threshold: first fit lands in the earliest (wider) hole.
        let (small, slen) = sh.alloc(CHUNK_SIZE, 1).unwrap();
        assert_eq!(small, h0);

        sh.free(small, slen);
        sh.free(big, blen);
        sh.free(t, tlen);
        let _ = (k0, k1, k2);
    }

    #[test]
    fn best_fit_breaks_ties_at_the_lowest_index() {
        let (_m, mut sh) = mkheap(1);
        let (k0, _) = sh.alloc(CHUNK_SIZE, 1).unwrap();
        let (h0, h0len) = sh.alloc(4 * CHUNK_SIZE, 1).unwrap();
        let (k1, _) = sh.alloc(CHUNK_SIZE, 1).unwrap();
        let (h1, h1len) = sh.alloc(4 * CHUNK_SIZE, 1).unwrap();
        let (k2, _) = sh.alloc(CHUNK_SIZE, 1).unwrap();
        let tail = sh.chunk_cap - 11;
        let (t, tlen) = sh.alloc(tail * CHUNK_SIZE, 1).unwrap();
        sh.free(h0, h0len);
        sh.free(h1, h1len);

        let (p, plen) = sh.alloc(4 * CHUNK_SIZE, 1).unwrap();
        assert_eq!(p, h0);
        sh.free(p, plen);
        sh.free(t, tlen);
        let _ = (k0, k1, k2);
    }

    #[test]
    #[should_panic]
    fn free_of_clear_chunk_is_detected() {
        let (_m, mut sh) = mkheap(1);
        let base = sh.chunks;
        sh.free(base, CHUNK_SIZE);
    }
}
