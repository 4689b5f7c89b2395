//! Guest virtual memory: the page directory, the translation cache, and the
//! guest load/store entry points.
//!
//! A [`PageDir`] is a rooted tree of `VM_PTAB_LEVELS` levels; each node is a
//! `VM_PTAB_LEN`-entry array of PTEs sized to exactly one page. Guest virtual
//! frame numbers are split into `VM_PTAB_LEVELS` groups of `VM_PTAB_BITS`
//! bits, most significant first, indexing successive levels. Nodes and guest
//! backing pages are allocated from the page manager on first touch.
//!
//! The [`VmCache`] is a direct-mapped table of `{tag, haddr_diff}` pairs keyed
//! by the low bits of the frame number; a hit turns a guest address into a
//! host address with one add. The required access alignment is folded into
//! the tag compare, so a misaligned access can never hit.
//!
//! Guest accesses go through [`vm_load`]/[`vm_store`] (or the matching
//! macros): probe the cache inline, and on a miss fall into the out-of-line
//! [`translate_miss`] handler that validates the access, walks the directory
//! and installs the translation.

use core::mem::size_of;

use log::trace;
use spin::Mutex;
use static_assertions as sa;
use thiserror::Error;

use crate::mm::pmm::Pmm;
use crate::mm::{MemError, PAGE_SIZE, PAGE_SIZE_BITS};
use crate::util::align::is_aligned;

/// Width of a guest virtual address.
pub const VM_ADDR_BITS: u32 = 48;
/// Lowest mappable guest address; guest address 0 stays a null sentinel.
pub const VM_ADDR_MIN: u64 = PAGE_SIZE as u64;
/// Highest mappable guest address.
pub const VM_ADDR_MAX: u64 = (1u64 << VM_ADDR_BITS) - 1;
/// Mask selecting the page-number bits of a guest address.
pub const VM_ADDR_PAGE_MASK: u64 = !((PAGE_SIZE as u64) - 1);

/// Index bits consumed per page-table level.
pub const VM_PTAB_BITS: u32 = 9;
/// Page-table tree depth.
pub const VM_PTAB_LEVELS: u32 = 4;
/// Entries per page-table node.
pub const VM_PTAB_LEN: usize = 1 << VM_PTAB_BITS;

/// Entries in the direct-mapped translation cache.
pub const VM_CACHE_LEN: usize = 512;

// The level fields must cover the frame number exactly, and a node must be
// exactly one page.
sa::const_assert_eq!(
    (VM_PTAB_BITS * VM_PTAB_LEVELS) as usize,
    VM_ADDR_BITS as usize - PAGE_SIZE_BITS
);
sa::const_assert_eq!(VM_PTAB_LEN * size_of::<Pte>(), PAGE_SIZE);
sa::const_assert!(VM_CACHE_LEN.is_power_of_two());

/// A single page-table entry: the host page frame number of either a child
/// node or a guest backing page, told apart by tree depth. All-zero means
/// "not present" (host page frame 0 never backs guest memory).
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
struct Pte(u64);

impl Pte {
    #[inline(always)]
    fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    fn from_haddr(haddr: usize) -> Pte {
        debug_assert!(is_aligned(haddr, PAGE_SIZE_BITS));
        Pte((haddr >> PAGE_SIZE_BITS) as u64)
    }

    /// Host address of the referenced node or backing page.
    #[inline(always)]
    fn haddr(self) -> usize {
        (self.0 as usize) << PAGE_SIZE_BITS
    }
}

/// A fault raised on the guest-access path. All three are trappable: they
/// surface as values so the runtime can route them to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmFault {
    /// The address lies outside `[VM_ADDR_MIN, VM_ADDR_MAX]`.
    #[error("virtual address {addr:#x} outside the guest address range")]
    OutOfRange { addr: u64 },
    /// The address is not aligned to the access size.
    #[error("virtual address {addr:#x} misaligned for a {align}-byte access")]
    Misaligned { addr: u64, align: usize },
    /// The page manager could not supply a node or backing page.
    #[error("no host memory to back virtual address {addr:#x}")]
    OutOfMemory { addr: u64 },
}

//////////////////////// Page directory /////////////////////////

struct PageDirInner {
    /// Host address of the root node.
    root: usize,
}

/// A guest page directory. Nodes and backing pages are drawn from the page
/// manager the directory was created over and are returned to it, en masse,
/// when the directory drops.
pub struct PageDir<'p> {
    pmm: &'p Pmm,
    inner: Mutex<PageDirInner>,
}

impl<'p> PageDir<'p> {
    /// Create an empty directory: one zeroed root node.
    pub fn new(pmm: &'p Pmm) -> Result<PageDir<'p>, MemError> {
        let root = alloc_page_zeroed(pmm).ok_or(MemError::OutOfMemory)?;
        Ok(PageDir {
            pmm,
            inner: Mutex::new(PageDirInner { root }),
        })
    }

    /// Translate a guest address to a host address, allocating the page-table
    /// path and the backing page on first touch.
    pub fn translate(&self, vaddr: u64) -> Result<usize, VmFault> {
        if !(VM_ADDR_MIN..=VM_ADDR_MAX).contains(&vaddr) {
            return Err(VmFault::OutOfRange { addr: vaddr });
        }
        let inner = self.inner.lock();
        let hpage = unsafe { walk(self.pmm, inner.root, vaddr)? };
        Ok(hpage + (vaddr as usize & (PAGE_SIZE - 1)))
    }
}

impl Drop for PageDir<'_> {
    fn drop(&mut self) {
        let root = self.inner.get_mut().root;
        unsafe { free_subtree(self.pmm, root, 1) }
    }
}

/// Walk the directory for `vaddr`, installing missing nodes and the backing
/// page. Returns the backing page's host address. Caller holds the directory
/// lock and has range-checked `vaddr`.
unsafe fn walk(pmm: &Pmm, root: usize, vaddr: u64) -> Result<usize, VmFault> {
    let vfn = vaddr >> PAGE_SIZE_BITS;
    debug_assert!(vfn > 0);
    // Bias by one so the lowest legal guest page takes index 0 at every level.
    let vfn = vfn - 1;

    let mut node = root as *mut Pte;
    for level in 1..=VM_PTAB_LEVELS {
        let shift = (VM_PTAB_LEVELS - level) * VM_PTAB_BITS;
        let index = ((vfn >> shift) as usize) & (VM_PTAB_LEN - 1);
        let pte = node.add(index);

        if level == VM_PTAB_LEVELS {
            if (*pte).is_empty() {
                let page =
                    alloc_page_zeroed(pmm).ok_or(VmFault::OutOfMemory { addr: vaddr })?;
                *pte = Pte::from_haddr(page);
                trace!("vm: backing page {:#x} for vaddr {:#x}", page, vaddr);
                return Ok(page);
            }
            return Ok((*pte).haddr());
        }

        if (*pte).is_empty() {
            let child = alloc_page_zeroed(pmm).ok_or(VmFault::OutOfMemory { addr: vaddr })?;
            *pte = Pte::from_haddr(child);
            node = child as *mut Pte;
        } else {
            node = (*pte).haddr() as *mut Pte;
        }
    }
    unreachable!("page-table depth exceeded");
}

/// Release a node and everything below it back to the page manager.
unsafe fn free_subtree(pmm: &Pmm, node: usize, level: u32) {
    let ptes = node as *const Pte;
    for i in 0..VM_PTAB_LEN {
        let pte = *ptes.add(i);
        if pte.is_empty() {
            continue;
        }
        if level == VM_PTAB_LEVELS {
            pmm.free_pages(pte.haddr());
        } else {
            free_subtree(pmm, pte.haddr(), level + 1);
        }
    }
    pmm.free_pages(node);
}

/// One zeroed page; used for nodes (all entries empty) and for backing pages
/// (guest memory reads as zero on first touch).
fn alloc_page_zeroed(pmm: &Pmm) -> Option<usize> {
    let addr = pmm.alloc_pages(1);
    if addr == 0 {
        return None;
    }
    unsafe {
        (addr as *mut u8).write_bytes(0, PAGE_SIZE);
    }
    Some(addr)
}

//////////////////////// Translation cache /////////////////////////

#[repr(C)]
#[derive(Copy, Clone)]
struct VmCacheEnt {
    /// `host_page_addr - virtual_page_addr`, wrapping; a hit resolves with
    /// one add and no multiply.
    haddr_diff: u64,
    /// The page-aligned virtual address that populated the entry.
    tag: u64,
}

/// Direct-mapped translation cache, keyed by `VFN mod VM_CACHE_LEN`.
///
/// An all-ones entry is definitionally invalid: no legitimate tag has every
/// bit set, because tags are formed from addresses no larger than
/// `VM_ADDR_MAX` masked with the page mask. Invalidation therefore fills the
/// table with 0xff bytes.
pub struct VmCache {
    entries: Box<[VmCacheEnt; VM_CACHE_LEN]>,
}

impl VmCache {
    pub fn new() -> VmCache {
        let mut cache = VmCache {
            entries: Box::new(
                [VmCacheEnt {
                    haddr_diff: 0,
                    tag: 0,
                }; VM_CACHE_LEN],
            ),
        };
        cache.invalidate();
        cache
    }

    #[inline(always)]
    fn index(vaddr: u64) -> usize {
        ((vaddr >> PAGE_SIZE_BITS) as usize) & (VM_CACHE_LEN - 1)
    }

    /// Probe for `vaddr` with the access's natural `alignment`. Returns the
    /// host address, or 0 on a miss.
    ///
    /// The alignment is folded into the tag compare: the masked address keeps
    /// the page bits plus the low `alignment - 1` bits, so a misaligned
    /// address (or an entry vetted only for a weaker alignment class) never
    /// compares equal to a stored page-aligned tag.
    #[inline(always)]
    pub fn lookup(&self, vaddr: u64, alignment: usize) -> usize {
        debug_assert!(alignment.is_power_of_two());
        let ent = &self.entries[Self::index(vaddr)];
        let tag = vaddr & (VM_ADDR_PAGE_MASK ^ (alignment as u64 - 1));
        let valid = (ent.tag == tag) as u64;
        (valid * ent.haddr_diff.wrapping_add(vaddr)) as usize
    }

    /// Install a translation. Both addresses must be page aligned.
    pub fn add(&mut self, vpage_addr: u64, hpage_addr: usize) {
        debug_assert!(vpage_addr & !VM_ADDR_PAGE_MASK == 0);
        debug_assert!(is_aligned(hpage_addr, PAGE_SIZE_BITS));
        self.entries[Self::index(vpage_addr)] = VmCacheEnt {
            haddr_diff: (hpage_addr as u64).wrapping_sub(vpage_addr),
            tag: vpage_addr,
        };
    }

    /// Drop every cached translation.
    pub fn invalidate(&mut self) {
        unsafe {
            (self.entries.as_mut_ptr() as *mut u8)
                .write_bytes(0xff, VM_CACHE_LEN * size_of::<VmCacheEnt>());
        }
    }

    /// Drop the single entry `vaddr` maps to.
    pub fn invalidate_one(&mut self, vaddr: u64) {
        self.entries[Self::index(vaddr)] = VmCacheEnt {
            haddr_diff: u64::MAX,
            tag: u64::MAX,
        };
    }
}

impl Default for VmCache {
    fn default() -> Self {
        Self::new()
    }
}

//////////////////////// Guest access ops /////////////////////////

/// Direction of a guest access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOpKind {
    Load = 0,
    Store = 1,
}

/// Guest access descriptor: direction plus access size (which doubles as the
/// required alignment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmOp(u32);

impl VmOp {
    #[inline(always)]
    pub const fn make(kind: VmOpKind, size: usize) -> VmOp {
        VmOp(((kind as u32) << 8) | size as u32)
    }

    #[inline(always)]
    pub const fn kind(self) -> VmOpKind {
        if self.0 >> 8 == 0 {
            VmOpKind::Load
        } else {
            VmOpKind::Store
        }
    }

    /// Access size in bytes; also the access's natural alignment.
    #[inline(always)]
    pub const fn alignment(self) -> usize {
        (self.0 & 0xff) as usize
    }
}

/// Cache-miss handler for the guest access fast path.
///
/// Validates range and alignment, walks the page directory (allocating the
/// path on first touch), installs the translation, and returns `haddr_diff`
/// so the caller resolves the host address with one add.
#[cold]
pub fn translate_miss(
    cache: &mut VmCache,
    pagedir: &PageDir<'_>,
    vaddr: u64,
    op: VmOp,
) -> Result<u64, VmFault> {
    if !(VM_ADDR_MIN..=VM_ADDR_MAX).contains(&vaddr) {
        return Err(VmFault::OutOfRange { addr: vaddr });
    }
    let align = op.alignment();
    if vaddr & (align as u64 - 1) != 0 {
        return Err(VmFault::Misaligned { addr: vaddr, align });
    }

    let haddr = pagedir.translate(vaddr)?;
    let vpage = vaddr & VM_ADDR_PAGE_MASK;
    let hpage = haddr & !(PAGE_SIZE - 1);
    cache.add(vpage, hpage);
    Ok((hpage as u64).wrapping_sub(vpage))
}

mod sealed {
    pub trait Sealed {}
}

/// Primitive types a guest load/store may move. Sealed: the set is fixed by
/// the access-size encoding of [`VmOp`].
pub trait VmInt: Copy + sealed::Sealed {}

macro_rules! impl_vm_int {
    ($($t:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $t {}
            impl VmInt for $t {}
        )*
    };
}

impl_vm_int!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Load a `T` from guest address `vaddr`. The cache probe inlines into the
/// caller; only the miss path leaves the fast path.
#[inline(always)]
pub fn vm_load<T: VmInt>(
    cache: &mut VmCache,
    pagedir: &PageDir<'_>,
    vaddr: u64,
) -> Result<T, VmFault> {
    let haddr = cache.lookup(vaddr, size_of::<T>());
    let haddr = if haddr != 0 {
        haddr
    } else {
        let diff = translate_miss(cache, pagedir, vaddr, VmOp::make(VmOpKind::Load, size_of::<T>()))?;
        diff.wrapping_add(vaddr) as usize
    };
    Ok(unsafe { (haddr as *const T).read() })
}

/// Store `value` to guest address `vaddr`. See [`vm_load`].
#[inline(always)]
pub fn vm_store<T: VmInt>(
    cache: &mut VmCache,
    pagedir: &PageDir<'_>,
    vaddr: u64,
    value: T,
) -> Result<(), VmFault> {
    let haddr = cache.lookup(vaddr, size_of::<T>());
    let haddr = if haddr != 0 {
        haddr
    } else {
        let diff =
            translate_miss(cache, pagedir, vaddr, VmOp::make(VmOpKind::Store, size_of::<T>()))?;
        diff.wrapping_add(vaddr) as usize
    };
    unsafe { (haddr as *mut T).write(value) };
    Ok(())
}

/// `vm_load!(T, cache, pagedir, vaddr)`: typed guest load.
#[macro_export]
macro_rules! vm_load {
    ($t:ty, $cache:expr, $pagedir:expr, $vaddr:expr) => {
        $crate::mm::vm::vm_load::<$t>($cache, $pagedir, $vaddr)
    };
}

/// `vm_store!(T, cache, pagedir, vaddr, value)`: typed guest store.
#[macro_export]
macro_rules! vm_store {
    ($t:ty, $cache:expr, $pagedir:expr, $vaddr:expr, $value:expr) => {
        $crate::mm::vm::vm_store::<$t>($cache, $pagedir, $vaddr, $value)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkpmm(bytes: usize) -> Pmm {
        Pmm::create_from_os(bytes).expect("host region")
    }

    #[test]
    fn op_encoding() {
        let op = VmOp::make(VmOpKind::Store, 4);
        assert_eq!(op.kind(), VmOpKind::Store);
        assert_eq!(op.alignment(), 4);
        let op = VmOp::make(VmOpKind::Load, 8);
        assert_eq!(op.kind(), VmOpKind::Load);
        assert_eq!(op.alignment(), 8);
    }

    #[test]
    fn translate_is_stable_and_first_touch_zeroes() {
        let pmm = mkpmm(8 << 20);
        let dir = PageDir::new(&pmm).unwrap();
        let h1 = dir.translate(0xdead_b000).unwrap();
        let h2 = dir.translate(0xdead_b000).unwrap();
        assert_eq!(h1, h2);
        // Offsets within the page shift the host address by the same amount.
        assert_eq!(dir.translate(0xdead_b0e4).unwrap(), h1 + 0xe4);
        // First touch reads as zero.
        assert_eq!(unsafe { (h1 as *const u64).read() }, 0);
    }

    #[test]
    fn translate_rejects_out_of_range() {
        let pmm = mkpmm(8 << 20);
        let dir = PageDir::new(&pmm).unwrap();
        assert_eq!(
            dir.translate(0),
            Err(VmFault::OutOfRange { addr: 0 })
        );
        assert_eq!(
            dir.translate(VM_ADDR_MIN - 1),
            Err(VmFault::OutOfRange { addr: VM_ADDR_MIN - 1 })
        );
        assert_eq!(
            dir.translate(VM_ADDR_MAX + 1),
            Err(VmFault::OutOfRange { addr: VM_ADDR_MAX + 1 })
        );
        assert!(dir.translate(VM_ADDR_MIN).is_ok());
        assert!(dir.translate(VM_ADDR_MAX).is_ok());
    }

    #[test]
    fn dispose_returns_every_page() {
        let pmm = mkpmm(8 << 20);
        let initial = pmm.avail_total();
        {
            let dir = PageDir::new(&pmm).unwrap();
            // Touch addresses spread across distinct subtrees so interior
            // nodes pile up.
            for vaddr in [
                VM_ADDR_MIN,
                0xdead_b000u64,
                0x1_0000_0000u64,
                VM_ADDR_MAX & VM_ADDR_PAGE_MASK,
            ] {
                dir.translate(vaddr).unwrap();
            }
            assert!(pmm.avail_total() < initial);
        }
        assert_eq!(pmm.avail_total(), initial);
    }

    #[test]
    fn cache_hit_miss_and_invalidate() {
        let mut cache = VmCache::new();
        // Fresh cache misses everywhere.
        assert_eq!(cache.lookup(0xdead_beef, 1), 0);

        cache.add(0xdead_b000, 0x1044_f000);
        assert_eq!(cache.lookup(0xdead_beef, 1), 0x1044_feef);
        // A different page with the same index bits cannot hit.
        assert_eq!(cache.lookup(0xfeed_b000, 1), 0);

        cache.invalidate_one(0xdead_beef);
        assert_eq!(cache.lookup(0xdead_beef, 1), 0);

        cache.add(0xdead_b000, 0x1044_f000);
        cache.invalidate();
        assert_eq!(cache.lookup(0xdead_b000, 1), 0);
        assert_eq!(cache.lookup(0xdead_beef, 1), 0);
    }

    #[test]
    fn cache_folds_alignment_into_the_tag() {
        let mut cache = VmCache::new();
        cache.add(0xdead_b000, 0x1044_f000);
        // Aligned accesses hit.
        assert_eq!(cache.lookup(0xdead_b004, 4), 0x1044_f004);
        assert_eq!(cache.lookup(0xdead_b008, 8), 0x1044_f008);
        // Misaligned accesses miss instead of producing a bogus hit.
        assert_eq!(cache.lookup(0xdead_b003, 4), 0);
        assert_eq!(cache.lookup(0xdead_beef, 4), 0);
    }

    #[test]
    fn miss_handler_validates_then_installs() {
        let pmm = mkpmm(8 << 20);
        let dir = PageDir::new(&pmm).unwrap();
        let mut cache = VmCache::new();

        let vaddr = 0xdead_bee4u64;
        let op = VmOp::make(VmOpKind::Load, 4);
        let diff = translate_miss(&mut cache, &dir, vaddr, op).unwrap();
        let haddr = diff.wrapping_add(vaddr) as usize;
        assert_eq!(haddr, dir.translate(vaddr).unwrap());
        // The install covers the whole page for compatible alignments.
        assert_eq!(cache.lookup(vaddr, 4), haddr);
        assert_eq!(cache.lookup(vaddr & VM_ADDR_PAGE_MASK, 8), haddr - 0xe4);

        assert_eq!(
            translate_miss(&mut cache, &dir, 0xdead_bee2, VmOp::make(VmOpKind::Load, 4)),
            Err(VmFault::Misaligned { addr: 0xdead_bee2, align: 4 })
        );
        assert_eq!(
            translate_miss(&mut cache, &dir, 2, VmOp::make(VmOpKind::Load, 1)),
            Err(VmFault::OutOfRange { addr: 2 })
        );
    }

    #[test]
    fn load_store_round_trip() {
        let pmm = mkpmm(8 << 20);
        let dir = PageDir::new(&pmm).unwrap();
        let mut cache = VmCache::new();

        vm_store::<u32>(&mut cache, &dir, 0xdead_bee4, 12345).unwrap();
        assert_eq!(vm_load::<u32>(&mut cache, &dir, 0xdead_bee4).unwrap(), 12345);
        // Second load still hits the same cell.
        assert_eq!(vm_load::<u32>(&mut cache, &dir, 0xdead_bee4).unwrap(), 12345);

        // Bytes of the stored word are addressable individually.
        assert_eq!(
            vm_load::<u8>(&mut cache, &dir, 0xdead_bee4).unwrap(),
            12345u32.to_ne_bytes()[0]
        );

        vm_store::<u64>(&mut cache, &dir, VM_ADDR_MIN, u64::MAX).unwrap();
        assert_eq!(vm_load::<u64>(&mut cache, &dir, VM_ADDR_MIN).unwrap(), u64::MAX);
    }

    #[test]
    fn misaligned_wide_access_misses_and_faults() {
        let pmm = mkpmm(8 << 20);
        let dir = PageDir::new(&pmm).unwrap();
        let mut cache = VmCache::new();

        // Populate via a byte access at an odd address.
        vm_store::<u8>(&mut cache, &dir, 0xdead_beef, 0xaa).unwrap();
        // The installed page hits for aligned accesses of any width, but a
        // misaligned wide access misses even though the page is mapped...
        assert_ne!(cache.lookup(0xdead_bee4, 4), 0);
        assert_eq!(cache.lookup(0xdead_beef, 4), 0);
        // ...and the miss handler re-checks and faults it.
        assert_eq!(
            vm_load::<u32>(&mut cache, &dir, 0xdead_beef),
            Err(VmFault::Misaligned { addr: 0xdead_beef, align: 4 })
        );
        assert_eq!(vm_load::<u8>(&mut cache, &dir, 0xdead_beef).unwrap(), 0xaa);
    }

    #[test]
    fn first_touch_oom_is_a_trappable_fault() {
        // Small region: the directory exhausts it after a bounded number of
        // first touches, which must surface as a fault, not a crash.
        let pmm = mkpmm(3 << 20);
        let dir = PageDir::new(&pmm).unwrap();
        let mut cache = VmCache::new();

        let mut vaddr = VM_ADDR_MIN;
        let fault = loop {
            match vm_store::<u32>(&mut cache, &dir, vaddr, 1) {
                Ok(()) => vaddr += PAGE_SIZE as u64,
                Err(f) => break f,
            }
            assert!(vaddr < VM_ADDR_MAX, "region never exhausted");
        };
        assert_eq!(fault, VmFault::OutOfMemory { addr: vaddr });
        // The directory is still usable for already-mapped pages.
        assert_eq!(vm_load::<u32>(&mut cache, &dir, VM_ADDR_MIN).unwrap(), 1);
    }

    #[test]
    fn macros_mirror_the_functions() {
        let pmm = mkpmm(8 << 20);
        let dir = PageDir::new(&pmm).unwrap();
        let mut cache = VmCache::new();

        vm_store!(u16, &mut cache, &dir, 0x8000, 0xbeef).unwrap();
        assert_eq!(vm_load!(u16, &mut cache, &dir, 0x8000).unwrap(), 0xbeef);
    }
}
