//! Memory subsystem of a userspace virtual-machine runtime.
//!
//! Guest programs see a flat virtual address space backed by host memory
//! obtained from the operating system. Three layers provide it, leaves first:
//!
//! | Layer | Responsibility |
//! | ----- | -------------- |
//! | [`mm::pmm`] | Buddy allocator handing out page runs of host memory. |
//! | [`mm::vm`] | Guest-virtual to host translation with a translation cache. |
//! | [`mm::kmem`] | Byte-granular heap (slab classes + bitmap sub-heaps). |
//!
//! ```
//! use guestmem::{PageDir, Pmm, VmCache};
//! use guestmem::mm::vm::{vm_load, vm_store};
//!
//! let pmm = Pmm::create_from_os(8 << 20).unwrap();
//! let pagedir = PageDir::new(&pmm).unwrap();
//! let mut cache = VmCache::new();
//!
//! vm_store::<u32>(&mut cache, &pagedir, 0xdead_bee4, 12345).unwrap();
//! assert_eq!(vm_load::<u32>(&mut cache, &pagedir, 0xdead_bee4).unwrap(), 12345);
//! ```

pub mod host;
pub mod mm;
mod util;

pub use host::HostMem;
pub use mm::kmem::{Kmem, Region};
pub use mm::pmm::Pmm;
pub use mm::vm::{PageDir, VmCache, VmFault};
pub use mm::{MemError, PAGE_SIZE, PAGE_SIZE_BITS};
