//! Guest memory management. Three layers, leaves first:
//!
//! | Layer | Responsibility |
//! | ----- | -------------- |
//! | [`pmm`] | Hand out page-aligned runs of host memory in power-of-two sizes. |
//! | [`vm`] | Translate guest virtual addresses to host addresses; cache translations. |
//! | [`kmem`] | Byte-granular allocator built on the page manager. |
//!
//! The heap requests multi-page runs from the page manager to back sub-heaps
//! and slab blocks; the virtual memory layer requests single pages for both
//! page-table nodes and guest backing pages. All three are value-typed
//! handles, each serialized by its own mutex.

pub mod kmem;
pub mod pmm;
pub mod vm;

use static_assertions as sa;
use thiserror::Error;

/// Order of page-size.
pub const PAGE_SIZE_BITS: usize = 12;
/// Page size. The unit of wholesale transfer for every layer in this module.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;

sa::const_assert!(PAGE_SIZE.is_power_of_two());

/// Creation-time failure of an allocator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    /// The host region cannot hold the allocator metadata plus at least one
    /// usable block, or the backing allocator is exhausted.
    #[error("out of host memory")]
    OutOfMemory,
}
