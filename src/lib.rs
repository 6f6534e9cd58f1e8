//! A bitmap buddy allocator for kernel physical memory.
//!
//! [`BuddyHeap`] manages a contiguous byte range and hands out blocks whose
//! sizes are power-of-two multiples of a leaf size. Its bookkeeping lives at
//! the front of the range it manages: a table of size classes, a pair
//! bitmap per class recording which buddy pairs are half in use, and a split
//! bitmap per class recording which blocks are divided. Free blocks are
//! threaded onto per-class intrusive lists stored in the free memory itself.
//!
//! [`LockedBuddyHeap`] serializes a heap behind a spinlock so it can be
//! shared between harts, used as a global allocator, or used as a source of
//! zeroed pages.
//!
//! ```
//! use core::ptr::NonNull;
//! use kbuddy::{BuddyHeap, Raw};
//!
//! #[repr(align(16))]
//! struct Arena([u8; 4096]);
//!
//! let mut arena = Arena([0; 4096]);
//! let range = arena.0.as_mut_ptr_range();
//!
//! let mut heap: BuddyHeap<16, Raw> = unsafe {
//!     BuddyHeap::init(
//!         NonNull::new(range.start).unwrap(),
//!         NonNull::new(range.end).unwrap(),
//!     )
//! }
//! .unwrap();
//!
//! let block = heap.allocate(100).unwrap();
//! assert_eq!(block.len(), 128);
//!
//! unsafe { heap.release(block.cast()) };
//! ```

#![doc(html_root_url = "https://docs.rs/kbuddy/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
#![no_std]
// This is necessary to allow `sptr` to shadow methods provided by newer
// toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod class;
mod geometry;
pub mod locked;
mod page;
mod polyfill;
pub mod stats;


use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    buddy::BuddyHeap,
    locked::LockedBuddyHeap,
    page::PAGE_SIZE,
    stats::{ClassStats, HeapStats},
};

/// The error type for heap constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate the
    /// managed region from a backing allocator, but the allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The region is malformed.
    ///
    /// This variant is returned when the end of the region precedes its
    /// leaf-aligned base, or when the region extends past the end of the
    /// address space.
    InvalidRegion,

    /// The region is too small.
    ///
    /// This variant is returned when the region cannot hold a single leaf, or
    /// when the heap metadata does not fit in front of the usable space.
    RegionTooSmall,

    /// The heap was already initialized.
    AlreadyInitialized,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate a region of {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidRegion => f.write_str("invalid memory region"),
            AllocInitError::RegionTooSmall => {
                f.write_str("memory region too small to hold heap metadata")
            }
            AllocInitError::AlreadyInitialized => f.write_str("heap is already initialized"),
        }
    }
}

/// Indicates an allocation failure due to resource exhaustion.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no free block large enough")
    }
}

/// Types which provide memory which backs a heap.
///
/// This trait is sealed, and is implemented by the following types:
/// - The `Raw` marker type indicates that a heap is not backed by another
///   allocator. This is the case when constructing the heap from raw
///   pointers at boot.
/// - The `Global` marker type indicates that a heap is backed by the global
///   allocator. The heap will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that a heap is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
