//! Zeroed page allocation on top of a locked heap.

use core::ptr::NonNull;

use crate::{AllocError, BackingAllocator, LockedBuddyHeap};

/// The size in bytes of a page.
pub const PAGE_SIZE: usize = 4096;

impl<const LEAF_SIZE: usize, A: BackingAllocator> LockedBuddyHeap<LEAF_SIZE, A> {
    /// Allocates one zeroed page.
    ///
    /// The page is page-aligned if the heap base is.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no free block can hold a page.
    pub fn alloc_page(&self) -> Result<NonNull<[u8]>, AllocError> {
        self.alloc_pages(1)
    }

    /// Allocates `count` zeroed pages, rounded up to a power of two.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `count` is zero or no free block is large enough.
    pub fn alloc_pages(&self, count: usize) -> Result<NonNull<[u8]>, AllocError> {
        if count == 0 {
            return Err(AllocError);
        }

        let nbytes = count
            .checked_next_power_of_two()
            .and_then(|c| c.checked_mul(PAGE_SIZE))
            .ok_or(AllocError)?;

        let block = self.allocate(nbytes)?;

        // Zero outside the lock. The block is exclusively ours.
        unsafe {
            block
                .cast::<u8>()
                .as_ptr()
                .write_bytes(0, block.len())
        };

        Ok(block)
    }

    /// Returns pages obtained from [`alloc_page`] or [`alloc_pages`] to the
    /// heap.
    ///
    /// # Safety
    ///
    /// `page` must have been returned by `alloc_page` or `alloc_pages` on
    /// this heap and not freed since.
    ///
    /// [`alloc_page`]: LockedBuddyHeap::alloc_page
    /// [`alloc_pages`]: LockedBuddyHeap::alloc_pages
    pub unsafe fn free_page(&self, page: NonNull<u8>) {
        unsafe { self.release(page) };
    }
}
