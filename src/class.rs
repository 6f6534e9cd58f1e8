use core::{mem, num::NonZeroUsize};

use crate::{
    base::{BasePtr, BlockLink},
    bitmap::{Bitmap, PairBitmap},
};

/// The bookkeeping for one size class.
///
/// Records live in an array at the front of the managed region, followed by
/// the bitmaps they point to.
pub struct SizeClass {
    /// Head of the intrusive list of free blocks of this class.
    free_list: Option<NonZeroUsize>,
    /// One bit per buddy pair: set when exactly one of the pair is in use.
    ///
    /// A block is in use if it is allocated, split, or reserved.
    alloc: PairBitmap,
    /// One bit per block: set when the block is divided into two children.
    ///
    /// Class 0 blocks cannot be split, so class 0 has no split bitmap.
    split: Option<Bitmap>,
}

impl SizeClass {
    /// Creates a size class with an empty free list.
    pub fn new(alloc: PairBitmap, split: Option<Bitmap>) -> SizeClass {
        SizeClass {
            free_list: None,
            alloc,
            split,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free_list.is_none()
    }

    /// Flips the pair bit shared by block `bi` and its buddy.
    #[inline]
    pub fn flip_alloc(&mut self, bi: usize) {
        self.alloc.flip(bi);
    }

    /// Returns the pair bit shared by block `bi` and its buddy.
    #[inline]
    pub fn alloc_bit(&self, bi: usize) -> bool {
        self.alloc.get(bi)
    }

    /// Returns whether block `bi` is split. Always false for class 0.
    #[inline]
    pub fn is_split(&self, bi: usize) -> bool {
        self.split.as_ref().map_or(false, |s| s.get(bi))
    }

    #[inline]
    pub fn set_split(&mut self, bi: usize) {
        self.split
            .as_mut()
            .expect("class 0 blocks cannot be split")
            .set(bi, true);
    }

    #[inline]
    pub fn clear_split(&mut self, bi: usize) {
        self.split
            .as_mut()
            .expect("class 0 blocks cannot be split")
            .clear(bi);
    }

    /// Pushes a block onto the free list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The memory at `block` must be within the provenance of `base` and
    ///   valid for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - `block` must not be in use and must not already be on a free list.
    pub unsafe fn push(&mut self, base: BasePtr, block: NonZeroUsize) {
        assert_eq!(block.get() & (mem::align_of::<BlockLink>() - 1), 0);

        if let Some(old_head) = self.free_list {
            unsafe { base.link_mut(old_head).prev = Some(block) };
        }

        unsafe {
            base.init_link_at(
                block,
                BlockLink {
                    prev: None,
                    next: self.free_list,
                },
            )
        };

        self.free_list = Some(block);
    }

    /// Removes the specified block from the free list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The memory at `block` must be within the provenance of `base` and
    ///   valid for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - `block` must be an element of this class's free list.
    pub unsafe fn remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        unsafe {
            let removed = base.link_mut(block);

            match removed.prev {
                // Link `prev` forward to `next`.
                Some(p) => base.link_mut(p).next = removed.next,

                // If there's no previous block, then `removed` is the head of
                // the free list.
                None => self.free_list = removed.next,
            }

            if let Some(n) = removed.next {
                // Link `next` back to `prev`.
                base.link_mut(n).prev = removed.prev;
            }
        }
    }

    /// Pops the most recently pushed block off the free list.
    ///
    /// # Panics
    ///
    /// Panics if the free list is empty.
    ///
    /// # Safety
    ///
    /// Every block on the free list must be within the provenance of `base`.
    pub unsafe fn pop(&mut self, base: BasePtr) -> NonZeroUsize {
        let head = self.free_list.expect("pop from empty free list");

        unsafe { self.remove(base, head) };

        head
    }

    /// Returns an iterator over the addresses of the free blocks.
    ///
    /// # Safety
    ///
    /// Every block on the free list must be within the provenance of `base`,
    /// and the list must not be modified while the iterator is alive.
    pub unsafe fn free_blocks(&self, base: BasePtr) -> FreeBlocks {
        FreeBlocks {
            base,
            next: self.free_list,
        }
    }
}

/// An iterator over the blocks on a free list.
pub struct FreeBlocks {
    base: BasePtr,
    next: Option<NonZeroUsize>,
}

impl Iterator for FreeBlocks {
    type Item = NonZeroUsize;

    fn next(&mut self) -> Option<NonZeroUsize> {
        let current = self.next?;

        // SAFETY: upheld by the caller of `SizeClass::free_blocks`.
        self.next = unsafe { self.base.link_mut(current).next };

        Some(current)
    }
}
