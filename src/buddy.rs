//! A binary-buddy heap with bitmap bookkeeping.

use core::{alloc::Layout, fmt, mem, num::NonZeroUsize, ptr::NonNull};

use log::{debug, info, trace};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

use crate::{
    base::{BasePtr, BlockLink},
    bitmap::{Bitmap, PairBitmap},
    class::SizeClass,
    geometry::{self, buddy_index, Geometry},
    stats::{ClassStats, HeapStats},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// Byte sizes of the metadata placed at the front of the heap.
#[derive(Copy, Clone, Debug)]
struct MetadataLayout {
    /// The size-class table.
    table: usize,
    /// All pair bitmaps, which follow the table.
    alloc: usize,
    /// Everything, including the split bitmaps, rounded up to a leaf.
    total: usize,
}

impl MetadataLayout {
    fn new<const LEAF_SIZE: usize>(geometry: Geometry<LEAF_SIZE>) -> Option<MetadataLayout> {
        let num_classes = geometry.num_classes();

        let table = num_classes.checked_mul(mem::size_of::<SizeClass>())?;

        // Every class has a pair bitmap.
        let alloc: usize = (0..num_classes)
            .map(|k| PairBitmap::map_size(geometry.num_blocks(k)))
            .sum();

        // Class 0 has no split bitmap.
        let split: usize = (1..num_classes)
            .map(|k| Bitmap::map_size(geometry.num_blocks(k)))
            .sum();

        let total = geometry::round_up(table.checked_add(alloc)?.checked_add(split)?, LEAF_SIZE)?;

        Some(MetadataLayout {
            table,
            alloc,
            total,
        })
    }
}

/// A binary-buddy heap over a contiguous region of memory.
///
/// This takes one const parameter, `LEAF_SIZE`, which is the size of the
/// smallest block the heap hands out. Every block is `LEAF_SIZE << k` bytes
/// for some size class `k`. `LEAF_SIZE` is subject to the following
/// invariants:
/// - It must be a power of two.
/// - It must be at least `2 * mem::size_of::<usize>()`, so that a free block
///   can hold its free-list links.
///
/// Attempting to construct a `BuddyHeap` whose const parameter violates
/// these invariants will result in a panic.
///
/// The heap's own bookkeeping is carved out of the front of the region, and
/// any space between the end of the region and the top block's capacity is
/// permanently reserved. Both are excluded from allocation.
pub struct BuddyHeap<const LEAF_SIZE: usize, A: BackingAllocator> {
    /// Pointer to the leaf-aligned start of the managed region.
    base: BasePtr,
    geometry: Geometry<LEAF_SIZE>,
    /// The size-class table, `geometry.num_classes()` entries long.
    classes: NonNull<SizeClass>,
    metadata_size: usize,
    unavailable: usize,
    /// The region as passed to the constructor, before alignment.
    ///
    /// This is stored solely so that it may be returned to the backing
    /// allocator on drop.
    region: NonNull<u8>,
    region_len: usize,
    backing_allocator: A,
}

// SAFETY: The heap exclusively owns its region, and every access to the
// region goes through `&mut self`.
unsafe impl<const LEAF_SIZE: usize, A: BackingAllocator + Send> Send for BuddyHeap<LEAF_SIZE, A> {}

impl<const LEAF_SIZE: usize> BuddyHeap<LEAF_SIZE, Raw> {
    /// Initializes a heap managing the memory in `[base, end)`.
    ///
    /// `base` is rounded up to a multiple of `LEAF_SIZE`. The size-class
    /// table and bitmaps are placed at the rounded base, and the remaining
    /// space is published as free blocks.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `end` precedes the rounded base, or if the region is
    /// too small to hold its own metadata.
    ///
    /// # Panics
    ///
    /// Panics if the seeded free space does not match the region layout.
    /// This indicates an internal bug rather than a bad argument.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `[base, end)` must be valid for reads and writes, and `end` must be
    ///   derived from `base`.
    /// - No other code may access the region for the lifetime of the heap.
    pub unsafe fn init(
        base: NonNull<u8>,
        end: NonNull<u8>,
    ) -> Result<BuddyHeap<LEAF_SIZE, Raw>, AllocInitError> {
        unsafe { Self::init_in(base, end, Raw) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const LEAF_SIZE: usize> BuddyHeap<LEAF_SIZE, Global> {
    /// Constructs a heap over a `len`-byte region obtained from the global
    /// allocator.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the region cannot be allocated or is too small to
    /// hold its own metadata.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(len: usize) -> Result<BuddyHeap<LEAF_SIZE, Global>, AllocInitError> {
        Self::assert_leaf_size_invariants();

        if len < LEAF_SIZE {
            return Err(AllocInitError::RegionTooSmall);
        }

        let layout =
            Layout::from_size_align(len, LEAF_SIZE).map_err(|_| AllocInitError::InvalidRegion)?;

        unsafe {
            let base = NonNull::new(alloc::alloc::alloc(layout))
                .ok_or(AllocInitError::AllocFailed(layout))?;

            // SAFETY: one past the end of an allocation is never null.
            let end = NonNull::new_unchecked(base.as_ptr().add(len));

            match Self::init_in(base, end, Global) {
                Ok(heap) => Ok(heap),
                Err(e) => {
                    alloc::alloc::dealloc(base.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<const LEAF_SIZE: usize, A: BackingAllocator> BuddyHeap<LEAF_SIZE, A> {
    fn assert_leaf_size_invariants() {
        assert!(
            LEAF_SIZE.is_power_of_two(),
            "buddy heap leaf size must be a power of two"
        );
        assert!(
            LEAF_SIZE >= mem::size_of::<BlockLink>(),
            "buddy heap leaf size must be at least mem::size_of::<BlockLink>() bytes"
        );
        assert!(
            LEAF_SIZE >= mem::align_of::<SizeClass>(),
            "buddy heap leaf size must be at least the alignment of the size-class table"
        );
    }

    /// Lays out the metadata, reserves the unusable parts of the region and
    /// seeds the free lists.
    ///
    /// # Safety
    ///
    /// See [`BuddyHeap::init`].
    unsafe fn init_in(
        base: NonNull<u8>,
        end: NonNull<u8>,
        backing_allocator: A,
    ) -> Result<BuddyHeap<LEAF_SIZE, A>, AllocInitError> {
        Self::assert_leaf_size_invariants();

        let region_len = end
            .addr()
            .get()
            .checked_sub(base.addr().get())
            .ok_or(AllocInitError::InvalidRegion)?;

        let heap_addr = geometry::round_up(base.addr().get(), LEAF_SIZE)
            .and_then(NonZeroUsize::new)
            .ok_or(AllocInitError::InvalidRegion)?;

        let len = end
            .addr()
            .get()
            .checked_sub(heap_addr.get())
            .ok_or(AllocInitError::RegionTooSmall)?;

        if len < LEAF_SIZE {
            return Err(AllocInitError::RegionTooSmall);
        }

        let geometry = Geometry::<LEAF_SIZE>::for_region(heap_addr, len)
            .ok_or(AllocInitError::InvalidRegion)?;
        let metadata = MetadataLayout::new(geometry).ok_or(AllocInitError::InvalidRegion)?;

        // The top block may extend past `end`. That tail, rounded up to a
        // leaf, is never handed out.
        let unavailable = geometry::round_up(geometry.heap_size() - len, LEAF_SIZE)
            .ok_or(AllocInitError::InvalidRegion)?;
        let free_limit = geometry.heap_size() - unavailable;

        if metadata.total > free_limit {
            return Err(AllocInitError::RegionTooSmall);
        }

        let base_ptr = BasePtr::new(base.with_addr(heap_addr), len);
        let classes = base_ptr.ptr().cast::<SizeClass>();

        // The table comes first, then every pair bitmap, then every split
        // bitmap.
        let mut alloc_ofs = metadata.table;
        let mut split_ofs = metadata.table + metadata.alloc;

        for k in 0..geometry.num_classes() {
            let num_blocks = geometry.num_blocks(k);

            let alloc_map = base_ptr.with_addr(heap_addr.saturating_add(alloc_ofs));
            let alloc = unsafe { PairBitmap::new(num_blocks, alloc_map) };
            alloc_ofs += PairBitmap::map_size(num_blocks);

            let split = if k > 0 {
                let split_map = base_ptr.with_addr(heap_addr.saturating_add(split_ofs));
                split_ofs += Bitmap::map_size(num_blocks);

                Some(unsafe { Bitmap::new(num_blocks, split_map) })
            } else {
                None
            };

            unsafe { classes.as_ptr().add(k).write(SizeClass::new(alloc, split)) };
        }

        debug_assert!(split_ofs <= metadata.total);

        let mut heap = BuddyHeap {
            base: base_ptr,
            geometry,
            classes,
            metadata_size: metadata.total,
            unavailable,
            region: base,
            region_len,
            backing_allocator,
        };

        let heap_start = heap_addr.get();
        let metadata_end = heap_start + metadata.total;
        let free_end = heap_start + free_limit;

        heap.mark_range(heap_start, metadata_end);
        heap.mark_range(free_end, heap_start + geometry.heap_size());

        let free = unsafe { heap.seed_free_lists(metadata_end, free_end) };
        let expected = free_limit - metadata.total;
        if free != expected {
            panic!(
                "buddy heap init: seeded {} free bytes, expected {}",
                free, expected
            );
        }

        debug!(
            "buddy heap at {:#x}: {} classes, {} bytes of metadata, {} bytes unavailable",
            heap_start,
            geometry.num_classes(),
            metadata.total,
            unavailable
        );
        info!(
            "buddy heap ready: {} of {} bytes free in blocks of {}..={} bytes",
            free,
            len,
            LEAF_SIZE,
            geometry.heap_size()
        );

        Ok(heap)
    }

    #[inline]
    fn class(&self, k: usize) -> &SizeClass {
        assert!(k < self.geometry.num_classes());

        // SAFETY: the table holds `num_classes` initialized entries.
        unsafe { &*self.classes.as_ptr().add(k) }
    }

    #[inline]
    fn class_mut(&mut self, k: usize) -> &mut SizeClass {
        assert!(k < self.geometry.num_classes());

        // SAFETY: the table holds `num_classes` initialized entries, and
        // `&mut self` guarantees exclusive access.
        unsafe { &mut *self.classes.as_ptr().add(k) }
    }

    /// Marks every block of every class overlapping `[start, stop)` as in use.
    ///
    /// Blocks above class 0 are also marked split, so that `release` never
    /// coalesces into the range.
    ///
    /// # Panics
    ///
    /// Panics if `start` or `stop` is not a multiple of `LEAF_SIZE`.
    fn mark_range(&mut self, start: usize, stop: usize) {
        if start % LEAF_SIZE != 0 || stop % LEAF_SIZE != 0 {
            panic!(
                "mark_range: bounds {:#x}..{:#x} are not aligned to {} bytes",
                start, stop, LEAF_SIZE
            );
        }

        if start >= stop {
            return;
        }

        let geometry = self.geometry;

        for k in 0..geometry.num_classes() {
            let first = geometry.block_index(k, start);
            let last = geometry.block_index_next(k, stop);
            let class = self.class_mut(k);

            for bi in first..last {
                if k > 0 {
                    // A block overlapping two reserved ranges is marked once.
                    if class.is_split(bi) {
                        continue;
                    }

                    class.set_split(bi);
                }

                class.flip_alloc(bi);
            }
        }
    }

    /// Publishes the free space in `[start, stop)` on the free lists.
    ///
    /// Only the two blocks of each class at the edges of the range can be
    /// half of a pair whose other half is reserved; every other free block
    /// is covered by a larger one. Returns the number of bytes made free.
    ///
    /// # Safety
    ///
    /// `[start, stop)` must have been left unmarked by `mark_range`, and the
    /// reserved ranges around it must have been marked.
    unsafe fn seed_free_lists(&mut self, start: usize, stop: usize) -> usize {
        let base = self.base;
        let geometry = self.geometry;
        let mut free = 0;

        for k in 0..geometry.max_class() {
            let num_blocks = geometry.num_blocks(k);
            let block_size = Geometry::<LEAF_SIZE>::block_size(k);
            let left = geometry.block_index_next(k, start);
            let right = geometry.block_index(k, stop);
            let class = self.class_mut(k);

            // The first block past the metadata is free when its buddy is not.
            if left < num_blocks && class.alloc_bit(left) {
                unsafe { class.push(base, geometry.address(k, left)) };
                free += block_size;
            }

            // The block holding `stop` is reserved, so its buddy is free when
            // the pair bit is set. If it shares a pair with `left`, that pair
            // was handled above.
            if right > left
                && right < num_blocks
                && right / 2 != left / 2
                && class.alloc_bit(right)
            {
                unsafe { class.push(base, geometry.address(k, buddy_index(right))) };
                free += block_size;
            }
        }

        free
    }

    /// Returns the size class of the allocated block at `addr`.
    ///
    /// A block of class `k` was produced by splitting its class `k + 1`
    /// parent, and none of the blocks below it are split, so the first class
    /// whose parent block is split is the block's class.
    fn size_class_of(&self, addr: usize) -> usize {
        let geometry = self.geometry;

        (0..geometry.max_class())
            .find(|&k| {
                self.class(k + 1)
                    .is_split(geometry.block_index(k + 1, addr))
            })
            .unwrap_or(geometry.max_class())
    }

    /// Attempts to allocate a block of at least `nbytes` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] spanning the whole block,
    /// which is the smallest block size that holds `nbytes`. A request for
    /// zero bytes is served with one leaf.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no free block is large enough. The heap is left
    /// unchanged in that case.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        let base = self.base;
        let geometry = self.geometry;
        let target = Geometry::<LEAF_SIZE>::find_first_k(nbytes);

        let mut k = match (target..geometry.num_classes()).find(|&k| !self.class(k).is_empty()) {
            Some(k) => k,
            None => {
                debug!("buddy heap: no free block for {} bytes", nbytes);
                return Err(AllocError);
            }
        };

        // SAFETY: every block on a free list lies within the heap.
        let block = unsafe { self.class_mut(k).pop(base) };
        self.class_mut(k)
            .flip_alloc(geometry.block_index(k, block.get()));

        // Split the block until it has the requested size. The front half
        // keeps the block's address and the back half goes on the free list
        // one class down.
        while k > target {
            let back_half = block.saturating_add(Geometry::<LEAF_SIZE>::block_size(k - 1));
            self.class_mut(k)
                .set_split(geometry.block_index(k, block.get()));

            let lower = self.class_mut(k - 1);
            lower.flip_alloc(geometry.block_index(k - 1, block.get()));
            unsafe { lower.push(base, back_half) };

            k -= 1;
        }

        trace!(
            "buddy heap: allocated {:#x} (class {}) for {} bytes",
            block.get(),
            target,
            nbytes
        );

        // The returned block inherits the provenance of the base pointer.
        Ok(base.with_addr_and_size(block, Geometry::<LEAF_SIZE>::block_size(target)))
    }

    /// Returns the block at `ptr` to the heap.
    ///
    /// The block is coalesced with its buddy for as long as the buddy is
    /// free, and the resulting block is put on the free list of its class.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is outside the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this heap. Releasing
    /// a block twice corrupts the heap.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let base = self.base;
        let geometry = self.geometry;

        // Immediately drop and shadow the pointer by converting it to an
        // address. This indicates to the compiler that the base pointer has
        // sole access to the block.
        let mut block = ptr.addr();
        assert!(
            base.contains_addr(block),
            "release: {:#x} is outside the heap",
            block.get()
        );

        let mut k = self.size_class_of(block.get());

        while k < geometry.max_class() {
            let bi = geometry.block_index(k, block.get());
            let buddy = buddy_index(bi);
            let class = self.class_mut(k);

            class.flip_alloc(bi);

            // With this block now free, a clear pair bit means the buddy is
            // free too.
            if class.alloc_bit(buddy) {
                break;
            }

            let buddy_addr = geometry.address(k, buddy);
            unsafe { class.remove(base, buddy_addr) };

            // The merged block is addressed by its front half.
            if buddy % 2 == 0 {
                block = buddy_addr;
            }

            self.class_mut(k + 1)
                .clear_split(geometry.block_index(k + 1, block.get()));
            k += 1;
        }

        unsafe { self.class_mut(k).push(base, block) };

        trace!("buddy heap: released {:#x} as class {}", block.get(), k);
    }

    /// Returns the smallest size class whose blocks hold `nbytes` bytes, or
    /// `None` if no block of this heap is that large.
    pub fn class_for(&self, nbytes: usize) -> Option<usize> {
        let k = Geometry::<LEAF_SIZE>::find_first_k(nbytes);

        (k < self.geometry.num_classes()).then(|| k)
    }

    /// Returns the size in bytes of a block of class `k`.
    #[inline]
    pub fn block_size(&self, k: usize) -> usize {
        Geometry::<LEAF_SIZE>::block_size(k)
    }

    /// Returns a pointer to the leaf-aligned start of the managed region.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base.ptr()
    }

    /// Returns the number of size classes.
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.geometry.num_classes()
    }

    /// Returns the index of the largest size class.
    #[inline]
    pub fn max_class(&self) -> usize {
        self.geometry.max_class()
    }

    /// Returns the capacity of the top-class block.
    ///
    /// This is at least the length of the managed region.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.geometry.heap_size()
    }

    /// Returns the number of bytes used by the heap's own metadata.
    #[inline]
    pub fn metadata_size(&self) -> usize {
        self.metadata_size
    }

    /// Returns the number of bytes between the end of the region and the
    /// top block's capacity, rounded up to a leaf.
    #[inline]
    pub fn unavailable(&self) -> usize {
        self.unavailable
    }

    /// Counts the free blocks of each size class.
    ///
    /// This walks every free list, so it takes time proportional to the
    /// number of free blocks.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::new(self.heap_size(), self.metadata_size, self.unavailable);

        for k in 0..self.num_classes() {
            // SAFETY: every block on a free list lies within the heap.
            let free_blocks = unsafe { self.class(k).free_blocks(self.base) }.count();

            stats.push(ClassStats {
                class: k,
                block_size: self.block_size(k),
                free_blocks,
            });
        }

        stats
    }
}

impl<const LEAF_SIZE: usize, A: BackingAllocator> fmt::Debug for BuddyHeap<LEAF_SIZE, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyHeap")
            .field("base", &self.base.ptr())
            .field("leaf_size", &LEAF_SIZE)
            .field("num_classes", &self.geometry.num_classes())
            .field("metadata_size", &self.metadata_size)
            .field("unavailable", &self.unavailable)
            .finish_non_exhaustive()
    }
}

impl<const LEAF_SIZE: usize, A: BackingAllocator> Drop for BuddyHeap<LEAF_SIZE, A> {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.region_len, LEAF_SIZE) {
            unsafe { self.backing_allocator.deallocate(self.region, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;

    type Heap = BuddyHeap<16, Global>;

    fn heap(len: usize) -> Heap {
        Heap::try_new(len).unwrap()
    }

    fn offset(heap: &Heap, block: NonNull<u8>) -> usize {
        block.as_ptr() as usize - heap.base().as_ptr() as usize
    }

    /// The sorted free-list contents of every class.
    fn snapshot(heap: &Heap) -> Vec<Vec<usize>> {
        (0..heap.num_classes())
            .map(|k| {
                let mut blocks: Vec<usize> = unsafe { heap.class(k).free_blocks(heap.base) }
                    .map(|b| b.get())
                    .collect();
                blocks.sort_unstable();
                blocks
            })
            .collect()
    }

    fn free_list_contains(heap: &Heap, k: usize, block: NonNull<u8>) -> bool {
        let mut blocks = unsafe { heap.class(k).free_blocks(heap.base) };
        blocks.any(|b| b.get() == block.as_ptr() as usize)
    }

    #[test]
    fn top_block_is_never_free() {
        let mut heap = heap(1024);

        assert_eq!(heap.num_classes(), 7);
        assert_eq!(heap.heap_size(), 1024);
        assert_eq!(heap.unavailable(), 0);

        // The metadata occupies the front of the heap.
        assert!(heap.allocate(1024).is_err());
    }

    #[test]
    fn largest_free_block_allocates_once() {
        let mut heap = heap(1024);

        let largest = heap.stats().largest_free_class().unwrap();
        let size = heap.block_size(largest);

        let block = heap.allocate(size).unwrap();
        assert_eq!(block.len(), size);
        assert!(heap.allocate(size).is_err());

        unsafe { heap.release(block.cast()) };
        assert!(heap.allocate(size).is_ok());
    }

    #[test]
    fn release_out_of_order_restores_free_lists() {
        let mut heap = heap(1024);
        let initial = snapshot(&heap);
        let initial_stats = heap.stats();

        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        let c = heap.allocate(16).unwrap();

        unsafe {
            heap.release(b.cast());
            heap.release(a.cast());
            heap.release(c.cast());
        }

        assert_eq!(snapshot(&heap), initial);
        assert_eq!(heap.stats(), initial_stats);
    }

    #[test]
    fn request_rounds_up_to_next_class() {
        let mut heap = heap(4096);

        let block = heap.allocate(17).unwrap();
        assert_eq!(block.len(), 32);
        assert_eq!(offset(&heap, block.cast()) % 32, 0);
        assert_eq!(heap.size_class_of(block.cast::<u8>().as_ptr() as usize), 1);

        let block = heap.allocate(100).unwrap();
        assert_eq!(block.len(), 128);
        assert_eq!(heap.size_class_of(block.cast::<u8>().as_ptr() as usize), 3);
    }

    #[test]
    fn zero_byte_request_gets_a_leaf() {
        let mut heap = heap(1024);

        assert_eq!(heap.allocate(0).unwrap().len(), 16);
    }

    #[test]
    fn seeded_free_space_matches_layout() {
        for len in [
            1024, 1040, 1030, 3000, 4096, 12345, 65536, 100_000, 1 << 20,
        ] {
            let heap = heap(len);
            let stats = heap.stats();

            assert_eq!(
                stats.total_free_bytes(),
                heap.heap_size() - heap.metadata_size() - heap.unavailable(),
                "len = {}",
                len
            );
            assert_eq!(heap.heap_size() - heap.unavailable(), len / 16 * 16);
            assert_eq!(stats.allocated_bytes(), 0);
        }
    }

    #[test]
    fn freeing_both_buddies_merges_them() {
        let mut heap = heap(4096);
        let initial = snapshot(&heap);

        let mut leaves = Vec::new();
        while let Ok(block) = heap.allocate(16) {
            leaves.push(block.cast::<u8>());
        }
        assert_eq!(heap.stats().total_free_blocks(), 0);

        let is_pair =
            |lo: NonNull<u8>, hi: NonNull<u8>| offset(&heap, hi) == offset(&heap, lo) + 16;

        let lo_idx = leaves
            .iter()
            .position(|&lo| {
                offset(&heap, lo) % 32 == 0 && leaves.iter().any(|&hi| is_pair(lo, hi))
            })
            .unwrap();
        let lo = leaves.swap_remove(lo_idx);
        let hi_idx = leaves.iter().position(|&hi| is_pair(lo, hi)).unwrap();
        let hi = leaves.swap_remove(hi_idx);

        unsafe { heap.release(hi) };
        assert_eq!(heap.stats().classes()[0].free_blocks, 1);
        assert!(free_list_contains(&heap, 0, hi));

        unsafe { heap.release(lo) };
        let stats = heap.stats();
        assert_eq!(stats.classes()[0].free_blocks, 0);
        assert_eq!(stats.classes()[1].free_blocks, 1);
        assert!(free_list_contains(&heap, 1, lo));

        for leaf in leaves {
            unsafe { heap.release(leaf) };
        }

        assert_eq!(snapshot(&heap), initial);
    }

    #[test]
    fn exhaustion_boundary() {
        let mut heap = heap(4096);

        let largest = heap.stats().largest_free_class().unwrap();
        let size = heap.block_size(largest);

        assert!(heap.allocate(size + 1).is_err());
        assert!(heap.allocate(size).is_ok());
    }

    #[test]
    fn failed_allocation_changes_nothing() {
        let mut heap = heap(3000);
        let _held = heap.allocate(100).unwrap();
        let before = snapshot(&heap);

        assert!(heap.allocate(heap.heap_size()).is_err());
        assert!(heap.allocate(usize::MAX).is_err());

        assert_eq!(snapshot(&heap), before);
    }

    #[test]
    fn blocks_are_aligned_and_disjoint() {
        let mut heap = heap(1 << 16);
        let initial = snapshot(&heap);

        let mut blocks: Vec<NonNull<[u8]>> = Vec::new();
        for size in [16, 100, 17, 4000, 64, 1, 512, 33, 9000, 16, 2048].iter().cycle().take(60) {
            if let Ok(block) = heap.allocate(*size) {
                blocks.push(block);
            }
        }

        for (i, a) in blocks.iter().enumerate() {
            let a_start = offset(&heap, a.cast());
            assert_eq!(a.cast::<u8>().as_ptr() as usize % 16, 0);
            assert_eq!(a_start % a.len(), 0);

            for b in &blocks[i + 1..] {
                let b_start = offset(&heap, b.cast());
                assert!(a_start + a.len() <= b_start || b_start + b.len() <= a_start);
            }
        }

        for block in blocks.into_iter().rev() {
            unsafe { heap.release(block.cast()) };
        }

        assert_eq!(snapshot(&heap), initial);
    }

    #[test]
    fn region_too_small() {
        assert_eq!(Heap::try_new(0).unwrap_err(), AllocInitError::RegionTooSmall);
        assert_eq!(Heap::try_new(8).unwrap_err(), AllocInitError::RegionTooSmall);

        // Three classes of metadata need 128 bytes.
        assert_eq!(Heap::try_new(64).unwrap_err(), AllocInitError::RegionTooSmall);
    }

    #[test]
    fn raw_region_is_leaf_aligned() {
        let mut buf = std::vec![0u8; 4096 + 64];
        let range = buf.as_mut_ptr_range();
        let start = NonNull::new(range.start.wrapping_add(3)).unwrap();
        let end = NonNull::new(range.end).unwrap();

        let mut heap: BuddyHeap<16, Raw> = unsafe { BuddyHeap::init(start, end) }.unwrap();
        assert_eq!(heap.base().as_ptr() as usize % 16, 0);

        let stats = heap.stats();
        assert_eq!(
            stats.total_free_bytes(),
            heap.heap_size() - heap.metadata_size() - heap.unavailable()
        );

        let block = heap.allocate(256).unwrap();
        unsafe { heap.release(block.cast()) };
        assert_eq!(heap.stats(), stats);
    }

    #[test]
    fn raw_region_end_before_base() {
        let mut buf = std::vec![0u8; 256];
        let range = buf.as_mut_ptr_range();
        let start = NonNull::new(range.start.wrapping_add(64)).unwrap();
        let end = NonNull::new(range.start).unwrap();

        let res: Result<BuddyHeap<16, Raw>, _> = unsafe { BuddyHeap::init(start, end) };
        assert_eq!(res.unwrap_err(), AllocInitError::InvalidRegion);
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn mark_range_rejects_unaligned_bounds() {
        let mut heap = heap(1024);
        let start = heap.base().as_ptr() as usize;

        heap.mark_range(start + 8, start + 32);
    }

    #[test]
    #[should_panic(expected = "outside the heap")]
    fn release_outside_heap_panics() {
        let mut heap = heap(1024);

        unsafe { heap.release(NonNull::dangling()) };
    }
}
