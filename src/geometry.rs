//! Address and index arithmetic for size classes.
//!
//! Class `k` holds blocks of `LEAF_SIZE << k` bytes. The largest class spans
//! the whole heap, so class `k` has `1 << (max_class - k)` blocks.

use core::num::NonZeroUsize;

/// Returns `floor(log2(n))`, with `log2(0) == log2(1) == 0`.
#[inline]
pub fn log2(n: usize) -> usize {
    match n {
        0 => 0,
        n => n.ilog2() as usize,
    }
}

/// Rounds `n` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub fn round_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());

    Some(n.checked_add(align - 1)? & !(align - 1))
}

/// The shape of a heap: where it starts and how many size classes it has.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry<const LEAF_SIZE: usize> {
    base: NonZeroUsize,
    num_classes: usize,
}

impl<const LEAF_SIZE: usize> Geometry<LEAF_SIZE> {
    /// Computes the geometry of a heap of `len` bytes starting at `base`.
    ///
    /// The top class is the smallest one whose block covers `len` bytes.
    /// Returns `None` if `len` is smaller than one leaf or if the top block
    /// would not fit in the address space.
    pub fn for_region(base: NonZeroUsize, len: usize) -> Option<Geometry<LEAF_SIZE>> {
        if len < LEAF_SIZE {
            return None;
        }

        let mut num_classes = log2(len / LEAF_SIZE) + 1;

        // Classes beyond this bound would have blocks larger than the address space.
        let class_limit = (usize::BITS - LEAF_SIZE.trailing_zeros()) as usize;
        if num_classes > class_limit {
            return None;
        }

        if len > Self::block_size(num_classes - 1) {
            num_classes += 1;
            if num_classes > class_limit {
                return None;
            }
        }

        let geometry = Geometry { base, num_classes };
        base.get().checked_add(geometry.heap_size())?;

        Some(geometry)
    }

    /// Returns the address of the first byte of the heap.
    #[inline]
    pub fn base(self) -> NonZeroUsize {
        self.base
    }

    #[inline]
    pub fn num_classes(self) -> usize {
        self.num_classes
    }

    /// Returns the index of the largest size class.
    #[inline]
    pub fn max_class(self) -> usize {
        self.num_classes - 1
    }

    /// Returns the size in bytes of a block of class `k`.
    #[inline]
    pub const fn block_size(k: usize) -> usize {
        LEAF_SIZE << k
    }

    /// Returns the number of blocks of class `k` spanning the heap.
    #[inline]
    pub fn num_blocks(self, k: usize) -> usize {
        1 << (self.max_class() - k)
    }

    /// Returns the size in bytes of the top-class block.
    #[inline]
    pub fn heap_size(self) -> usize {
        Self::block_size(self.max_class())
    }

    /// Returns the smallest class whose blocks hold at least `n` bytes.
    ///
    /// The result may exceed the top class of any real heap; `usize::BITS`
    /// is returned when no class could ever satisfy `n`.
    pub fn find_first_k(n: usize) -> usize {
        let leaves = n / LEAF_SIZE + (n % LEAF_SIZE != 0) as usize;

        leaves
            .checked_next_power_of_two()
            .map_or(usize::BITS as usize, |p| p.trailing_zeros() as usize)
    }

    #[inline]
    fn offset_of(self, addr: usize) -> usize {
        addr.checked_sub(self.base.get())
            .expect("address precedes heap base")
    }

    /// Returns the index of the class-`k` block containing `addr`.
    #[inline]
    pub fn block_index(self, k: usize, addr: usize) -> usize {
        self.offset_of(addr) / Self::block_size(k)
    }

    /// Returns the index of the first class-`k` block starting at or after
    /// `addr`.
    #[inline]
    pub fn block_index_next(self, k: usize, addr: usize) -> usize {
        let ofs = self.offset_of(addr);
        let size = Self::block_size(k);

        ofs / size + (ofs % size != 0) as usize
    }

    /// Returns the address of block `bi` of class `k`.
    #[inline]
    pub fn address(self, k: usize, bi: usize) -> NonZeroUsize {
        self.base.saturating_add(bi * Self::block_size(k))
    }
}

/// Returns the index of the buddy of block `bi`.
#[inline]
pub const fn buddy_index(bi: usize) -> usize {
    bi ^ 1
}

#[cfg(test)]
mod tests {
    use super::*;

    type Geo = Geometry<16>;

    fn geo(len: usize) -> Geo {
        Geo::for_region(NonZeroUsize::new(0x1000).unwrap(), len).unwrap()
    }

    #[test]
    fn log2_floors() {
        assert_eq!(log2(1), 0);
        assert_eq!(log2(2), 1);
        assert_eq!(log2(3), 1);
        assert_eq!(log2(1024), 10);
        assert_eq!(log2(1025), 10);
    }

    #[test]
    fn first_k_is_minimal() {
        assert_eq!(Geo::find_first_k(0), 0);
        assert_eq!(Geo::find_first_k(1), 0);
        assert_eq!(Geo::find_first_k(16), 0);
        assert_eq!(Geo::find_first_k(17), 1);
        assert_eq!(Geo::find_first_k(32), 1);
        assert_eq!(Geo::find_first_k(33), 2);
        assert_eq!(Geo::find_first_k(4096), 8);
        assert!(Geo::find_first_k(usize::MAX) >= usize::BITS as usize - 4);

        for n in 1..5000 {
            let k = Geo::find_first_k(n);
            assert!(Geo::block_size(k) >= n);
            assert!(k == 0 || Geo::block_size(k - 1) < n);
        }
    }

    #[test]
    fn class_count_covers_region() {
        // An exact power of two needs no extra class.
        assert_eq!(geo(1024).num_classes(), 7);
        assert_eq!(geo(1024).heap_size(), 1024);

        // Anything past it needs one more.
        assert_eq!(geo(1040).num_classes(), 8);
        assert_eq!(geo(3000).num_classes(), 9);
        assert_eq!(geo(3000).heap_size(), 4096);

        // A tail smaller than a leaf still counts.
        assert_eq!(geo(1030).heap_size(), 2048);

        assert_eq!(geo(16).num_classes(), 1);
        assert!(Geo::for_region(NonZeroUsize::new(0x1000).unwrap(), 15).is_none());
    }

    #[test]
    fn oversized_region_is_rejected() {
        let base = NonZeroUsize::new(0x1000).unwrap();
        assert!(Geo::for_region(base, usize::MAX - 0x1000).is_none());
    }

    #[test]
    fn index_round_trip() {
        let g = geo(4096);
        let base = g.base().get();

        assert_eq!(g.num_blocks(0), 256);
        assert_eq!(g.num_blocks(g.max_class()), 1);

        assert_eq!(g.block_index(0, base + 48), 3);
        assert_eq!(g.block_index(2, base + 127), 1);
        assert_eq!(g.address(2, 1).get(), base + 64);

        // Aligned addresses agree; unaligned ones round up.
        assert_eq!(g.block_index_next(2, base + 128), 2);
        assert_eq!(g.block_index_next(2, base + 129), 3);
        assert_eq!(g.block_index_next(2, base + 191), 3);
    }

    #[test]
    fn buddies_pair_up() {
        assert_eq!(buddy_index(0), 1);
        assert_eq!(buddy_index(1), 0);
        assert_eq!(buddy_index(6), 7);
        assert_eq!(buddy_index(7), 6);
    }
}
