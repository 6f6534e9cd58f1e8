//! Free-space statistics.

use core::fmt;

/// The maximum number of size classes a heap can have.
pub const MAX_CLASSES: usize = usize::BITS as usize;

/// Free-space statistics for one size class.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// The index of the size class.
    pub class: usize,
    /// The size in bytes of a block of this class.
    pub block_size: usize,
    /// The number of blocks on this class's free list.
    pub free_blocks: usize,
}

impl ClassStats {
    /// Returns the number of free bytes held by this class.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_blocks * self.block_size
    }
}

/// A snapshot of a heap's free space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapStats {
    classes: [ClassStats; MAX_CLASSES],
    num_classes: usize,
    /// The capacity of the top-class block.
    pub heap_size: usize,
    /// The number of bytes used by the heap's own metadata.
    pub metadata_size: usize,
    /// The number of bytes past the end of the region that are never used.
    pub unavailable: usize,
}

impl HeapStats {
    pub(crate) fn new(heap_size: usize, metadata_size: usize, unavailable: usize) -> HeapStats {
        HeapStats {
            classes: [ClassStats::default(); MAX_CLASSES],
            num_classes: 0,
            heap_size,
            metadata_size,
            unavailable,
        }
    }

    pub(crate) fn push(&mut self, class: ClassStats) {
        assert!(self.num_classes < MAX_CLASSES, "too many size classes");

        self.classes[self.num_classes] = class;
        self.num_classes += 1;
    }

    /// Returns the statistics of each size class, smallest first.
    #[inline]
    pub fn classes(&self) -> &[ClassStats] {
        &self.classes[..self.num_classes]
    }

    /// Returns the total number of free bytes.
    pub fn total_free_bytes(&self) -> usize {
        self.classes().iter().map(ClassStats::free_bytes).sum()
    }

    /// Returns the total number of free blocks across all classes.
    pub fn total_free_blocks(&self) -> usize {
        self.classes().iter().map(|c| c.free_blocks).sum()
    }

    /// Returns the largest class with a free block, if any.
    pub fn largest_free_class(&self) -> Option<usize> {
        self.classes()
            .iter()
            .rev()
            .find(|c| c.free_blocks > 0)
            .map(|c| c.class)
    }

    /// Returns the number of usable bytes not currently free.
    ///
    /// This counts whole blocks, so it includes any rounding of requests up
    /// to a block size.
    pub fn allocated_bytes(&self) -> usize {
        self.heap_size - self.metadata_size - self.unavailable - self.total_free_bytes()
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "class  block size  free blocks  free bytes")?;

        for c in self.classes() {
            writeln!(
                f,
                "{:>5}  {:>#10x}  {:>11}  {:>#10x}",
                c.class,
                c.block_size,
                c.free_blocks,
                c.free_bytes()
            )?;
        }

        writeln!(f, "Heap size:   0x{:x}", self.heap_size)?;
        writeln!(f, "Metadata:    0x{:x}", self.metadata_size)?;
        writeln!(f, "Unavailable: 0x{:x}", self.unavailable)?;
        writeln!(f, "Free:        0x{:x}", self.total_free_bytes())?;
        writeln!(f, "Allocated:   0x{:x}", self.allocated_bytes())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString;

    use super::*;

    fn sample() -> HeapStats {
        let mut stats = HeapStats::new(1024, 304, 0);
        for (k, free_blocks) in [1, 0, 1, 1, 0, 1, 0].into_iter().enumerate() {
            stats.push(ClassStats {
                class: k,
                block_size: 16 << k,
                free_blocks,
            });
        }
        stats
    }

    #[test]
    fn totals() {
        let stats = sample();

        assert_eq!(stats.classes().len(), 7);
        assert_eq!(stats.total_free_blocks(), 4);
        assert_eq!(stats.total_free_bytes(), 16 + 64 + 128 + 512);
        assert_eq!(stats.allocated_bytes(), 0);
        assert_eq!(stats.largest_free_class(), Some(5));
    }

    #[test]
    fn empty_heap_has_no_largest_class() {
        let mut stats = HeapStats::new(64, 64, 0);
        stats.push(ClassStats {
            class: 0,
            block_size: 16,
            free_blocks: 0,
        });

        assert_eq!(stats.largest_free_class(), None);
    }

    #[test]
    fn display_lists_every_class() {
        let text = sample().to_string();

        assert_eq!(text.lines().count(), 1 + 7 + 5);
        assert!(text.contains("Metadata:    0x130"));
    }
}
