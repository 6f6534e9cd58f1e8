use core::ptr::NonNull;

/// A packed array of bits stored in heap metadata.
///
/// Bit `i` lives in byte `i / 8` at position `i % 8`.
pub struct Bitmap {
    num_bits: usize,
    map: NonNull<u8>,
}

impl Bitmap {
    /// Returns the number of bytes required to back a bitmap of `num_bits` bits.
    #[inline]
    pub const fn map_size(num_bits: usize) -> usize {
        (num_bits + u8::BITS as usize - 1) / u8::BITS as usize
    }

    /// Constructs a new, zeroed bitmap of `num_bits` bits, backed by `map`.
    ///
    /// # Safety
    ///
    /// `map` must be valid for reads and writes for `Bitmap::map_size(num_bits)`
    /// bytes, and no other reference to that memory may exist for the
    /// lifetime of the returned `Bitmap`.
    pub unsafe fn new(num_bits: usize, map: NonNull<u8>) -> Bitmap {
        assert!(num_bits > 0);

        unsafe { map.as_ptr().write_bytes(0, Self::map_size(num_bits)) };

        Bitmap { num_bits, map }
    }

    /// Returns a tuple of the index of the byte containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u8) {
        (bit / u8::BITS as usize, 1 << (bit % u8::BITS as usize))
    }

    #[inline]
    fn byte_ptr(&self, index: usize) -> (*mut u8, u8) {
        assert!(index < self.num_bits, "bitmap index out of range");

        let (byte_idx, mask) = Self::index_and_mask(index);

        // SAFETY: `index < num_bits`, so `byte_idx` is within the backing
        // allocation.
        (unsafe { self.map.as_ptr().add(byte_idx) }, mask)
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        let (byte, mask) = self.byte_ptr(index);

        unsafe { byte.read() & mask == mask }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        let (byte, mask) = self.byte_ptr(index);

        unsafe {
            let old = byte.read();
            byte.write(match value {
                true => old | mask,
                false => old & !mask,
            });
        }
    }

    /// Clears the indexed bit.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        self.set(index, false);
    }

    /// Toggles the value of the indexed bit.
    #[inline]
    pub fn toggle(&mut self, index: usize) {
        let (byte, mask) = self.byte_ptr(index);

        unsafe { byte.write(byte.read() ^ mask) };
    }
}

/// A bitmap with one bit shared by each buddy pair.
///
/// The bit of pair `(2i, 2i + 1)` is the XOR of the two blocks' states, so
/// it is set exactly when one block of the pair is in use and the other is
/// not. Callers always know the state of the block they are toggling, which
/// is enough to recover the state of its buddy.
pub struct PairBitmap(Bitmap);

impl PairBitmap {
    /// Returns the number of bytes required to track `num_blocks` blocks.
    ///
    /// The block count is rounded up to a multiple of 16 before halving,
    /// so every pair bitmap occupies at least one byte.
    #[inline]
    pub const fn map_size(num_blocks: usize) -> usize {
        let rounded = (num_blocks + 15) / 16 * 16;
        rounded / u8::BITS as usize / 2
    }

    /// Constructs a new, zeroed pair bitmap for `num_blocks` blocks.
    ///
    /// # Safety
    ///
    /// `map` must be valid for reads and writes for
    /// `PairBitmap::map_size(num_blocks)` bytes, and no other reference to
    /// that memory may exist for the lifetime of the returned value.
    pub unsafe fn new(num_blocks: usize, map: NonNull<u8>) -> PairBitmap {
        let num_bits = Self::map_size(num_blocks) * u8::BITS as usize;

        PairBitmap(unsafe { Bitmap::new(num_bits, map) })
    }

    /// Flips the bit shared by `block` and its buddy.
    #[inline]
    pub fn flip(&mut self, block: usize) {
        self.0.toggle(block / 2);
    }

    /// Returns the bit shared by `block` and its buddy.
    #[inline]
    pub fn get(&self, block: usize) -> bool {
        self.0.get(block / 2)
    }
}
