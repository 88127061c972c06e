use core::ops::Range;

use crate::PAGE_SIZE;

/// The number of bytes tracked by a single bit.
pub const UNIT: usize = 16;

const NUM_BITS: usize = PAGE_SIZE / UNIT;
const NUM_WORDS: usize = NUM_BITS / u64::BITS as usize;

const _: () = assert!(NUM_BITS % u64::BITS as usize == 0);

/// An allocation bitmap covering one page, with one bit per [`UNIT`] bytes.
///
/// A set bit marks the unit as allocated.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    map: [u64; NUM_WORDS],
}

impl Bitmap {
    /// Returns a bitmap with every bit cleared.
    pub const fn new() -> Bitmap {
        Bitmap {
            map: [0; NUM_WORDS],
        }
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Converts a byte range within the page into a range of bits.
    #[inline]
    fn units(ofs: usize, len: usize) -> Range<usize> {
        assert_eq!(ofs % UNIT, 0, "range start is not unit-aligned");
        assert_eq!(len % UNIT, 0, "range length is not a whole number of units");
        assert!(ofs + len <= PAGE_SIZE, "range extends past the page");

        (ofs / UNIT)..((ofs + len) / UNIT)
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < NUM_BITS);

        let (word, mask) = Self::index_and_mask(index);

        self.map[word] & mask != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < NUM_BITS);

        let (word, mask) = Self::index_and_mask(index);

        match value {
            true => self.map[word] |= mask,
            false => self.map[word] &= !mask,
        }
    }

    /// Sets every bit covering the `len` bytes starting `ofs` bytes into the
    /// page.
    pub fn set_range(&mut self, ofs: usize, len: usize, value: bool) {
        for bit in Self::units(ofs, len) {
            self.set(bit, value);
        }
    }

    /// Returns `true` if no bit covering the `len` bytes starting `ofs` bytes
    /// into the page is set.
    pub fn is_range_clear(&self, ofs: usize, len: usize) -> bool {
        Self::units(ofs, len).all(|bit| !self.get(bit))
    }

    /// Returns `true` if no bit is set.
    pub fn is_clear(&self) -> bool {
        self.map.iter().all(|&word| word == 0)
    }
}
