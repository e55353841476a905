use core::ptr::NonNull;

/// A packed array of bits stored in externally owned memory.
///
/// Bit `i` lives in byte `i / 8` under the mask `1 << (i % 8)`.
pub struct Bitmap {
    num_bits: usize,
    map: NonNull<u8>,
}

impl Bitmap {
    /// Returns the number of bytes needed to hold `num_bits` bits.
    #[inline]
    pub const fn num_bytes(num_bits: usize) -> usize {
        num_bits / 8 + (num_bits % 8 != 0) as usize
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// Every bit starts cleared.
    ///
    /// # Safety
    ///
    /// `map` must be valid for reads and writes for
    /// `Bitmap::num_bytes(num_bits)` bytes for as long as the returned value
    /// is used, and no other access to that memory may occur in the meantime.
    pub unsafe fn new(num_bits: usize, map: NonNull<u8>) -> Bitmap {
        assert!(num_bits > 0);

        unsafe { map.as_ptr().write_bytes(0, Self::num_bytes(num_bits)) };

        Bitmap { num_bits, map }
    }

    #[inline]
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Returns the base pointer of the backing memory.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.map
    }

    /// Returns a tuple of the index of the byte containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u8) {
        (bit / u8::BITS as usize, 1 << (bit % u8::BITS as usize))
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        // SAFETY: `new` requires `map` to be valid for `num_bytes` bytes.
        unsafe { core::slice::from_raw_parts(self.map.as_ptr(), Self::num_bytes(self.num_bits)) }
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe {
            core::slice::from_raw_parts_mut(self.map.as_ptr(), Self::num_bytes(self.num_bits))
        }
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits, "bit {index} out of range");

        let (byte_idx, mask) = Self::index_and_mask(index);
        self.bytes()[byte_idx] & mask != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits, "bit {index} out of range");

        let (byte_idx, mask) = Self::index_and_mask(index);
        let byte = &mut self.bytes_mut()[byte_idx];
        *byte = match value {
            true => *byte | mask,
            false => *byte & !mask,
        };
    }

    /// Returns `true` if no bit is set.
    pub fn is_clear(&self) -> bool {
        // Bits past `num_bits` in the last byte are never written.
        self.bytes().iter().all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;

    struct VecBitmap {
        bitmap: Bitmap,
        _storage: Vec<u8>,
    }

    impl VecBitmap {
        fn new(num_bits: usize) -> VecBitmap {
            // Start dirty to check that `Bitmap::new` clears its storage.
            let mut storage = std::vec![0xA5; Bitmap::num_bytes(num_bits)];
            let map = NonNull::new(storage.as_mut_ptr()).unwrap();

            VecBitmap {
                bitmap: unsafe { Bitmap::new(num_bits, map) },
                _storage: storage,
            }
        }
    }

    #[test]
    fn num_bytes_rounds_up() {
        assert_eq!(Bitmap::num_bytes(1), 1);
        assert_eq!(Bitmap::num_bytes(8), 1);
        assert_eq!(Bitmap::num_bytes(9), 2);
        assert_eq!(Bitmap::num_bytes(15), 2);
        assert_eq!(Bitmap::num_bytes(16), 2);
        assert_eq!(Bitmap::num_bytes(17), 3);
    }

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            let v = VecBitmap::new(num_bits);
            assert!(v.bitmap.is_clear());
            assert!((0..num_bits).all(|i| !v.bitmap.get(i)));
        }
    }

    #[test]
    fn bits_are_independent() {
        let mut v = VecBitmap::new(31);
        let bitmap = &mut v.bitmap;

        for i in (0..31).step_by(3) {
            bitmap.set(i, true);
        }

        for i in 0..31 {
            assert_eq!(bitmap.get(i), i % 3 == 0, "bit {i}");
        }

        bitmap.set(3, false);
        bitmap.set(4, true);
        assert!(!bitmap.get(3));
        assert!(bitmap.get(4));
        assert!(bitmap.get(6));

        for i in 0..31 {
            bitmap.set(i, false);
        }
        assert!(bitmap.is_clear());
    }

    #[test]
    #[should_panic]
    fn get_out_of_range_panics() {
        let v = VecBitmap::new(15);
        v.bitmap.get(15);
    }
}
