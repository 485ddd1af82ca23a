//! Reseedable universal hash functions for mapping keys to slot indices.

use rand::{thread_rng, Rng};

/// The prime modulus for the hash family, the first prime above `2^31`.
pub(crate) const HASH_MODULUS: u64 = 2_147_483_659;

/// A member of the universal hash family `((a * k + b) mod p) & (size - 1)`,
/// where `a` and `b` are drawn at random, and `size` is a power of two.
///
/// The randomness is only there to defeat pathological key sets, so the
/// thread local generator is used rather than a cryptographic one.
#[derive(Clone, Debug)]
pub(crate) struct HashFunc {
    /// Multiplier, in `[1, p - 1]`.
    multiplier: u32,
    /// Offset, in `[0, p - 1]`.
    offset: u32,
    /// Mask for the size of the table the function indexes.
    size_mask: u32,
}

impl HashFunc {
    /// Creates a new, randomly seeded, hash function for a table with `size`
    /// slots.
    ///
    /// # Assertations
    ///
    /// This will assert if `size` is not a power of two.
    pub(crate) fn new(size: usize) -> HashFunc {
        let mut hash = HashFunc {
            multiplier: 1,
            offset: 0,
            size_mask: 0,
        };
        hash.reseed_for_size(size);
        hash
    }

    /// Returns the index in `[0, size)` for the `key`.
    #[inline]
    pub(crate) fn hash(&self, key: u32) -> u32 {
        let product = self.multiplier as u64 * key as u64 + self.offset as u64;
        (product % HASH_MODULUS) as u32 & self.size_mask
    }

    /// Draws a new multiplier and offset, keeping the table size.
    pub(crate) fn reseed(&mut self) {
        let mut rng = thread_rng();
        self.multiplier = rng.gen_range(1..HASH_MODULUS) as u32;
        self.offset = rng.gen_range(0..HASH_MODULUS) as u32;
    }

    /// Updates the table size to `size` and reseeds the function.
    ///
    /// # Assertations
    ///
    /// This will assert if `size` is not a power of two.
    pub(crate) fn reseed_for_size(&mut self, size: usize) {
        assert!(size.is_power_of_two() && size as u64 <= 1 << 31);
        self.size_mask = (size - 1) as u32;
        self.reseed();
    }

    /// Returns the size of the table the function maps into.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size_mask as usize + 1
    }
}
