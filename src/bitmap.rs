//! Hierarchical bitmap over up to 2^24 indices.
//!
//! Level 0 holds one bit per index; each bit of level k is set iff the
//! corresponding word of level k-1 has any set bit. Finding the first set
//! bit is one `trailing_zeros` per level, so `find_first_set` touches at
//! most four words regardless of capacity.

/// Number of bits in one word of the tree.
const BITS: usize = 64;

/// Returned when no index satisfies a query.
pub const INVALID_INDEX: u32 = u32::MAX;

/// A multi-level bitmap where a set bit means "free".
///
/// Capacity is fixed at construction. Bits beyond the capacity in the last
/// level-0 word are permanently zero, so searches never yield an
/// out-of-range index.
pub struct HierarchicalBitmap {
    capacity: u32,
    /// levels[0] is the index bits; levels[1..] are the summary levels,
    /// topmost last. The topmost level is always a single word.
    levels: Vec<Vec<u64>>,
}

fn words_for(bits: usize) -> usize {
    bits.div_ceil(BITS)
}

impl HierarchicalBitmap {
    /// Create a bitmap with every in-range bit set (all free).
    pub fn new_all_set(capacity: u32) -> Self {
        let mut map = Self::new_all_clear(capacity);
        for i in 0..capacity {
            map.set(i);
        }
        map
    }

    /// Create a bitmap with every bit clear (all taken).
    pub fn new_all_clear(capacity: u32) -> Self {
        assert!(capacity > 0, "bitmap capacity must be nonzero");
        assert!((capacity as u64) <= (1 << 24), "bitmap capacity too large");
        let mut levels = Vec::new();
        let mut words = words_for(capacity as usize);
        levels.push(vec![0u64; words]);
        while words > 1 {
            words = words_for(words);
            levels.push(vec![0u64; words]);
        }
        Self { capacity, levels }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn check_range(&self, index: u32) {
        assert!(
            index < self.capacity,
            "bitmap index {} out of range (capacity {})",
            index,
            self.capacity
        );
    }

    /// Test whether `index` is set. Panics if out of range.
    pub fn test(&self, index: u32) -> bool {
        self.check_range(index);
        let i = index as usize;
        (self.levels[0][i / BITS] >> (i % BITS)) & 1 == 1
    }

    /// Set bit `index`, updating the summary levels.
    pub fn set(&mut self, index: u32) {
        self.check_range(index);
        let mut i = index as usize;
        for level in self.levels.iter_mut() {
            let word = i / BITS;
            let prior = level[word];
            level[word] = prior | (1 << (i % BITS));
            if prior != 0 {
                // Parent bit was already set.
                break;
            }
            i = word;
        }
    }

    /// Clear bit `index`, updating the summary levels. Panics if out of range.
    pub fn reset(&mut self, index: u32) {
        self.check_range(index);
        let mut i = index as usize;
        for level in self.levels.iter_mut() {
            let word = i / BITS;
            level[word] &= !(1 << (i % BITS));
            if level[word] != 0 {
                break;
            }
            i = word;
        }
    }

    /// Index of the first set bit, or [`INVALID_INDEX`] if none.
    pub fn find_first_set(&self) -> u32 {
        let top = self.levels.last().unwrap();
        if top[0] == 0 {
            return INVALID_INDEX;
        }
        let mut word = 0usize;
        for level in self.levels.iter().rev() {
            let bit = level[word].trailing_zeros() as usize;
            word = word * BITS + bit;
        }
        // The descent through summary words always lands on a set level-0 bit.
        word as u32
    }

    /// Find, clear, and return the first set bit, or [`INVALID_INDEX`].
    pub fn take_first_set(&mut self) -> u32 {
        let index = self.find_first_set();
        if index != INVALID_INDEX {
            self.reset(index);
        }
        index
    }

    /// Count of set bits.
    pub fn count(&self) -> u32 {
        self.levels[0].iter().map(|w| w.count_ones()).sum()
    }

    /// Verify that every summary bit equals the OR of its 64 children and
    /// that no bit beyond the capacity is set. Returns the first violation.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let tail_bits = self.capacity as usize % BITS;
        if tail_bits != 0 {
            let last = *self.levels[0].last().unwrap();
            if last & !((1u64 << tail_bits) - 1) != 0 {
                return Err(format!(
                    "level 0 has bits set beyond capacity {}",
                    self.capacity
                ));
            }
        }
        for upper in 1..self.levels.len() {
            let (lower_levels, upper_levels) = self.levels.split_at(upper);
            let lower = lower_levels.last().unwrap();
            let level = &upper_levels[0];
            for (word_idx, &word) in level.iter().enumerate() {
                for bit in 0..BITS {
                    let child = word_idx * BITS + bit;
                    let child_any = lower.get(child).is_some_and(|&w| w != 0);
                    let summary = (word >> bit) & 1 == 1;
                    if child_any != summary {
                        return Err(format!(
                            "level {} word {} bit {} is {} but child word is {}",
                            upper, word_idx, bit, summary, child_any
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reset_roundtrip() {
        let mut map = HierarchicalBitmap::new_all_clear(5000);
        assert_eq!(map.find_first_set(), INVALID_INDEX);
        map.set(4999);
        assert!(map.test(4999));
        assert_eq!(map.find_first_set(), 4999);
        map.set(64);
        assert_eq!(map.find_first_set(), 64);
        map.reset(64);
        assert_eq!(map.find_first_set(), 4999);
        assert_eq!(map.count(), 1);
        map.check_invariants().unwrap();
    }

    #[test]
    fn take_walks_in_order() {
        let mut map = HierarchicalBitmap::new_all_set(200);
        for expect in 0..200 {
            assert_eq!(map.take_first_set(), expect);
        }
        assert_eq!(map.take_first_set(), INVALID_INDEX);
        map.check_invariants().unwrap();
    }

    #[test]
    fn four_level_descent() {
        // Capacity past 64^3 forces all four levels into play.
        let mut map = HierarchicalBitmap::new_all_clear(300_000);
        map.set(262_144);
        map.set(299_999);
        assert_eq!(map.find_first_set(), 262_144);
        map.reset(262_144);
        assert_eq!(map.find_first_set(), 299_999);
        map.check_invariants().unwrap();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn bounds_rejects_capacity() {
        // Capacity of 50 isn't a multiple of 64: test(49) works, test(50) panics.
        let map = HierarchicalBitmap::new_all_set(50);
        assert!(map.test(49));
        let _ = map.test(50);
    }

    #[test]
    fn invariant_checker_detects_fault() {
        let mut map = HierarchicalBitmap::new_all_set(5000);
        map.check_invariants().unwrap();
        // Inject a fault below the summary levels.
        map.levels[0][3] = 0;
        assert!(map.check_invariants().is_err());
    }
}
