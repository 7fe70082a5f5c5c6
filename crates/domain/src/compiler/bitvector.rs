use ebpf_common::pipeline::{RULES_PER_WORD, bitvector_words};

const WORD_BITS: usize = RULES_PER_WORD as usize;

/// Set of rule ids, one bit per rule. Rule `r` lives in word `r / 63`,
/// bit `r % 63`; bit 63 of every word stays clear.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitVector {
    words: Vec<u64>,
}

impl BitVector {
    /// Empty vector sized for `max_rules`.
    pub fn new(max_rules: u32) -> Self {
        Self {
            words: vec![0; bitvector_words(max_rules)],
        }
    }

    /// Vector with rules `0..count` set.
    pub fn with_first(count: usize, max_rules: u32) -> Self {
        let mut bv = Self::new(max_rules);
        for rule in 0..count.min(bv.capacity()) {
            bv.set(rule);
        }
        bv
    }

    pub fn from_words(words: Vec<u64>) -> Self {
        Self { words }
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    /// Out-of-range ids are ignored.
    pub fn set(&mut self, rule: usize) {
        if let Some(word) = self.words.get_mut(rule / WORD_BITS) {
            *word |= 1 << (rule % WORD_BITS);
        }
    }

    pub fn get(&self, rule: usize) -> bool {
        self.words
            .get(rule / WORD_BITS)
            .is_some_and(|w| w & (1 << (rule % WORD_BITS)) != 0)
    }

    pub fn and_assign(&mut self, other: &BitVector) {
        for (i, word) in self.words.iter_mut().enumerate() {
            *word &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    pub fn or_assign(&mut self, other: &BitVector) {
        for (word, o) in self.words.iter_mut().zip(&other.words) {
            *word |= o;
        }
    }

    /// Lowest set rule id, as the bit-scan stage computes it.
    pub fn first_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * WORD_BITS + w.trailing_zeros() as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity()).filter(|r| self.get(*r))
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressing_skips_top_bit() {
        let mut bv = BitVector::new(200);
        bv.set(62);
        bv.set(63);
        assert_eq!(bv.words()[0], 1 << 62);
        assert_eq!(bv.words()[1], 1);
        assert!(bv.get(63));
        assert_eq!(bv.words()[0] >> 63, 0);
    }

    #[test]
    fn sized_for_max_rules() {
        assert_eq!(BitVector::new(8192).words().len(), 131);
        assert_eq!(BitVector::new(63).words().len(), 1);
    }

    #[test]
    fn first_set_crosses_words() {
        let mut bv = BitVector::new(200);
        assert_eq!(bv.first_set(), None);
        bv.set(130);
        bv.set(70);
        assert_eq!(bv.first_set(), Some(70));
    }

    #[test]
    fn and_narrows() {
        let mut a = BitVector::with_first(5, 64);
        let mut b = BitVector::new(64);
        b.set(3);
        b.set(9);
        a.and_assign(&b);
        assert_eq!(a.ones().collect::<Vec<_>>(), vec![3]);
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn out_of_range_set_is_ignored() {
        let mut bv = BitVector::new(10);
        bv.set(10_000);
        assert!(bv.is_empty());
    }
}
