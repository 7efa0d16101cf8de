//! Elias–Fano coding for monotone `u64` sequences.
//!
//! Posting lists of txNums are stored in frozen `.ef` files as one encoded
//! word per key. The split is the classic one: each value keeps its low
//! `l = floor(log2(universe / count))` bits verbatim in a packed array,
//! while the high bits are unary-coded in a bit vector (`count` ones among
//! `universe >> l` zeros). Decoding walks the bit vector; `search` finds
//! the smallest stored value `>= x`, which is what historical lookups need.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed posting list encoding")]
    Malformed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EliasFano {
    count: u64,
    universe: u64,
    l: u32,
    lows: Vec<u64>,
    highs: Vec<u64>,
}

fn low_bits(universe: u64, count: u64) -> u32 {
    let ratio = (universe / count).max(1);
    63 - ratio.leading_zeros()
}

fn words_for_bits(bits: u64) -> usize {
    bits.div_ceil(64) as usize
}

impl EliasFano {
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Largest stored value.
    pub fn max(&self) -> u64 {
        self.universe
    }

    /// Smallest stored value.
    pub fn min(&self) -> u64 {
        self.iter().next().unwrap_or(0)
    }

    pub fn get(&self, i: u64) -> Option<u64> {
        self.iter().nth(i as usize)
    }

    /// Smallest stored value `>= x`.
    pub fn search(&self, x: u64) -> Option<u64> {
        self.iter().find(|&v| v >= x)
    }

    pub fn iter(&self) -> EfIter<'_> {
        EfIter {
            ef: self,
            index: 0,
            bit: 0,
        }
    }

    /// Ascending values starting from the smallest value `>= x`.
    pub fn iter_from(&self, x: u64) -> EfIter<'_> {
        let mut it = self.iter();
        while let Some(v) = it.peek() {
            if v >= x {
                break;
            }
            it.next();
        }
        it
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(16 + 8 * (self.lows.len() + self.highs.len()));
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.universe.to_le_bytes());
        for w in self.lows.iter().chain(self.highs.iter()) {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 16 {
            return Err(Error::Malformed);
        }
        let count = u64::from_le_bytes(data[..8].try_into().expect("sized"));
        let universe = u64::from_le_bytes(data[8..16].try_into().expect("sized"));
        if count == 0 {
            return Err(Error::Malformed);
        }
        let l = low_bits(universe, count);
        let lows_words = words_for_bits(count * u64::from(l));
        let highs_words = words_for_bits(count + (universe >> l) + 1);
        let expected = 16 + 8 * (lows_words + highs_words);
        if data.len() != expected {
            return Err(Error::Malformed);
        }
        let mut words = data[16..]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("sized")));
        let lows = words.by_ref().take(lows_words).collect();
        let highs = words.collect();
        Ok(Self {
            count,
            universe,
            l,
            lows,
            highs,
        })
    }

    fn low(&self, i: u64) -> u64 {
        if self.l == 0 {
            return 0;
        }
        let l = u64::from(self.l);
        let bit = i * l;
        let word = (bit / 64) as usize;
        let shift = bit % 64;
        let mut v = self.lows[word] >> shift;
        if shift + l > 64 {
            v |= self.lows[word + 1] << (64 - shift);
        }
        v & ((1u64 << l) - 1)
    }
}

/// Ascending iterator over an [`EliasFano`] list.
pub struct EfIter<'a> {
    ef: &'a EliasFano,
    index: u64,
    bit: u64,
}

impl EfIter<'_> {
    fn value_at(&self, index: u64, one_pos: u64) -> u64 {
        let high = one_pos - index;
        (high << self.ef.l) | self.ef.low(index)
    }

    /// Next value without consuming it.
    pub fn peek(&self) -> Option<u64> {
        if self.index >= self.ef.count {
            return None;
        }
        let mut bit = self.bit;
        loop {
            let word = (bit / 64) as usize;
            let shift = bit % 64;
            let w = self.ef.highs.get(word)? >> shift;
            if w == 0 {
                bit = (bit / 64 + 1) * 64;
                continue;
            }
            bit += u64::from(w.trailing_zeros());
            return Some(self.value_at(self.index, bit));
        }
    }
}

impl Iterator for EfIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.index >= self.ef.count {
            return None;
        }
        loop {
            let word = (self.bit / 64) as usize;
            let shift = self.bit % 64;
            let w = self.ef.highs.get(word)? >> shift;
            if w == 0 {
                self.bit = (self.bit / 64 + 1) * 64;
                continue;
            }
            self.bit += u64::from(w.trailing_zeros());
            let v = self.value_at(self.index, self.bit);
            self.bit += 1;
            self.index += 1;
            return Some(v);
        }
    }
}

/// Builds an [`EliasFano`] from `count` non-decreasing values bounded by
/// `max`.
pub struct EliasFanoBuilder {
    count: u64,
    universe: u64,
    l: u32,
    lows: Vec<u64>,
    highs: Vec<u64>,
    pushed: u64,
    last: u64,
}

impl EliasFanoBuilder {
    pub fn new(count: u64, max: u64) -> Self {
        assert!(count > 0, "posting list must be non-empty");
        let l = low_bits(max, count);
        Self {
            count,
            universe: max,
            l,
            lows: vec![0; words_for_bits(count * u64::from(l))],
            highs: vec![0; words_for_bits(count + (max >> l) + 1)],
            pushed: 0,
            last: 0,
        }
    }

    pub fn push(&mut self, v: u64) {
        assert!(self.pushed < self.count, "more values than declared");
        assert!(v <= self.universe, "value exceeds declared maximum");
        assert!(self.pushed == 0 || v >= self.last, "values must be non-decreasing");
        self.last = v;

        if self.l > 0 {
            let l = u64::from(self.l);
            let low = v & ((1u64 << l) - 1);
            let bit = self.pushed * l;
            let word = (bit / 64) as usize;
            let shift = bit % 64;
            self.lows[word] |= low << shift;
            if shift + l > 64 {
                self.lows[word + 1] |= low >> (64 - shift);
            }
        }
        let one = (v >> self.l) + self.pushed;
        self.highs[(one / 64) as usize] |= 1u64 << (one % 64);
        self.pushed += 1;
    }

    pub fn finish(self) -> EliasFano {
        assert_eq!(self.pushed, self.count, "fewer values than declared");
        EliasFano {
            count: self.count,
            universe: self.universe,
            l: self.l,
            lows: self.lows,
            highs: self.highs,
        }
    }
}

/// Encode an already-sorted, deduplicated list.
pub fn encode(values: &[u64]) -> Vec<u8> {
    let max = *values.last().expect("posting list must be non-empty");
    let mut b = EliasFanoBuilder::new(values.len() as u64, max);
    for &v in values {
        b.push(v);
    }
    b.finish().to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn encode_decode_identity() {
        let values = vec![3u64, 17, 42, 1000, 1001, 65_536, 1 << 40];
        let bytes = encode(&values);
        let ef = EliasFano::from_bytes(&bytes).unwrap();
        assert_eq!(ef.count(), values.len() as u64);
        assert_eq!(ef.iter().collect::<Vec<_>>(), values);
        assert_eq!(ef.min(), 3);
        assert_eq!(ef.max(), 1 << 40);
    }

    #[test]
    fn search_finds_ceiling() {
        let values = vec![3u64, 17, 42];
        let ef = EliasFano::from_bytes(&encode(&values)).unwrap();
        assert_eq!(ef.search(0), Some(3));
        assert_eq!(ef.search(3), Some(3));
        assert_eq!(ef.search(4), Some(17));
        assert_eq!(ef.search(17), Some(17));
        assert_eq!(ef.search(18), Some(42));
        assert_eq!(ef.search(43), None);
    }

    #[test]
    fn iter_from_skips_prefix() {
        let values = vec![1u64, 5, 9, 13];
        let ef = EliasFano::from_bytes(&encode(&values)).unwrap();
        assert_eq!(ef.iter_from(6).collect::<Vec<_>>(), vec![9, 13]);
        assert_eq!(ef.iter_from(14).count(), 0);
    }

    #[test]
    fn dense_and_sparse_random_lists() {
        let mut rng = StdRng::seed_from_u64(7);
        for &(n, span) in &[(1usize, 10u64), (100, 128), (500, 1 << 30), (64, 64)] {
            let mut values: Vec<u64> = (0..n).map(|_| rng.gen_range(0..span)).collect();
            values.sort_unstable();
            values.dedup();
            let ef = EliasFano::from_bytes(&encode(&values)).unwrap();
            assert_eq!(ef.iter().collect::<Vec<_>>(), values);
            for _ in 0..50 {
                let x = rng.gen_range(0..span + 2);
                let expect = values.iter().copied().find(|&v| v >= x);
                assert_eq!(ef.search(x), expect, "search({x}) over {n} values");
            }
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(EliasFano::from_bytes(&[]).is_err());
        assert!(EliasFano::from_bytes(&[0u8; 16]).is_err());
        let mut bytes = encode(&[1, 2, 3]);
        bytes.truncate(bytes.len() - 1);
        assert!(EliasFano::from_bytes(&bytes).is_err());
    }
}
