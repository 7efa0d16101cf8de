//! Minimal perfect hash index from key to segment offset.
//!
//! Built with bucket displacement: keys are grouped into buckets by a
//! salted xxh3, buckets are placed largest-first by probing displacement
//! values until every key lands in a free slot. A bucket that cannot be
//! placed restarts the whole build with a fresh random salt; exhausting
//! the retry budget is an error (it does not happen on real key sets).
//!
//! Lookups are total: probing an absent key returns *some* offset, so
//! callers compare the key word found at that offset before trusting it.
//!
//! # Format
//!
//! ```text
//! +-------+-----+-----+--------+--------------+------+
//! | magic | ver | pad | n(u64) | buckets(u64) | salt |   32-byte header
//! +-------+-----+-----+--------+--------------+------+
//! | displacement(u32) * buckets | offset(u64) * n    |
//! +--------------------------------------------------+
//! ```

use super::Error;
use rand::Rng;
use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64_with_seed;

const MAGIC: &[u8; 4] = b"MPH1";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 32;

const MAX_SALT_ATTEMPTS: usize = 64;
const MAX_DISPLACEMENT: u32 = 1 << 16;
const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

fn bucket_of(key: &[u8], salt: u64, buckets: u64) -> u64 {
    xxh3_64_with_seed(key, salt) % buckets
}

fn slot_of(key: &[u8], salt: u64, displacement: u32, slots: u64) -> u64 {
    let seed = salt ^ u64::from(displacement + 1).wrapping_mul(GOLDEN);
    xxh3_64_with_seed(key, seed) % slots
}

/// Collects `(key, offset)` pairs and writes the index file.
pub struct HashIndexBuilder {
    path: PathBuf,
    keys: Vec<(Vec<u8>, u64)>,
}

impl HashIndexBuilder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            keys: Vec::new(),
        }
    }

    pub fn add_key(&mut self, key: &[u8], offset: u64) {
        self.keys.push((key.to_vec(), offset));
    }

    /// Add the concatenation `a || b` (used for per-txNum value indices).
    pub fn add_key2(&mut self, a: &[u8], b: &[u8], offset: u64) {
        let mut key = Vec::with_capacity(a.len() + b.len());
        key.extend_from_slice(a);
        key.extend_from_slice(b);
        self.keys.push((key, offset));
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn build(self) -> Result<HashIndex, Error> {
        let n = self.keys.len() as u64;
        if n == 0 {
            write_file(&self.path, 0, 0, 0, &[], &[])?;
            return HashIndex::open(&self.path);
        }
        let buckets = n.div_ceil(4).max(1);

        let mut rng = rand::thread_rng();
        let mut salt = GOLDEN;
        for attempt in 0..MAX_SALT_ATTEMPTS {
            match try_place(&self.keys, salt, buckets) {
                Some((displacements, offsets)) => {
                    write_file(&self.path, n, buckets, salt, &displacements, &offsets)?;
                    return HashIndex::open(&self.path);
                }
                None => {
                    debug!(
                        path = %self.path.display(),
                        attempt,
                        "perfect hash collision, retrying with fresh salt"
                    );
                    salt = rng.gen();
                }
            }
        }
        Err(Error::SaltRetriesExhausted)
    }
}

fn try_place(keys: &[(Vec<u8>, u64)], salt: u64, buckets: u64) -> Option<(Vec<u32>, Vec<u64>)> {
    let n = keys.len() as u64;
    let mut by_bucket: Vec<Vec<usize>> = vec![Vec::new(); buckets as usize];
    for (i, (key, _)) in keys.iter().enumerate() {
        by_bucket[bucket_of(key, salt, buckets) as usize].push(i);
    }

    let mut order: Vec<usize> = (0..buckets as usize).collect();
    order.sort_by_key(|&b| std::cmp::Reverse(by_bucket[b].len()));

    let mut displacements = vec![0u32; buckets as usize];
    let mut slots: Vec<Option<u64>> = vec![None; keys.len()];
    let mut scratch = Vec::new();
    'bucket: for &b in &order {
        let members = &by_bucket[b];
        if members.is_empty() {
            continue;
        }
        'displacement: for d in 0..MAX_DISPLACEMENT {
            scratch.clear();
            for &i in members {
                let s = slot_of(&keys[i].0, salt, d, n);
                if slots[s as usize].is_some() || scratch.contains(&s) {
                    continue 'displacement;
                }
                scratch.push(s);
            }
            for (&i, &s) in members.iter().zip(scratch.iter()) {
                slots[s as usize] = Some(keys[i].1);
            }
            displacements[b] = d;
            continue 'bucket;
        }
        return None;
    }

    let offsets = slots
        .into_iter()
        .map(|s| s.expect("every slot filled by a placed bucket"))
        .collect();
    Some((displacements, offsets))
}

fn write_file(
    path: &Path,
    n: u64,
    buckets: u64,
    salt: u64,
    displacements: &[u32],
    offsets: &[u64],
) -> Result<(), Error> {
    let mut file = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?,
    );
    file.write_all(MAGIC)?;
    file.write_all(&[VERSION, 0, 0, 0])?;
    file.write_all(&n.to_le_bytes())?;
    file.write_all(&buckets.to_le_bytes())?;
    file.write_all(&salt.to_le_bytes())?;
    for d in displacements {
        file.write_all(&d.to_le_bytes())?;
    }
    for o in offsets {
        file.write_all(&o.to_le_bytes())?;
    }
    file.flush()?;
    file.get_mut().sync_all()?;
    Ok(())
}

/// Read side of the index; the arrays are small and held in memory.
#[derive(Debug)]
pub struct HashIndex {
    path: PathBuf,
    salt: u64,
    buckets: u64,
    displacements: Vec<u32>,
    offsets: Vec<u64>,
}

impl HashIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let corrupt = |reason: &str| Error::Corrupt {
            path: path.clone(),
            reason: reason.to_string(),
        };

        let mut header = [0u8; HEADER_LEN];
        file.read_exact_at(&mut header, 0)?;
        if &header[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        if header[4] != VERSION {
            return Err(corrupt("unsupported version"));
        }
        let n = u64::from_le_bytes(header[8..16].try_into().expect("sized"));
        let buckets = u64::from_le_bytes(header[16..24].try_into().expect("sized"));
        let salt = u64::from_le_bytes(header[24..32].try_into().expect("sized"));

        let body_len = 4 * buckets as usize + 8 * n as usize;
        let mut body = vec![0u8; body_len];
        file.read_exact_at(&mut body, HEADER_LEN as u64)?;
        let (d_bytes, o_bytes) = body.split_at(4 * buckets as usize);
        let displacements = d_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().expect("sized")))
            .collect();
        let offsets = o_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("sized")))
            .collect();
        Ok(Self {
            path,
            salt,
            buckets,
            displacements,
            offsets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Offset of `key`'s record. Absent keys map to an arbitrary stored
    /// offset; the caller verifies the key word found there.
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        if self.offsets.is_empty() {
            return None;
        }
        let b = bucket_of(key, self.salt, self.buckets);
        let d = self.displacements[b as usize];
        let s = slot_of(key, self.salt, d, self.offsets.len() as u64);
        Some(self.offsets[s as usize])
    }

    /// Offset for the concatenation `a || b`.
    pub fn lookup2(&self, a: &[u8], b: &[u8]) -> Option<u64> {
        let mut key = Vec::with_capacity(a.len() + b.len());
        key.extend_from_slice(a);
        key.extend_from_slice(b);
        self.lookup(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashMap;

    #[test]
    fn perfect_over_random_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.mph");
        let mut rng = StdRng::seed_from_u64(11);

        let mut expected = HashMap::new();
        let mut builder = HashIndexBuilder::new(&path);
        while expected.len() < 5_000 {
            let mut key = [0u8; 32];
            rng.fill(&mut key);
            let offset = expected.len() as u64 * 16;
            if expected.insert(key.to_vec(), offset).is_none() {
                builder.add_key(&key, offset);
            }
        }
        let index = builder.build().unwrap();
        assert_eq!(index.key_count(), 5_000);

        for (key, offset) in &expected {
            assert_eq!(index.lookup(key), Some(*offset));
        }

        // Reopen from disk and probe again.
        let index = HashIndex::open(&path).unwrap();
        for (key, offset) in expected.iter().take(100) {
            assert_eq!(index.lookup(key), Some(*offset));
        }
    }

    #[test]
    fn empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mph");
        let index = HashIndexBuilder::new(&path).build().unwrap();
        assert!(index.is_empty());
        assert_eq!(index.lookup(b"anything"), None);
    }

    #[test]
    fn lookup2_matches_concatenation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.mph");
        let mut builder = HashIndexBuilder::new(&path);
        builder.add_key2(&7u64.to_be_bytes(), b"addr", 99);
        builder.add_key(b"other", 7);
        let index = builder.build().unwrap();

        let mut concat = 7u64.to_be_bytes().to_vec();
        concat.extend_from_slice(b"addr");
        assert_eq!(index.lookup(&concat), Some(99));
        assert_eq!(index.lookup2(&7u64.to_be_bytes(), b"addr"), Some(99));
    }
}
