//! Static B-tree over the sorted keys of a value segment.
//!
//! A `.kv` segment stores alternating key and value words in key order.
//! The `.bt` file stores every key's record offset (the leaf layer, raw
//! offsets per the file contract) plus one inline key per `arity` keys
//! (the node layer). A seek bisects the node layer without touching the
//! segment, then bisects the narrowed leaf range reading at most
//! `log2(arity)` key words.
//!
//! # Format
//!
//! ```text
//! +-------+-----+-----+------------+------------+
//! | magic | ver | pad | arity(u64) | keys(u64)  |   24-byte header
//! +-------+-----+-----+------------+------------+
//! | offset(u64) * keys                          |   leaf layer
//! | nodes(u64) | { index(u64), klen(u32), key } |   node layer
//! +---------------------------------------------+
//! ```

use super::Error;
use crate::seg::SegReader;
use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

const MAGIC: &[u8; 4] = b"BTI1";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 24;

/// Keys per node, fixed by the file contract.
pub const DEFAULT_ARITY: u64 = 2048;

/// Build a `.bt` file over a sealed key-value segment.
pub fn build(seg: &SegReader, path: impl AsRef<Path>, arity: u64) -> Result<(), Error> {
    let path = path.as_ref();
    let mut offsets = Vec::with_capacity((seg.count() / 2) as usize);
    let mut nodes: Vec<(u64, Vec<u8>)> = Vec::new();

    let mut getter = seg.getter();
    let mut i = 0u64;
    while getter.has_next() {
        let offset = getter.word_offset();
        let key = getter.next_word()?;
        getter.skip_word()?;
        if i % arity == 0 {
            nodes.push((i, key));
        }
        offsets.push(offset);
        i += 1;
    }

    let mut file = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?,
    );
    file.write_all(MAGIC)?;
    file.write_all(&[VERSION, 0, 0, 0])?;
    file.write_all(&arity.to_le_bytes())?;
    file.write_all(&(offsets.len() as u64).to_le_bytes())?;
    for o in &offsets {
        file.write_all(&o.to_le_bytes())?;
    }
    file.write_all(&(nodes.len() as u64).to_le_bytes())?;
    for (index, key) in &nodes {
        file.write_all(&index.to_le_bytes())?;
        file.write_all(&(key.len() as u32).to_le_bytes())?;
        file.write_all(key)?;
    }
    file.flush()?;
    file.get_mut().sync_all()?;
    Ok(())
}

/// Read side of a `.bt` file, bound to the segment it indexes.
#[derive(Debug)]
pub struct BtIndex {
    path: PathBuf,
    seg: Arc<SegReader>,
    offsets: Vec<u64>,
    nodes: Vec<(u64, Vec<u8>)>,
}

impl BtIndex {
    pub fn open(path: impl AsRef<Path>, seg: Arc<SegReader>) -> Result<Self, Error> {
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
        let key_count = u64::from_le_bytes(header[16..24].try_into().expect("sized"));
        if key_count != seg.count() / 2 {
            return Err(corrupt("key count does not match segment"));
        }

        let mut body = vec![0u8; (file.metadata()?.len() as usize).saturating_sub(HEADER_LEN)];
        file.read_exact_at(&mut body, HEADER_LEN as u64)?;
        let mut reader = BodyReader {
            body: &body,
            at: 0,
        };

        let mut offsets = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            offsets.push(reader.u64(&path)?);
        }
        let node_count = reader.u64(&path)?;
        let mut nodes = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            let index = reader.u64(&path)?;
            let klen = reader.u32(&path)? as usize;
            nodes.push((index, reader.take(klen, &path)?.to_vec()));
        }

        Ok(Self {
            path,
            seg,
            offsets,
            nodes,
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

    fn key_at(&self, i: u64) -> Result<Vec<u8>, Error> {
        let mut g = self.seg.getter();
        g.reset(self.offsets[i as usize]);
        Ok(g.next_word()?)
    }

    fn pair_at(&self, i: u64) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let mut g = self.seg.getter();
        g.reset(self.offsets[i as usize]);
        let key = g.next_word()?;
        let value = g.next_word()?;
        Ok((key, value))
    }

    /// Position at the smallest key `>= target`, or `None` past the end.
    pub fn seek(&self, target: &[u8]) -> Result<Option<BtCursor<'_>>, Error> {
        if self.offsets.is_empty() {
            return Ok(None);
        }
        // Node layer: the partition point gives the first node key >= target;
        // the answer lies in the block starting at the previous node.
        let block = self.nodes.partition_point(|(_, k)| k.as_slice() < target);
        let mut lo = if block == 0 {
            0
        } else {
            self.nodes[block - 1].0
        };
        let mut hi = self
            .nodes
            .get(block)
            .map_or(self.key_count(), |(index, _)| *index);

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid)?.as_slice() < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == self.key_count() {
            return Ok(None);
        }
        let (key, value) = self.pair_at(lo)?;
        Ok(Some(BtCursor {
            bt: self,
            index: lo,
            key,
            value,
        }))
    }

    /// Exact-match lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match self.seek(key)? {
            Some(cur) if cur.key() == key => Ok(Some(cur.value)),
            _ => Ok(None),
        }
    }
}

struct BodyReader<'a> {
    body: &'a [u8],
    at: usize,
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize, path: &Path) -> Result<&'a [u8], Error> {
        let s = self
            .body
            .get(self.at..self.at + n)
            .ok_or_else(|| Error::Corrupt {
                path: path.to_path_buf(),
                reason: "truncated body".to_string(),
            })?;
        self.at += n;
        Ok(s)
    }

    fn u64(&mut self, path: &Path) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(
            self.take(8, path)?.try_into().expect("sized"),
        ))
    }

    fn u32(&mut self, path: &Path) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(
            self.take(4, path)?.try_into().expect("sized"),
        ))
    }
}

/// Forward cursor over the indexed segment.
pub struct BtCursor<'a> {
    bt: &'a BtIndex,
    index: u64,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl BtCursor<'_> {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    /// Advance to the next key. Returns `false` at the end.
    pub fn next(&mut self) -> Result<bool, Error> {
        self.index += 1;
        if self.index >= self.bt.key_count() {
            return Ok(false);
        }
        let (key, value) = self.bt.pair_at(self.index)?;
        self.key = key;
        self.value = value;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seg::SegWriter;

    fn build_fixture(keys: &[&[u8]]) -> (tempfile::TempDir, BtIndex) {
        let dir = tempfile::tempdir().unwrap();
        let seg_path = dir.path().join("data.kv");
        let mut w = SegWriter::create(&seg_path, None).unwrap();
        for key in keys {
            w.add_uncompressed_word(key).unwrap();
            let mut value = b"v:".to_vec();
            value.extend_from_slice(key);
            w.add_word(&value).unwrap();
        }
        w.finish().unwrap();

        let seg = Arc::new(SegReader::open(&seg_path).unwrap());
        let bt_path = dir.path().join("data.bt");
        build(&seg, &bt_path, 4).unwrap();
        let bt = BtIndex::open(&bt_path, seg).unwrap();
        (dir, bt)
    }

    #[test]
    fn seek_and_scan() {
        let keys: Vec<Vec<u8>> = (0..100u32)
            .map(|i| format!("key{i:04}").into_bytes())
            .collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let (_dir, bt) = build_fixture(&refs);
        assert_eq!(bt.key_count(), 100);

        let cur = bt.seek(b"key0042").unwrap().unwrap();
        assert_eq!(cur.key(), b"key0042");
        assert_eq!(cur.value(), b"v:key0042");

        // Between keys lands on the next one.
        let mut cur = bt.seek(b"key0042a").unwrap().unwrap();
        assert_eq!(cur.key(), b"key0043");
        assert!(cur.next().unwrap());
        assert_eq!(cur.key(), b"key0044");

        // Prefix seek hits the first match.
        let cur = bt.seek(b"key").unwrap().unwrap();
        assert_eq!(cur.key(), b"key0000");

        assert!(bt.seek(b"zzz").unwrap().is_none());
        assert_eq!(bt.get(b"key0099").unwrap().unwrap(), b"v:key0099");
        assert_eq!(bt.get(b"missing").unwrap(), None);
    }

    #[test]
    fn empty_segment() {
        let (_dir, bt) = build_fixture(&[]);
        assert!(bt.is_empty());
        assert!(bt.seek(b"").unwrap().is_none());
    }

    #[test]
    fn cursor_walks_to_end() {
        let (_dir, bt) = build_fixture(&[b"a", b"b", b"c"]);
        let mut cur = bt.seek(b"a").unwrap().unwrap();
        let mut seen = vec![cur.key().to_vec()];
        while cur.next().unwrap() {
            seen.push(cur.key().to_vec());
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
