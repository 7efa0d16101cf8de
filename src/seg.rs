//! Write-once segment files holding a stream of length-prefixed words.
//!
//! Segments are the payload format behind every frozen file the engine
//! produces: domain values (`.kv`), history values (`.v`) and posting
//! lists (`.ef`). A writer appends words and seals the file once; a reader
//! addresses words by the byte offset of their record, which is what the
//! file indices store.
//!
//! # Format
//!
//! ```text
//! +-------+-----+-------+----------+------------+
//! | magic | ver | flags | reserved | count(u64) |   16-byte header
//! +-------+-----+-------+----------+------------+
//! | tag | raw_len | [stored_len] | payload | C  |   per word
//! +-----+---------+--------------+---------+----+
//!
//! C = xxh3(payload) truncated to u32
//! ```
//!
//! `tag` bit 0 marks a zstd-compressed payload; `stored_len` is present
//! only then. Lengths are LEB128 varints. Words the compressor cannot
//! shrink are stored raw, so identical inputs always produce identical
//! bytes.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Seek, SeekFrom, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

const MAGIC: &[u8; 4] = b"SEG1";
const VERSION: u8 = 1;
const HEADER_LEN: u64 = 16;
const TAG_COMPRESSED: u8 = 0b0000_0001;

/// Words shorter than this are never handed to the compressor.
const MIN_COMPRESS_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt segment {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(b);
            return;
        }
        buf.push(b | 0x80);
    }
}

fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    let mut shift = 0u32;
    for (i, b) in buf.iter().enumerate() {
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some((v, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

/// Appends words to a new segment file. `finish` seals it; `abort` removes
/// the partial output (the cancellation path).
pub struct SegWriter {
    path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    count: u64,
    compression: Option<i32>,
}

impl SegWriter {
    pub fn create(path: impl AsRef<Path>, compression: Option<i32>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&path)?,
        );
        // Header is rewritten with the final count on finish.
        file.write_all(&[0u8; HEADER_LEN as usize])?;
        Ok(Self {
            path,
            file,
            offset: HEADER_LEN,
            count: 0,
            compression,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Byte offset the next word will be written at.
    pub fn next_offset(&self) -> u64 {
        self.offset
    }

    /// Append a word, compressing it when a level is configured and the
    /// compressed form is actually smaller.
    pub fn add_word(&mut self, word: &[u8]) -> Result<(), Error> {
        if let Some(level) = self.compression {
            if word.len() >= MIN_COMPRESS_LEN {
                let stored = zstd::bulk::compress(word, level)?;
                if stored.len() < word.len() {
                    return self.write_record(TAG_COMPRESSED, word.len() as u64, &stored);
                }
            }
        }
        self.write_record(0, word.len() as u64, word)
    }

    /// Append a word verbatim, bypassing compression (keys are stored this
    /// way so index probes compare raw bytes).
    pub fn add_uncompressed_word(&mut self, word: &[u8]) -> Result<(), Error> {
        self.write_record(0, word.len() as u64, word)
    }

    fn write_record(&mut self, tag: u8, raw_len: u64, stored: &[u8]) -> Result<(), Error> {
        let mut head = Vec::with_capacity(24);
        head.push(tag);
        write_varint(&mut head, raw_len);
        if tag & TAG_COMPRESSED != 0 {
            write_varint(&mut head, stored.len() as u64);
        }
        self.file.write_all(&head)?;
        self.file.write_all(stored)?;
        let checksum = (xxh3_64(stored) as u32).to_le_bytes();
        self.file.write_all(&checksum)?;
        self.offset += head.len() as u64 + stored.len() as u64 + 4;
        self.count += 1;
        Ok(())
    }

    /// Seal the file: write the header and sync to disk.
    pub fn finish(mut self) -> Result<(), Error> {
        self.file.flush()?;
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.push(VERSION);
        header.push(u8::from(self.compression.is_some()));
        header.extend_from_slice(&[0u8; 2]);
        header.extend_from_slice(&self.count.to_le_bytes());
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_all()?;
        Ok(())
    }

    /// Drop the partial output.
    pub fn abort(self) {
        let path = self.path.clone();
        drop(self.file);
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::trace!(?path, %err, "failed to remove aborted segment");
        }
    }
}

/// Read side of a sealed segment. Cheap to share: every reader context
/// derives its own [`Getter`] with an independent position.
#[derive(Debug)]
pub struct SegReader {
    path: PathBuf,
    file: File,
    len: u64,
    count: u64,
}

impl SegReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let corrupt = |reason: &str| Error::Corrupt {
            path: path.clone(),
            reason: reason.to_string(),
        };
        if len < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact_at(&mut header, 0)?;
        if &header[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        if header[4] != VERSION {
            return Err(corrupt("unsupported version"));
        }
        let count = u64::from_le_bytes(header[8..16].try_into().expect("sized slice"));
        Ok(Self {
            path,
            file,
            len,
            count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn getter(&self) -> Getter<'_> {
        Getter {
            seg: self,
            pos: HEADER_LEN,
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> Error {
        Error::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

/// Positioned word reader over a [`SegReader`].
pub struct Getter<'a> {
    seg: &'a SegReader,
    pos: u64,
}

impl Getter<'_> {
    pub fn reset(&mut self, offset: u64) {
        self.pos = HEADER_LEN.max(offset);
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.seg.len
    }

    /// Offset of the word the next `next_word` call will return; this is
    /// the value file indices store.
    pub fn word_offset(&self) -> u64 {
        self.pos
    }

    fn read_head(&self) -> Result<(u8, u64, u64, u64), Error> {
        // tag + two max-size varints
        let mut buf = [0u8; 21];
        let n = self.seg.file.read_at(&mut buf, self.pos)?;
        let buf = &buf[..n];
        if buf.is_empty() {
            return Err(self.seg.corrupt("word header past end of file"));
        }
        let tag = buf[0];
        let mut used = 1usize;
        let (raw_len, n) = read_varint(&buf[used..])
            .ok_or_else(|| self.seg.corrupt("bad word length"))?;
        used += n;
        let stored_len = if tag & TAG_COMPRESSED != 0 {
            let (sl, n) = read_varint(&buf[used..])
                .ok_or_else(|| self.seg.corrupt("bad stored length"))?;
            used += n;
            sl
        } else {
            raw_len
        };
        Ok((tag, raw_len, stored_len, used as u64))
    }

    /// Read the next word and advance past it.
    pub fn next_word(&mut self) -> Result<Vec<u8>, Error> {
        let (tag, raw_len, stored_len, head_len) = self.read_head()?;
        let payload_at = self.pos + head_len;
        let mut stored = vec![0u8; stored_len as usize];
        self.seg.file.read_exact_at(&mut stored, payload_at)?;
        let mut checksum = [0u8; 4];
        self.seg
            .file
            .read_exact_at(&mut checksum, payload_at + stored_len)?;
        if (xxh3_64(&stored) as u32).to_le_bytes() != checksum {
            return Err(self.seg.corrupt(format!(
                "checksum mismatch at offset {}",
                self.pos
            )));
        }
        self.pos = payload_at + stored_len + 4;
        if tag & TAG_COMPRESSED != 0 {
            let raw = zstd::bulk::decompress(&stored, raw_len as usize)?;
            if raw.len() as u64 != raw_len {
                return Err(self.seg.corrupt("decompressed length mismatch"));
            }
            Ok(raw)
        } else {
            Ok(stored)
        }
    }

    /// Advance past the next word without reading its payload.
    pub fn skip_word(&mut self) -> Result<(), Error> {
        let (_, _, stored_len, head_len) = self.read_head()?;
        self.pos += head_len + stored_len + 4;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write as _};

    fn roundtrip(compression: Option<i32>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.seg");

        let words: Vec<Vec<u8>> = vec![
            b"alpha".to_vec(),
            Vec::new(),
            vec![0xAB; 500],
            b"omega".to_vec(),
        ];
        let mut w = SegWriter::create(&path, compression).unwrap();
        for word in &words {
            w.add_word(word).unwrap();
        }
        assert_eq!(w.count(), 4);
        w.finish().unwrap();

        let r = SegReader::open(&path).unwrap();
        assert_eq!(r.count(), 4);
        let mut g = r.getter();
        let mut offsets = Vec::new();
        let mut read = Vec::new();
        while g.has_next() {
            offsets.push(g.word_offset());
            read.push(g.next_word().unwrap());
        }
        assert_eq!(read, words);

        // Random access by stored offset.
        let mut g = r.getter();
        g.reset(offsets[2]);
        assert_eq!(g.next_word().unwrap(), words[2]);
    }

    #[test]
    fn roundtrip_uncompressed() {
        roundtrip(None);
    }

    #[test]
    fn roundtrip_compressed() {
        roundtrip(Some(3));
    }

    #[test]
    fn identical_inputs_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = Vec::new();
        for name in ["a.seg", "b.seg"] {
            let path = dir.path().join(name);
            let mut w = SegWriter::create(&path, Some(3)).unwrap();
            for i in 0..100u64 {
                w.add_word(&i.to_be_bytes().repeat(12)).unwrap();
            }
            w.finish().unwrap();
            let mut buf = Vec::new();
            File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
            bytes.push(buf);
        }
        assert_eq!(bytes[0], bytes[1]);
    }

    #[test]
    fn detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.seg");
        let mut w = SegWriter::create(&path, None).unwrap();
        w.add_word(b"payload-bytes").unwrap();
        w.finish().unwrap();

        // Flip a payload byte.
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(HEADER_LEN + 3)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        drop(f);

        let r = SegReader::open(&path).unwrap();
        let mut g = r.getter();
        assert!(matches!(g.next_word(), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn skip_word_advances_like_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.seg");
        let mut w = SegWriter::create(&path, None).unwrap();
        w.add_word(b"one").unwrap();
        w.add_word(b"two").unwrap();
        w.finish().unwrap();

        let r = SegReader::open(&path).unwrap();
        let mut g = r.getter();
        g.skip_word().unwrap();
        assert_eq!(g.next_word().unwrap(), b"two");
        assert!(!g.has_next());
    }
}
