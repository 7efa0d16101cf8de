//! RAM-budgeted write-ahead collectors.
//!
//! History and inverted-index writes are buffered per table and only
//! loaded into the KV store when the aggregator flushes a step. A
//! collector keeps its entries sorted-on-load; once the in-memory buffer
//! exceeds its budget it spills a sorted run to the tmp directory and the
//! load phase merges the runs back in key order.
//!
//! The per-collector budget comes from `ERIGON_WAL_COLLETOR_RAM` (a
//! byte-size string such as `256MB`), defaulting to an eighth of twice the
//! optimal ETL buffer size. A `Discard` collector drops everything; tests
//! and history-free modes use it.

use crate::kv::{self, RwTx};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::OnceLock,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kv error: {0}")]
    Kv(#[from] kv::Error),
    #[error("corrupt spill run {0}")]
    CorruptRun(PathBuf),
}

pub const DEFAULT_ETL_BUFFER_SIZE: u64 = 256 << 20;

/// Parse a byte-size string: a plain number or a number with a KB/MB/GB
/// (or KiB/MiB/GiB) suffix.
pub fn parse_byte_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    if split == 0 {
        return None;
    }
    let (num, suffix) = s.split_at(split);
    let num: u64 = num.parse().ok()?;
    let mult = match suffix.trim().to_ascii_uppercase().as_str() {
        "B" => 1,
        "KB" | "KIB" => 1 << 10,
        "MB" | "MIB" => 1 << 20,
        "GB" | "GIB" => 1 << 30,
        _ => return None,
    };
    Some(num * mult)
}

/// Per-collector RAM budget, read once from the environment.
pub fn collector_ram() -> u64 {
    static BUDGET: OnceLock<u64> = OnceLock::new();
    *BUDGET.get_or_init(|| {
        let default = 2 * DEFAULT_ETL_BUFFER_SIZE / 8;
        match std::env::var("ERIGON_WAL_COLLETOR_RAM") {
            Ok(v) => match parse_byte_size(&v).or_else(|| v.trim().parse().ok()) {
                Some(n) => n,
                None => {
                    debug!(value = %v, "unparseable collector RAM budget, using default");
                    default
                }
            },
            Err(_) => default,
        }
    })
}

/// Mode of a write-ahead collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Buffer in RAM (spilling beyond budget) until `load`.
    Buffered,
    /// Drop all writes.
    Discard,
}

/// Sorted buffer of `(key, value)` pairs destined for one table.
pub struct Collector {
    table: String,
    tmpdir: PathBuf,
    mode: Mode,
    budget: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    buffered_bytes: u64,
    runs: Vec<PathBuf>,
    run_seq: u64,
}

impl Collector {
    pub fn new(table: impl Into<String>, tmpdir: impl AsRef<Path>, mode: Mode) -> Self {
        Self {
            table: table.into(),
            tmpdir: tmpdir.as_ref().to_path_buf(),
            mode,
            budget: collector_ram(),
            entries: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
            run_seq: 0,
        }
    }

    #[cfg(test)]
    fn with_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }

    pub fn is_discarding(&self) -> bool {
        self.mode == Mode::Discard
    }

    pub fn collect(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if self.mode == Mode::Discard {
            return Ok(());
        }
        self.buffered_bytes += (key.len() + value.len() + 16) as u64;
        self.entries.push((key.to_vec(), value.to_vec()));
        if self.buffered_bytes > self.budget {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<(), Error> {
        if self.entries.is_empty() {
            return Ok(());
        }
        self.entries.sort();
        let path = self.tmpdir.join(format!(
            "wal-{}-{}.run",
            self.table.replace('/', "_"),
            self.run_seq
        ));
        self.run_seq += 1;
        let mut file = BufWriter::new(File::create(&path)?);
        for (k, v) in self.entries.drain(..) {
            write_entry(&mut file, &k, &v)?;
        }
        file.flush()?;
        debug!(table = %self.table, run = %path.display(), "spilled collector run");
        self.runs.push(path);
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Load everything collected into `table` in ascending key order and
    /// reset the collector.
    pub fn load(&mut self, tx: &dyn RwTx) -> Result<(), Error> {
        if self.mode == Mode::Discard {
            return Ok(());
        }
        self.entries.sort();
        let mut sources: Vec<RunReader> = Vec::with_capacity(self.runs.len() + 1);
        for path in self.runs.drain(..) {
            sources.push(RunReader::open(path)?);
        }
        let mut mem = std::mem::take(&mut self.entries).into_iter().peekable();
        self.buffered_bytes = 0;

        // K-way merge of the sorted runs plus the in-memory tail.
        loop {
            let mut best_idx: Option<usize> = None;
            for i in 0..sources.len() {
                if sources[i].head().is_none() {
                    continue;
                }
                best_idx = match best_idx {
                    Some(b) if sources[b].head() <= sources[i].head() => Some(b),
                    _ => Some(i),
                };
            }
            let take_mem = match (best_idx, mem.peek()) {
                (None, None) => break,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some(b), Some(m)) => Some(m) < sources[b].head(),
            };
            let (k, v) = if take_mem {
                mem.next().expect("peeked")
            } else {
                sources[best_idx.expect("chosen source")].pop()?.expect("had head")
            };
            tx.put(&self.table, &k, &v)?;
        }
        for src in sources {
            src.remove();
        }
        Ok(())
    }

    /// Drop buffered state and spill runs without loading.
    pub fn close(&mut self) {
        self.entries.clear();
        self.buffered_bytes = 0;
        for path in self.runs.drain(..) {
            if let Err(err) = std::fs::remove_file(&path) {
                debug!(run = %path.display(), %err, "failed to remove collector run");
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_entry(w: &mut impl Write, key: &[u8], value: &[u8]) -> std::io::Result<()> {
    w.write_all(&(key.len() as u32).to_le_bytes())?;
    w.write_all(&(value.len() as u32).to_le_bytes())?;
    w.write_all(key)?;
    w.write_all(value)
}

struct RunReader {
    path: PathBuf,
    file: BufReader<File>,
    head: Option<(Vec<u8>, Vec<u8>)>,
}

impl RunReader {
    fn open(path: PathBuf) -> Result<Self, Error> {
        let file = BufReader::new(File::open(&path)?);
        let mut r = Self {
            path,
            file,
            head: None,
        };
        r.advance()?;
        Ok(r)
    }

    fn head(&self) -> Option<&(Vec<u8>, Vec<u8>)> {
        self.head.as_ref()
    }

    fn pop(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        let head = self.head.take();
        self.advance()?;
        Ok(head)
    }

    fn advance(&mut self) -> Result<(), Error> {
        let mut lens = [0u8; 8];
        match self.file.read_exact(&mut lens) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.head = None;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let klen = u32::from_le_bytes(lens[..4].try_into().expect("sized")) as usize;
        let vlen = u32::from_le_bytes(lens[4..].try_into().expect("sized")) as usize;
        let mut key = vec![0u8; klen];
        let mut value = vec![0u8; vlen];
        self.file
            .read_exact(&mut key)
            .and_then(|_| self.file.read_exact(&mut value))
            .map_err(|_| Error::CorruptRun(self.path.clone()))?;
        self.head = Some((key, value));
        Ok(())
    }

    fn remove(self) {
        let path = self.path.clone();
        drop(self.file);
        if let Err(err) = std::fs::remove_file(&path) {
            debug!(run = %path.display(), %err, "failed to remove collector run");
        }
    }
}
