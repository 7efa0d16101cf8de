//! Per-key streams of previous values, stamped by the txNum that
//! overwrote them.
//!
//! History is layered on an inverted index over its events: the index
//! answers "when did this key change at or after txNum", and the value
//! stream answers "what was the value just before that change". Recent
//! events live in two KV tables (`history_keys`: txNum -> key, and the
//! shared per-key `idx` postings) plus a `history_vals` table keyed
//! `key || txNumBE`. Frozen ranges become a `.v` value segment with a
//! `.vi` index keyed `txNumBE || key`, alongside the index's `.ef`/`.efi`
//! pair.

use crate::{
    eliasfano::EliasFano,
    files::{self, CtxFile, FileItem, FileRegistry, FileSpec},
    index::{self, hash::HashIndexBuilder},
    inverted_index::{self, IndexContext, IndexWal, InvertedIndex},
    kv::{self, DomainTables, IndexTables, RwTx, Tx},
    seg::{SegReader, SegWriter},
    wal, CancelToken,
};
use std::{
    collections::{BTreeMap, BinaryHeap},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info};

const CANCEL_POLL: usize = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kv error: {0}")]
    Kv(#[from] kv::Error),
    #[error("segment error: {0}")]
    Seg(#[from] crate::seg::Error),
    #[error("index error: {0}")]
    Idx(#[from] index::Error),
    #[error("file error: {0}")]
    Files(#[from] files::Error),
    #[error("wal error: {0}")]
    Wal(#[from] wal::Error),
    #[error("posting error: {0}")]
    Postings(#[from] inverted_index::Error),
    #[error("posting list error: {0}")]
    Ef(#[from] crate::eliasfano::Error),
    #[error("writes not started")]
    WritesNotStarted,
    #[error("no history value file covers [{0}, {1})")]
    MissingValueFile(u64, u64),
    #[error("operation cancelled")]
    Cancelled,
}

fn check_cancel(cancel: &CancelToken, i: usize) -> Result<(), Error> {
    if i % CANCEL_POLL == 0 && cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Previous-value history for one domain.
pub struct History {
    pub ii: InvertedIndex,
    spec: FileSpec,
    files: FileRegistry,
    vals_table: String,
    tmpdir: PathBuf,
    aggregation_step: u64,
    compression: Option<i32>,
    tx_num: u64,
    wal: Option<HistoryWal>,
    wal_mode: wal::Mode,
}

struct HistoryWal {
    vals: wal::Collector,
}

/// Write buffers rotated out of a history at flush time.
pub struct HistoryFlusher {
    vals: Option<wal::Collector>,
    idx: Option<IndexWal>,
}

impl HistoryFlusher {
    pub fn flush(self, tx: &dyn RwTx) -> Result<(), wal::Error> {
        if let Some(mut vals) = self.vals {
            vals.load(tx)?;
        }
        if let Some(idx) = self.idx {
            idx.flush(tx)?;
        }
        Ok(())
    }
}

/// One collated step of history, ready for file building.
pub struct HistoryCollation {
    pub bitmaps: BTreeMap<Vec<u8>, Vec<u64>>,
    writer: Option<SegWriter>,
}

impl HistoryCollation {
    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Drop partial output (error and cancellation path).
    pub fn close(self) {
        if let Some(writer) = self.writer {
            writer.abort();
        }
    }
}

/// Frozen artifacts of one history step.
pub struct HistoryFiles {
    pub ef: FileItem,
    pub v: FileItem,
}

impl History {
    pub fn new(
        dir: impl AsRef<Path>,
        tmpdir: impl AsRef<Path>,
        aggregation_step: u64,
        filename_base: &str,
        tables: &DomainTables,
        compress_vals: bool,
    ) -> Self {
        let ii = InvertedIndex::new(
            &dir,
            &tmpdir,
            aggregation_step,
            filename_base,
            IndexTables {
                keys: tables.history_keys.clone(),
                idx: tables.idx.clone(),
            },
            vec!["v"],
        );
        Self {
            ii,
            spec: FileSpec {
                dir: dir.as_ref().to_path_buf(),
                base: filename_base.to_string(),
                aggregation_step,
                data_ext: "v",
                index_ext: "vi",
                btree_ext: None,
                integrity_exts: vec!["ef"],
            },
            files: FileRegistry::new(),
            vals_table: tables.history_vals.clone(),
            tmpdir: tmpdir.as_ref().to_path_buf(),
            aggregation_step,
            compression: compress_vals.then_some(3),
            tx_num: 0,
            wal: None,
            wal_mode: wal::Mode::Buffered,
        }
    }

    pub fn open_folder(&self) -> Result<(), Error> {
        self.ii.open_folder()?;
        self.spec.scan_and_open(&self.files)?;
        Ok(())
    }

    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
        self.ii.set_tx_num(tx_num);
    }

    pub fn start_writes(&mut self, mode: wal::Mode) {
        self.wal_mode = mode;
        self.ii.start_writes(mode);
        self.wal = Some(HistoryWal {
            vals: wal::Collector::new(&self.vals_table, &self.tmpdir, mode),
        });
    }

    pub fn finish_writes(&mut self) {
        self.wal = None;
        self.ii.finish_writes();
    }

    pub fn rotate_wal(&mut self) -> HistoryFlusher {
        let next = HistoryWal {
            vals: wal::Collector::new(&self.vals_table, &self.tmpdir, self.wal_mode),
        };
        HistoryFlusher {
            vals: self.wal.replace(next).map(|w| w.vals),
            idx: self.ii.rotate_wal(),
        }
    }

    /// Record that `key` held `original` until the current txNum.
    pub fn add_prev_value(&mut self, key: &[u8], original: &[u8]) -> Result<(), Error> {
        let mut composite = key.to_vec();
        composite.extend_from_slice(&self.tx_num.to_be_bytes());
        let wal = self.wal.as_mut().ok_or(Error::WritesNotStarted)?;
        wal.vals.collect(&composite, original)?;
        self.ii.add(key)?;
        Ok(())
    }

    /// Collate `[tx_from, tx_to)`: group events by key and stream their
    /// previous values into the step's `.v` writer in (key, txNum) order.
    pub fn collate(
        &self,
        tx: &dyn Tx,
        step: u64,
        tx_from: u64,
        tx_to: u64,
        cancel: &CancelToken,
    ) -> Result<HistoryCollation, Error> {
        let bitmaps = self.ii.collate(tx, tx_from, tx_to, cancel)?;
        if bitmaps.is_empty() {
            return Ok(HistoryCollation {
                bitmaps,
                writer: None,
            });
        }
        let path = self.spec.data_path(step, step + 1);
        let mut writer = SegWriter::create(&path, self.compression)?;
        let mut i = 0usize;
        let result = (|| {
            for (key, tx_nums) in &bitmaps {
                for tx_num in tx_nums {
                    check_cancel(cancel, i)?;
                    i += 1;
                    let mut composite = key.clone();
                    composite.extend_from_slice(&tx_num.to_be_bytes());
                    let prev = tx.get_one(&self.vals_table, &composite)?.unwrap_or_default();
                    writer.add_word(&prev)?;
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => Ok(HistoryCollation {
                bitmaps,
                writer: Some(writer),
            }),
            Err(e) => {
                writer.abort();
                Err(e)
            }
        }
    }

    /// Seal one collated step into `.v`+`.vi` and `.ef`+`.efi`. A step
    /// with no events still produces the (empty) pair so coverage stays
    /// uniform across aggregated steps.
    pub fn build_files(
        &self,
        step: u64,
        collation: HistoryCollation,
        cancel: &CancelToken,
    ) -> Result<HistoryFiles, Error> {
        let HistoryCollation { bitmaps, writer } = collation;
        let ef = self.ii.build_files(step, &bitmaps, cancel)?;

        let writer = match writer {
            Some(writer) => writer,
            None => SegWriter::create(self.spec.data_path(step, step + 1), self.compression)?,
        };
        let data_path = self.spec.data_path(step, step + 1);
        let idx_path = self.spec.index_path(step, step + 1);
        let result = (|| {
            writer.finish()?;
            let data = Arc::new(SegReader::open(&data_path)?);
            let mut builder = HashIndexBuilder::new(&idx_path);
            let mut getter = data.getter();
            let mut i = 0usize;
            for (key, tx_nums) in &bitmaps {
                for tx_num in tx_nums {
                    check_cancel(cancel, i)?;
                    i += 1;
                    builder.add_key2(&tx_num.to_be_bytes(), key, getter.word_offset());
                    getter.skip_word()?;
                }
            }
            let index = builder.build()?;
            debug!(
                base = %self.spec.base,
                file = %data_path.display(),
                entries = index.key_count(),
                "built history value file"
            );
            Ok(HistoryFiles {
                ef,
                v: FileItem::new(
                    step * self.aggregation_step,
                    (step + 1) * self.aggregation_step,
                    self.aggregation_step,
                    data,
                    Some(index),
                    None,
                ),
            })
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&data_path);
            let _ = std::fs::remove_file(&idx_path);
        }
        result
    }

    pub fn integrate_files(&self, files: HistoryFiles) {
        self.ii.integrate_files(files.ef);
        self.files.insert(Arc::new(files.v));
    }

    /// Delete the KV-resident history of `[tx_from, tx_to)`: the value
    /// entries first, then the event posts. Idempotent and resumable.
    pub fn prune(
        &self,
        tx: &dyn RwTx,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let mut cursor = tx.cursor_dup_sort(self.history_keys_table())?;
        let mut victims = Vec::new();
        let mut at = cursor.seek(&tx_from.to_be_bytes())?;
        let mut i = 0usize;
        while let Some((k, key)) = at {
            check_cancel(cancel, i)?;
            i += 1;
            let tx_num = u64::from_be_bytes(k.as_slice().try_into().expect("txNum key"));
            if tx_num >= tx_to {
                break;
            }
            victims.push((key, tx_num));
            at = cursor.next()?;
        }
        drop(cursor);
        for (i, (key, tx_num)) in victims.iter().enumerate() {
            check_cancel(cancel, i)?;
            let mut composite = key.clone();
            composite.extend_from_slice(&tx_num.to_be_bytes());
            tx.delete(&self.vals_table, &composite)?;
        }
        self.ii.prune(tx, tx_from, tx_to, limit, cancel)?;
        Ok(())
    }

    fn history_keys_table(&self) -> &str {
        &self.ii.tables().keys
    }

    pub fn end_tx_num_max(&self) -> u64 {
        self.ii.end_tx_num_max().min(self.files.end_tx_num_max())
    }

    pub fn find_merge_range(&self, max_end: u64, max_span: u64) -> Option<(u64, u64)> {
        inverted_index::find_merge_range(&self.files, self.aggregation_step, max_end, max_span)
    }

    /// Input `.v` items of the pinned context inside `[from_tx, to_tx)`.
    pub fn value_files_in_range(
        &self,
        ctx: &HistoryContext,
        from_tx: u64,
        to_tx: u64,
    ) -> Vec<Arc<FileItem>> {
        ctx.v_files
            .iter()
            .filter(|f| f.start_tx_num >= from_tx && f.end_tx_num <= to_tx)
            .map(|f| f.src.clone())
            .collect()
    }

    pub fn index_files_in_range(
        &self,
        ctx: &HistoryContext,
        from_tx: u64,
        to_tx: u64,
    ) -> Vec<Arc<FileItem>> {
        self.ii.files_in_range(&ctx.ic, from_tx, to_tx)
    }

    /// Merge adjacent history slices: the `.ef` posting lists are unioned
    /// per key and every event's previous value is restreamed into the new
    /// `.v` in (key, txNum) order.
    pub fn merge_files(
        &self,
        ef_inputs: &[Arc<FileItem>],
        v_inputs: &[Arc<FileItem>],
        from_tx: u64,
        to_tx: u64,
        cancel: &CancelToken,
    ) -> Result<(FileItem, FileItem), Error> {
        let from_step = from_tx / self.aggregation_step;
        let to_step = to_tx / self.aggregation_step;
        let ef_path = self.spec.path(from_step, to_step, "ef");
        let efi_path = self.spec.path(from_step, to_step, "efi");
        let v_path = self.spec.data_path(from_step, to_step);
        let vi_path = self.spec.index_path(from_step, to_step);

        let result = (|| {
            let mut ef_writer = SegWriter::create(&ef_path, None)?;
            let mut v_writer = SegWriter::create(&v_path, self.compression)?;
            let mut vi_builder = HashIndexBuilder::new(&vi_path);

            let mut heap = BinaryHeap::new();
            for (i, input) in ef_inputs.iter().enumerate() {
                let mut getter = input.data.getter();
                if getter.has_next() {
                    let key = getter.next_word()?;
                    let ef = getter.next_word()?;
                    heap.push(EfSource {
                        key,
                        ef,
                        input: i,
                        getter,
                    });
                }
            }

            let mut i = 0usize;
            while let Some(top) = heap.pop() {
                check_cancel(cancel, i)?;
                i += 1;
                let key = top.key.clone();
                let mut merged: Vec<u64> = EliasFano::from_bytes(&top.ef)?.iter().collect();
                push_next(&mut heap, top)?;
                while heap.peek().is_some_and(|s| s.key == key) {
                    let source = heap.pop().expect("peeked");
                    merged.extend(EliasFano::from_bytes(&source.ef)?.iter());
                    push_next(&mut heap, source)?;
                }
                merged.sort_unstable();
                merged.dedup();

                ef_writer.add_uncompressed_word(&key)?;
                ef_writer.add_uncompressed_word(&crate::eliasfano::encode(&merged))?;

                for tx_num in merged {
                    let source = v_inputs
                        .iter()
                        .find(|f| f.start_tx_num <= tx_num && tx_num < f.end_tx_num)
                        .ok_or(Error::MissingValueFile(from_tx, to_tx))?;
                    let index = source
                        .index
                        .as_ref()
                        .ok_or(Error::MissingValueFile(from_tx, to_tx))?;
                    let offset = index
                        .lookup2(&tx_num.to_be_bytes(), &key)
                        .ok_or(Error::MissingValueFile(from_tx, to_tx))?;
                    let mut getter = source.data.getter();
                    getter.reset(offset);
                    let value = getter.next_word()?;
                    vi_builder.add_key2(&tx_num.to_be_bytes(), &key, v_writer.next_offset());
                    v_writer.add_word(&value)?;
                }
            }

            ef_writer.finish()?;
            v_writer.finish()?;

            let ef_data = Arc::new(SegReader::open(&ef_path)?);
            let mut efi_builder = HashIndexBuilder::new(&efi_path);
            let mut getter = ef_data.getter();
            while getter.has_next() {
                let offset = getter.word_offset();
                let key = getter.next_word()?;
                efi_builder.add_key(&key, offset);
                getter.skip_word()?;
            }
            let efi = efi_builder.build()?;
            let ef_item = FileItem::new(
                from_tx,
                to_tx,
                self.aggregation_step,
                ef_data,
                Some(efi),
                None,
            );

            let v_data = Arc::new(SegReader::open(&v_path)?);
            let vi = vi_builder.build()?;
            let v_item = FileItem::new(
                from_tx,
                to_tx,
                self.aggregation_step,
                v_data,
                Some(vi),
                None,
            );
            info!(
                base = %self.spec.base,
                from_step, to_step,
                "merged history files"
            );
            Ok((ef_item, v_item))
        })();
        if result.is_err() {
            for path in [&ef_path, &efi_path, &v_path, &vi_path] {
                let _ = std::fs::remove_file(path);
            }
        }
        result
    }

    pub fn integrate_merged_files(
        &self,
        ef_inputs: &[Arc<FileItem>],
        v_inputs: &[Arc<FileItem>],
        ef_item: FileItem,
        v_item: FileItem,
    ) {
        self.ii.integrate_merged_files(ef_inputs, ef_item);
        let v_item = Arc::new(v_item);
        self.files.insert(v_item.clone());
        for input in v_inputs {
            self.files.retire(input);
        }
        if v_item.frozen {
            self.files.retire_subsets_of(&v_item);
        }
    }

    pub fn make_context(&self) -> HistoryContext {
        let v_files = self.files.ro_files();
        for f in v_files.iter() {
            f.src.pin();
        }
        HistoryContext {
            ic: self.ii.make_context(),
            v_files,
            vals_table: self.vals_table.clone(),
            idx_table: self.ii.tables().idx.clone(),
        }
    }

    pub fn close(&mut self) {
        self.wal = None;
        self.ii.close();
    }
}

struct EfSource<'a> {
    key: Vec<u8>,
    ef: Vec<u8>,
    input: usize,
    getter: crate::seg::Getter<'a>,
}

impl PartialEq for EfSource<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.input == other.input
    }
}
impl Eq for EfSource<'_> {}
impl PartialOrd for EfSource<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for EfSource<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Reverse;
        Reverse(&self.key)
            .cmp(&Reverse(&other.key))
            .then_with(|| Reverse(self.input).cmp(&Reverse(other.input)))
    }
}

fn push_next<'a>(heap: &mut BinaryHeap<EfSource<'a>>, mut source: EfSource<'a>) -> Result<(), Error> {
    if source.getter.has_next() {
        source.key = source.getter.next_word()?;
        source.ef = source.getter.next_word()?;
        heap.push(source);
    }
    Ok(())
}

/// Outcome of resolving a key against the frozen history.
pub enum HistoryHit {
    /// The value just before the first change at or after the queried
    /// txNum. Empty bytes mark key creation.
    Value(Vec<u8>),
    /// History files cover the range but record no change at or after the
    /// queried txNum: the latest value as of `top_start` still applies.
    Unchanged { top_start: u64 },
    /// No history file covers the queried txNum.
    NotCovered,
}

/// Pinned snapshot of a history's files.
pub struct HistoryContext {
    pub ic: IndexContext,
    v_files: Arc<Vec<CtxFile>>,
    vals_table: String,
    idx_table: String,
}

impl HistoryContext {
    fn v_file_for(&self, start: u64, end: u64) -> Option<&CtxFile> {
        self.v_files
            .iter()
            .find(|f| f.start_tx_num == start && f.end_tx_num == end)
    }

    /// Resolve `key` at `tx_num` against the frozen files only.
    pub fn get_no_state(&self, key: &[u8], tx_num: u64) -> Result<HistoryHit, Error> {
        let files = &self.ic.files;
        let top_state = files.iter().find(|f| f.end_tx_num >= tx_num);
        let Some(top_state) = top_state else {
            return Ok(HistoryHit::NotCovered);
        };

        let mut found: Option<(u64, u64, u64)> = None;
        for item in files.iter() {
            if item.end_tx_num < tx_num {
                continue;
            }
            let Some(index) = &item.src.index else { continue };
            let Some(offset) = index.lookup(key) else { continue };
            let mut getter = item.src.data.getter();
            getter.reset(offset);
            let stored_key = getter.next_word()?;
            if stored_key != key {
                continue;
            }
            let ef = EliasFano::from_bytes(&getter.next_word()?)?;
            if let Some(n) = ef.search(tx_num) {
                found = Some((n, item.start_tx_num, item.end_tx_num));
                break;
            }
            if item.end_tx_num > tx_num && item.end_tx_num >= top_state.end_tx_num {
                // No later change recorded anywhere at or above the top
                // covering slice: the latest value still applies.
                break;
            }
        }

        let Some((event_tx, start, end)) = found else {
            return Ok(HistoryHit::Unchanged {
                top_start: top_state.start_tx_num,
            });
        };
        let v_file = self
            .v_file_for(start, end)
            .ok_or(Error::MissingValueFile(start, end))?;
        let index = v_file
            .src
            .index
            .as_ref()
            .ok_or(Error::MissingValueFile(start, end))?;
        let offset = index
            .lookup2(&event_tx.to_be_bytes(), key)
            .ok_or(Error::MissingValueFile(start, end))?;
        let mut getter = v_file.src.data.getter();
        getter.reset(offset);
        Ok(HistoryHit::Value(getter.next_word()?))
    }

    /// Resolve `key` at `tx_num` against the KV tables: the smallest
    /// recorded change at or after `tx_num` carries the value that was
    /// current at `tx_num`.
    pub fn get_no_state_from_db(
        &self,
        key: &[u8],
        tx_num: u64,
        tx: &dyn Tx,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut cursor = tx.cursor_dup_sort(&self.idx_table)?;
        let Some(event) = cursor.seek_both_range(key, &tx_num.to_be_bytes())? else {
            return Ok(None);
        };
        let mut composite = key.to_vec();
        composite.extend_from_slice(&event);
        Ok(Some(
            tx.get_one(&self.vals_table, &composite)?.unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;

    fn setup(dir: &Path) -> (MemKv, History) {
        let kv = MemKv::new();
        let tables = DomainTables::new("acc");
        for (name, dup) in tables.all() {
            kv.create_table(name, dup);
        }
        let mut h = History::new(dir, dir, 4, "acc", &tables, false);
        h.start_writes(wal::Mode::Buffered);
        (kv, h)
    }

    fn record(h: &mut History, tx: &dyn RwTx, tx_num: u64, key: &[u8], prev: &[u8]) {
        h.set_tx_num(tx_num);
        h.add_prev_value(key, prev).unwrap();
        h.rotate_wal().flush(tx).unwrap();
        h.start_writes(wal::Mode::Buffered);
    }

    fn freeze_step(h: &History, tx: &dyn RwTx, step: u64) {
        let cancel = CancelToken::new();
        let (from, to) = (step * 4, (step + 1) * 4);
        let collation = h.collate(tx, step, from, to, &cancel).unwrap();
        let files = h.build_files(step, collation, &cancel).unwrap();
        h.integrate_files(files);
        h.prune(tx, from, to, u64::MAX, &cancel).unwrap();
    }

    #[test]
    fn value_before_change_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut h) = setup(dir.path());
        let tx = kv.begin_rw();

        // Key overwritten at tx 1 (was "v0") and at tx 6 (was "v1").
        record(&mut h, &tx, 1, b"k", b"v0");
        record(&mut h, &tx, 6, b"k", b"v1");
        freeze_step(&h, &tx, 0);
        freeze_step(&h, &tx, 1);
        assert!(dir.path().join("acc.0-1.v").exists());
        assert!(dir.path().join("acc.0-1.ef").exists());

        let ctx = h.make_context();
        // Value at tx 0: the change at tx 1 recorded "v0".
        match ctx.get_no_state(b"k", 0).unwrap() {
            HistoryHit::Value(v) => assert_eq!(v, b"v0"),
            _ => panic!("expected a recorded value"),
        }
        // Inside the first slice with no later event there, the latest
        // value of that slice applies (the domain value file answers).
        match ctx.get_no_state(b"k", 2).unwrap() {
            HistoryHit::Unchanged { top_start } => assert_eq!(top_start, 0),
            _ => panic!("expected unchanged within the first slice"),
        }
        // In (4, 6]: the change at tx 6 recorded "v1".
        for tx_num in [5u64, 6] {
            match ctx.get_no_state(b"k", tx_num).unwrap() {
                HistoryHit::Value(v) => assert_eq!(v, b"v1", "at {tx_num}"),
                _ => panic!("expected a recorded value at {tx_num}"),
            }
        }
        // Past the last change the latest value applies.
        match ctx.get_no_state(b"k", 7).unwrap() {
            HistoryHit::Unchanged { top_start } => assert_eq!(top_start, 4),
            _ => panic!("expected unchanged"),
        }
        // Outside file coverage entirely.
        assert!(matches!(
            ctx.get_no_state(b"k", 9).unwrap(),
            HistoryHit::NotCovered
        ));
    }

    #[test]
    fn db_fallback_when_not_frozen() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut h) = setup(dir.path());
        let tx = kv.begin_rw();

        record(&mut h, &tx, 5, b"k", b"old");
        let ctx = h.make_context();
        assert!(matches!(
            ctx.get_no_state(b"k", 3).unwrap(),
            HistoryHit::NotCovered
        ));
        let v = ctx.get_no_state_from_db(b"k", 3, &tx).unwrap().unwrap();
        assert_eq!(v, b"old");
        assert!(ctx.get_no_state_from_db(b"k", 6, &tx).unwrap().is_none());
    }

    #[test]
    fn prune_does_not_change_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut h) = setup(dir.path());
        let tx = kv.begin_rw();

        record(&mut h, &tx, 2, b"k", b"before");
        let cancel = CancelToken::new();
        let collation = h.collate(&tx, 0, 0, 4, &cancel).unwrap();
        let files = h.build_files(0, collation, &cancel).unwrap();
        h.integrate_files(files);

        // A context opened before the prune still resolves from its KV
        // snapshot; one opened after resolves from the file. Same answer.
        let ro_before = kv.begin_ro();
        let ctx = h.make_context();
        h.prune(&tx, 0, 4, u64::MAX, &cancel).unwrap();

        let from_db = ctx.get_no_state_from_db(b"k", 1, &ro_before).unwrap();
        assert_eq!(from_db.unwrap(), b"before");
        match ctx.get_no_state(b"k", 1).unwrap() {
            HistoryHit::Value(v) => assert_eq!(v, b"before"),
            _ => panic!("expected value from file"),
        }
    }

    #[test]
    fn merge_concatenates_events() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut h) = setup(dir.path());
        let tx = kv.begin_rw();

        record(&mut h, &tx, 1, b"k", b"a");
        record(&mut h, &tx, 5, b"k", b"b");
        record(&mut h, &tx, 6, b"other", b"x");
        freeze_step(&h, &tx, 0);
        freeze_step(&h, &tx, 1);

        let cancel = CancelToken::new();
        let (from, to) = h.find_merge_range(8, 32 * 4).unwrap();
        assert_eq!((from, to), (0, 8));

        let ctx = h.make_context();
        let ef_inputs = h.index_files_in_range(&ctx, from, to);
        let v_inputs = h.value_files_in_range(&ctx, from, to);
        assert_eq!(ef_inputs.len(), 2);
        assert_eq!(v_inputs.len(), 2);
        let (ef_item, v_item) = h
            .merge_files(&ef_inputs, &v_inputs, from, to, &cancel)
            .unwrap();
        h.integrate_merged_files(&ef_inputs, &v_inputs, ef_item, v_item);
        drop(ctx);

        let ctx = h.make_context();
        match ctx.get_no_state(b"k", 0).unwrap() {
            HistoryHit::Value(v) => assert_eq!(v, b"a"),
            _ => panic!("expected value"),
        }
        match ctx.get_no_state(b"k", 3).unwrap() {
            HistoryHit::Value(v) => assert_eq!(v, b"b"),
            _ => panic!("expected value"),
        }
        match ctx.get_no_state(b"other", 2).unwrap() {
            HistoryHit::Value(v) => assert_eq!(v, b"x"),
            _ => panic!("expected value"),
        }
    }
}
