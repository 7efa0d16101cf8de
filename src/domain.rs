//! A versioned key-value column: latest values in the KV store, history
//! behind it, and a layered stack of immutable files below.
//!
//! The latest value of a key lives in two tables: `keys` (dup-sorted,
//! `key -> invertedStep` where `invertedStep = !(txNum / step)` big-endian,
//! so the newest step sorts first) and `vals` (`key || invertedStep ->
//! value`). Every overwrite records the previous value in [`History`].
//!
//! On a step boundary the closed step is collated into a `.kv` segment
//! (key-sorted pairs) with `.kvi` and `.bt` indices, the KV-resident copy
//! of the step is pruned, and adjacent files are merged into larger spans
//! in the background. Reads walk KV first, then the file stack
//! newest-first through the B-tree indices.

use crate::{
    files::{self, CtxFile, FileItem, FileRegistry, FileSpec},
    history::{History, HistoryCollation, HistoryContext, HistoryFiles, HistoryFlusher, HistoryHit},
    index::{self, btree, hash::HashIndexBuilder},
    kv::{self, DomainTables, DupCursor, RwTx, Tx},
    seg::{SegReader, SegWriter},
    wal, CancelToken,
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap},
    path::Path,
    sync::{mpsc, Arc},
};
use thiserror::Error;
use tracing::{debug, info};

const CANCEL_POLL: usize = 1024;

/// Depth of the queue between the collation scan and the segment writer.
const COLLATE_QUEUE: usize = 4;

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
    #[error("history error: {0}")]
    History(#[from] crate::history::Error),
    #[error("wal error: {0}")]
    Wal(#[from] wal::Error),
    #[error("operation cancelled")]
    Cancelled,
}

fn check_cancel(cancel: &CancelToken, i: usize) -> Result<(), Error> {
    if i % CANCEL_POLL == 0 && cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

pub(crate) fn inverted_step(tx_num: u64, aggregation_step: u64) -> [u8; 8] {
    (!(tx_num / aggregation_step)).to_be_bytes()
}

fn step_of_inverted(inv: &[u8]) -> u64 {
    !u64::from_be_bytes(inv.try_into().expect("inverted step"))
}

fn composite(key: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + suffix.len());
    out.extend_from_slice(key);
    out.extend_from_slice(suffix);
    out
}

/// One versioned KV column.
pub struct Domain {
    pub history: History,
    spec: FileSpec,
    files: FileRegistry,
    tables: DomainTables,
    aggregation_step: u64,
    compression: Option<i32>,
    tx_num: u64,
}

/// Merge work available for one domain, per file slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DomainRanges {
    pub values: Option<(u64, u64)>,
    pub history: Option<(u64, u64)>,
}

impl DomainRanges {
    pub fn any(&self) -> bool {
        self.values.is_some() || self.history.is_some()
    }
}

/// One collated step, ready for file building.
pub struct Collation {
    pub history: HistoryCollation,
    values_writer: Option<SegWriter>,
    pub values_count: u64,
}

impl Collation {
    pub fn is_empty(&self) -> bool {
        self.values_writer.is_none() && self.history.is_empty()
    }

    /// Drop partial output (error and cancellation path).
    pub fn close(self) {
        if let Some(writer) = self.values_writer {
            writer.abort();
        }
        self.history.close();
    }
}

/// Frozen artifacts of one domain step.
pub struct StaticFiles {
    pub values: FileItem,
    pub history: HistoryFiles,
}

impl Domain {
    pub fn new(
        dir: impl AsRef<Path>,
        tmpdir: impl AsRef<Path>,
        aggregation_step: u64,
        filename_base: &str,
        tables: DomainTables,
        compress_vals: bool,
    ) -> Self {
        let history = History::new(
            &dir,
            &tmpdir,
            aggregation_step,
            filename_base,
            &tables,
            compress_vals,
        );
        Self {
            history,
            spec: FileSpec {
                dir: dir.as_ref().to_path_buf(),
                base: filename_base.to_string(),
                aggregation_step,
                data_ext: "kv",
                index_ext: "kvi",
                btree_ext: Some("bt"),
                integrity_exts: Vec::new(),
            },
            files: FileRegistry::new(),
            tables,
            aggregation_step,
            compression: compress_vals.then_some(3),
            tx_num: 0,
        }
    }

    pub fn filename_base(&self) -> &str {
        &self.spec.base
    }

    pub fn tables(&self) -> &DomainTables {
        &self.tables
    }

    pub fn open_folder(&self) -> Result<(), Error> {
        self.history.open_folder()?;
        self.spec.scan_and_open(&self.files)?;
        Ok(())
    }

    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
        self.history.set_tx_num(tx_num);
    }

    pub fn start_writes(&mut self, mode: wal::Mode) {
        self.history.start_writes(mode);
    }

    pub fn finish_writes(&mut self) {
        self.history.finish_writes();
    }

    pub fn rotate_wal(&mut self) -> HistoryFlusher {
        self.history.rotate_wal()
    }

    /// Write `key -> value` at the current txNum, recording the previous
    /// value in history. Writing the current value again is a no-op.
    pub fn put(
        &mut self,
        tx: &dyn RwTx,
        ctx: &DomainContext,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), Error> {
        let original = ctx.get_latest(key, tx)?;
        if original.as_deref() == Some(value) {
            return Ok(());
        }
        self.history
            .add_prev_value(key, original.as_deref().unwrap_or_default())?;
        let inv = inverted_step(self.tx_num, self.aggregation_step);
        tx.put(&self.tables.keys, key, &inv)?;
        tx.put(&self.tables.vals, &composite(key, &inv), value)?;
        Ok(())
    }

    /// Delete `key` at the current txNum. Deleting an absent key is a
    /// no-op.
    pub fn delete(&mut self, tx: &dyn RwTx, ctx: &DomainContext, key: &[u8]) -> Result<(), Error> {
        let Some(original) = ctx.get_latest(key, tx)? else {
            return Ok(());
        };
        self.history.add_prev_value(key, &original)?;
        let inv = inverted_step(self.tx_num, self.aggregation_step);
        tx.put(&self.tables.keys, key, &inv)?;
        tx.delete(&self.tables.vals, &composite(key, &inv))?;
        Ok(())
    }

    /// Collate the closed step `[tx_from, tx_to)`: every key written
    /// during the step is emitted with its value as of the step, keys
    /// sorted. Serial reference version; `collate_stream` produces
    /// identical bytes.
    pub fn collate(
        &self,
        tx: &dyn Tx,
        step: u64,
        tx_from: u64,
        tx_to: u64,
        cancel: &CancelToken,
    ) -> Result<Collation, Error> {
        let history = self.history.collate(tx, step, tx_from, tx_to, cancel)?;
        let mut writer: Option<SegWriter> = None;
        let mut count = 0u64;
        let result = (|| {
            let mut pairs = self.step_pairs(tx, step, cancel)?;
            if pairs.next_pair()?.is_none() {
                return Ok(());
            }
            let mut w = SegWriter::create(
                self.spec.data_path(step, step + 1),
                self.compression,
            )?;
            // Re-scan from the top so the first pair is not lost.
            let mut pairs = self.step_pairs(tx, step, cancel)?;
            while let Some((key, value)) = pairs.next_pair()? {
                w.add_uncompressed_word(&key)?;
                w.add_word(&value)?;
                count += 1;
            }
            writer = Some(w);
            Ok(())
        })();
        match result {
            Ok(()) => Ok(Collation {
                history,
                values_writer: writer,
                values_count: count,
            }),
            Err(e) => {
                if let Some(w) = writer {
                    w.abort();
                }
                history.close();
                Err(e)
            }
        }
    }

    /// Pipelined collation: the cursor scan feeds the segment writer
    /// through a bounded queue so disk reads and compression overlap. A
    /// slow writer blocks the scan. Byte-identical to `collate`.
    pub fn collate_stream(
        &self,
        tx: &dyn Tx,
        step: u64,
        tx_from: u64,
        tx_to: u64,
        cancel: &CancelToken,
    ) -> Result<Collation, Error> {
        let history = self.history.collate(tx, step, tx_from, tx_to, cancel)?;
        let data_path = self.spec.data_path(step, step + 1);

        let outcome = std::thread::scope(|scope| {
            let (sender, receiver) = mpsc::sync_channel::<(Vec<u8>, Vec<u8>)>(COLLATE_QUEUE);
            let compression = self.compression;
            let path = data_path.clone();
            let collator = scope.spawn(move || -> Result<Option<(SegWriter, u64)>, Error> {
                let mut writer: Option<SegWriter> = None;
                let mut count = 0u64;
                for (key, value) in receiver {
                    if writer.is_none() {
                        writer = Some(SegWriter::create(&path, compression)?);
                    }
                    let w = writer.as_mut().expect("writer just created");
                    w.add_uncompressed_word(&key)?;
                    w.add_word(&value)?;
                    count += 1;
                }
                Ok(writer.map(|w| (w, count)))
            });

            let produced: Result<(), Error> = (|| {
                let mut pairs = self.step_pairs(tx, step, cancel)?;
                while let Some(pair) = pairs.next_pair()? {
                    if sender.send(pair).is_err() {
                        break;
                    }
                }
                Ok(())
            })();
            drop(sender);
            let collated = collator.join().expect("collator thread panicked");
            (produced, collated)
        });

        match outcome {
            (Ok(()), Ok(built)) => Ok(Collation {
                history,
                values_count: built.as_ref().map_or(0, |(_, c)| *c),
                values_writer: built.map(|(w, _)| w),
            }),
            (produced, collated) => {
                let err = match (produced, collated) {
                    (Err(e), collated) => {
                        if let Ok(Some((w, _))) = collated {
                            w.abort();
                        }
                        e
                    }
                    (Ok(()), Err(e)) => {
                        let _ = std::fs::remove_file(&data_path);
                        e
                    }
                    (Ok(()), Ok(_)) => unreachable!("success handled above"),
                };
                history.close();
                Err(err)
            }
        }
    }

    fn step_pairs<'a>(
        &'a self,
        tx: &'a dyn Tx,
        step: u64,
        cancel: &'a CancelToken,
    ) -> Result<StepPairs<'a>, Error> {
        Ok(StepPairs {
            keys: tx.cursor_dup_sort(&self.tables.keys)?,
            probe: tx.cursor_dup_sort(&self.tables.keys)?,
            tx,
            vals_table: &self.tables.vals,
            inv: inverted_step(step * self.aggregation_step, self.aggregation_step),
            started: false,
            cancel,
            scanned: 0,
        })
    }

    /// Seal one collated step into `.kv` + `.kvi` + `.bt` plus the
    /// history files.
    pub fn build_files(
        &self,
        step: u64,
        collation: Collation,
        cancel: &CancelToken,
    ) -> Result<StaticFiles, Error> {
        let Collation {
            history,
            values_writer,
            values_count,
        } = collation;
        let history_files = self.history.build_files(step, history, cancel)?;

        let writer = match values_writer {
            Some(writer) => writer,
            None => SegWriter::create(self.spec.data_path(step, step + 1), self.compression)?,
        };
        let data_path = self.spec.data_path(step, step + 1);
        let idx_path = self.spec.index_path(step, step + 1);
        let bt_path = self.spec.path(step, step + 1, "bt");
        let result = (|| {
            writer.finish()?;
            let values = self.open_built_values(step, step + 1, cancel)?;
            debug!(
                base = %self.spec.base,
                step,
                keys = values_count,
                "built domain value files"
            );
            Ok(StaticFiles {
                values,
                history: history_files,
            })
        })();
        if result.is_err() {
            for path in [&data_path, &idx_path, &bt_path] {
                let _ = std::fs::remove_file(path);
            }
        }
        result
    }

    fn open_built_values(
        &self,
        from_step: u64,
        to_step: u64,
        cancel: &CancelToken,
    ) -> Result<FileItem, Error> {
        let data = Arc::new(SegReader::open(self.spec.data_path(from_step, to_step))?);
        let mut builder = HashIndexBuilder::new(self.spec.index_path(from_step, to_step));
        let mut getter = data.getter();
        let mut i = 0usize;
        while getter.has_next() {
            check_cancel(cancel, i)?;
            i += 1;
            let offset = getter.word_offset();
            let key = getter.next_word()?;
            builder.add_key(&key, offset);
            getter.skip_word()?;
        }
        let index = builder.build()?;
        let bt_path = self.spec.path(from_step, to_step, "bt");
        btree::build(&data, &bt_path, btree::DEFAULT_ARITY)?;
        let bt = btree::BtIndex::open(&bt_path, data.clone())?;
        Ok(FileItem::new(
            from_step * self.aggregation_step,
            to_step * self.aggregation_step,
            self.aggregation_step,
            data,
            Some(index),
            Some(bt),
        ))
    }

    pub fn integrate_files(&self, sf: StaticFiles) {
        self.history.integrate_files(sf.history);
        self.files.insert(Arc::new(sf.values));
    }

    /// Prune the KV-resident copy of the frozen step: every step marker at
    /// or below `step` that has a newer marker above it is obsolete in KV.
    /// Idempotent and resumable.
    pub fn prune(
        &self,
        tx: &dyn RwTx,
        step: u64,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let mut max_step: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        {
            let mut cursor = tx.cursor_dup_sort(&self.tables.keys)?;
            let mut at = cursor.first()?;
            let mut i = 0usize;
            while let Some((key, inv)) = at {
                check_cancel(cancel, i)?;
                i += 1;
                let s = step_of_inverted(&inv);
                let entry = max_step.entry(key).or_insert(s);
                *entry = (*entry).max(s);
                at = cursor.next()?;
            }
        }

        for (i, (key, max)) in max_step.iter().enumerate() {
            check_cancel(cancel, i)?;
            if *max <= step {
                continue;
            }
            for inv in tx.dup_range(&self.tables.keys, key, None, None, true, None)? {
                let s = step_of_inverted(&inv);
                if s > step {
                    continue;
                }
                tx.delete_exact(&self.tables.keys, key, &inv)?;
                tx.delete(&self.tables.vals, &composite(key, &inv))?;
            }
        }

        self.history.prune(tx, tx_from, tx_to, limit, cancel)?;
        Ok(())
    }

    pub fn end_tx_num_max(&self) -> u64 {
        self.files
            .end_tx_num_max()
            .min(self.history.end_tx_num_max())
    }

    pub fn find_merge_range(&self, max_end: u64, max_span: u64) -> DomainRanges {
        DomainRanges {
            values: crate::inverted_index::find_merge_range(
                &self.files,
                self.aggregation_step,
                max_end,
                max_span,
            ),
            history: self.history.find_merge_range(max_end, max_span),
        }
    }

    pub fn value_files_in_range(
        &self,
        ctx: &DomainContext,
        from_tx: u64,
        to_tx: u64,
    ) -> Vec<Arc<FileItem>> {
        ctx.files
            .iter()
            .filter(|f| f.start_tx_num >= from_tx && f.end_tx_num <= to_tx)
            .map(|f| f.src.clone())
            .collect()
    }

    /// Streaming merge of domain value files: equal keys resolve to the
    /// input with the newest endTxNum.
    pub fn merge_value_files(
        &self,
        inputs: &[Arc<FileItem>],
        from_tx: u64,
        to_tx: u64,
        cancel: &CancelToken,
    ) -> Result<FileItem, Error> {
        let from_step = from_tx / self.aggregation_step;
        let to_step = to_tx / self.aggregation_step;
        let data_path = self.spec.data_path(from_step, to_step);
        let idx_path = self.spec.index_path(from_step, to_step);
        let bt_path = self.spec.path(from_step, to_step, "bt");

        let result = (|| {
            let mut writer = SegWriter::create(&data_path, self.compression)?;
            let mut heap = BinaryHeap::new();
            for input in inputs.iter() {
                let mut getter = input.data.getter();
                if getter.has_next() {
                    let key = getter.next_word()?;
                    let value = getter.next_word()?;
                    heap.push(ValueSource {
                        key,
                        value,
                        end_tx_num: input.end_tx_num,
                        getter,
                    });
                }
            }

            let mut i = 0usize;
            while let Some(top) = heap.pop() {
                check_cancel(cancel, i)?;
                i += 1;
                let key = top.key.clone();
                // The heap orders equal keys newest-first: the first pop
                // wins, the rest are drained.
                writer.add_uncompressed_word(&key)?;
                writer.add_word(&top.value)?;
                push_next_value(&mut heap, top)?;
                while heap.peek().is_some_and(|s| s.key == key) {
                    let stale = heap.pop().expect("peeked");
                    push_next_value(&mut heap, stale)?;
                }
            }
            writer.finish()?;
            let item = self.open_built_values(from_step, to_step, cancel)?;
            info!(
                base = %self.spec.base,
                from_step, to_step,
                inputs = inputs.len(),
                "merged domain value files"
            );
            Ok(item)
        })();
        if result.is_err() {
            for path in [&data_path, &idx_path, &bt_path] {
                let _ = std::fs::remove_file(path);
            }
        }
        result
    }

    pub fn integrate_merged_value_files(&self, inputs: &[Arc<FileItem>], merged: FileItem) {
        let merged = Arc::new(merged);
        self.files.insert(merged.clone());
        for input in inputs {
            self.files.retire(input);
        }
        if merged.frozen {
            self.files.retire_subsets_of(&merged);
        }
    }

    pub fn make_context(&self) -> DomainContext {
        let files = self.files.ro_files();
        for f in files.iter() {
            f.src.pin();
        }
        DomainContext {
            files,
            hc: self.history.make_context(),
            keys_table: self.tables.keys.clone(),
            vals_table: self.tables.vals.clone(),
            aggregation_step: self.aggregation_step,
        }
    }

    pub fn close(&mut self) {
        self.history.close();
    }
}

/// Scans the keys table and yields `(key, value)` for every key written
/// during the collated step, in key order.
struct StepPairs<'a> {
    keys: Box<dyn DupCursor + 'a>,
    probe: Box<dyn DupCursor + 'a>,
    tx: &'a dyn Tx,
    vals_table: &'a str,
    inv: [u8; 8],
    started: bool,
    cancel: &'a CancelToken,
    scanned: usize,
}

impl StepPairs<'_> {
    fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        loop {
            check_cancel(self.cancel, self.scanned)?;
            self.scanned += 1;
            let at = if self.started {
                self.keys.next_no_dup()?
            } else {
                self.started = true;
                self.keys.first()?
            };
            let Some((key, _)) = at else { return Ok(None) };
            // Only keys carrying a marker for the collated step belong to
            // this file.
            let hit = self.probe.seek_both_range(&key, &self.inv)?;
            if hit.as_deref() != Some(&self.inv[..]) {
                continue;
            }
            let value = self
                .tx
                .get_one(self.vals_table, &composite(&key, &self.inv))?
                .unwrap_or_default();
            return Ok(Some((key, value)));
        }
    }
}

struct ValueSource<'a> {
    key: Vec<u8>,
    value: Vec<u8>,
    end_tx_num: u64,
    getter: crate::seg::Getter<'a>,
}

impl PartialEq for ValueSource<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.end_tx_num == other.end_tx_num
    }
}
impl Eq for ValueSource<'_> {}
impl PartialOrd for ValueSource<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ValueSource<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: smallest key first, then newest endTxNum first.
        use std::cmp::Reverse;
        Reverse(&self.key)
            .cmp(&Reverse(&other.key))
            .then_with(|| self.end_tx_num.cmp(&other.end_tx_num))
    }
}

fn push_next_value<'a>(
    heap: &mut BinaryHeap<ValueSource<'a>>,
    mut source: ValueSource<'a>,
) -> Result<(), Error> {
    if source.getter.has_next() {
        source.key = source.getter.next_word()?;
        source.value = source.getter.next_word()?;
        heap.push(source);
    }
    Ok(())
}

/// Pinned snapshot of a domain's files for consistent reads.
pub struct DomainContext {
    files: Arc<Vec<CtxFile>>,
    pub hc: HistoryContext,
    keys_table: String,
    vals_table: String,
    aggregation_step: u64,
}

impl Drop for DomainContext {
    fn drop(&mut self) {
        for f in self.files.iter() {
            f.src.unpin();
        }
    }
}

impl DomainContext {
    /// Latest value of `key` in the transaction's snapshot: the newest KV
    /// marker first, then every file newest-first.
    pub fn get_latest(&self, key: &[u8], tx: &dyn Tx) -> Result<Option<Vec<u8>>, Error> {
        let mut cursor = tx.cursor_dup_sort(&self.keys_table)?;
        if let Some(found_inv) = cursor.seek_both_range(key, &[0u8; 8])? {
            let value = tx.get_one(&self.vals_table, &composite(key, &found_inv))?;
            return Ok(value.filter(|v| !v.is_empty()));
        }
        for f in self.files.iter().rev() {
            let Some(bt) = &f.src.btree else { continue };
            if bt.is_empty() {
                continue;
            }
            if let Some(value) = bt.get(key)? {
                return Ok(Some(value).filter(|v| !v.is_empty()));
            }
        }
        Ok(None)
    }

    /// Latest value of `key` as of `as_of_tx`: the KV tables first, then
    /// the file stack newest-first. Deletion markers read as absent.
    pub fn get(&self, key: &[u8], as_of_tx: u64, tx: &dyn Tx) -> Result<Option<Vec<u8>>, Error> {
        let inv = inverted_step(as_of_tx, self.aggregation_step);
        let mut cursor = tx.cursor_dup_sort(&self.keys_table)?;
        if let Some(found_inv) = cursor.seek_both_range(key, &inv)? {
            let value = tx.get_one(&self.vals_table, &composite(key, &found_inv))?;
            return Ok(value.filter(|v| !v.is_empty()));
        }
        self.read_from_files(key, as_of_tx)
    }

    fn read_from_files(&self, key: &[u8], from_tx: u64) -> Result<Option<Vec<u8>>, Error> {
        for f in self.files.iter().rev() {
            if f.end_tx_num < from_tx {
                break;
            }
            let Some(bt) = &f.src.btree else { continue };
            if bt.is_empty() {
                continue;
            }
            if let Some(value) = bt.get(key)? {
                return Ok(Some(value).filter(|v| !v.is_empty()));
            }
        }
        Ok(None)
    }

    /// Value of `key` as it was just before `tx_num`, or `None` if the key
    /// did not exist then.
    pub fn get_before_tx_num(
        &self,
        key: &[u8],
        tx_num: u64,
        tx: &dyn Tx,
    ) -> Result<Option<Vec<u8>>, Error> {
        match self.hc.get_no_state(key, tx_num)? {
            HistoryHit::Value(v) => Ok(Some(v).filter(|v| !v.is_empty())),
            HistoryHit::Unchanged { top_start } => {
                // No change at or after tx_num within the covered range:
                // the newest value file at or below the top slice answers.
                for f in self.files.iter().rev() {
                    if f.start_tx_num > top_start {
                        continue;
                    }
                    let Some(bt) = &f.src.btree else { continue };
                    if bt.is_empty() {
                        continue;
                    }
                    if let Some(value) = bt.get(key)? {
                        return Ok(Some(value).filter(|v| !v.is_empty()));
                    }
                }
                Ok(None)
            }
            HistoryHit::NotCovered => {
                if let Some(v) = self.hc.get_no_state_from_db(key, tx_num, tx)? {
                    return Ok(Some(v).filter(|v| !v.is_empty()));
                }
                self.get(key, tx_num.saturating_sub(1), tx)
            }
        }
    }

    /// Merge-iterate every `(key, value)` under `prefix` across the KV
    /// tables and the file stack, each key yielded once with its newest
    /// value. Deletion markers suppress the key.
    pub fn iterate_prefix<'a>(
        &'a self,
        prefix: &[u8],
        tx: &'a dyn Tx,
    ) -> Result<PrefixIter<'a>, Error> {
        let mut heap = BinaryHeap::new();

        let mut cursor = tx.cursor_dup_sort(&self.keys_table)?;
        if let Some((key, inv)) = cursor.seek(prefix)? {
            if key.starts_with(prefix) {
                let value = tx
                    .get_one(&self.vals_table, &composite(&key, &inv))?
                    .unwrap_or_default();
                let end = (step_of_inverted(&inv) + 1) * self.aggregation_step;
                heap.push(PrefixSource {
                    key,
                    value,
                    end_tx_num: end,
                    from_db: true,
                    kind: SourceKind::Db { cursor },
                });
            }
        }

        for f in self.files.iter() {
            let Some(bt) = &f.src.btree else { continue };
            if bt.is_empty() {
                continue;
            }
            if let Some(cursor) = bt.seek(prefix)? {
                if cursor.key().starts_with(prefix) {
                    heap.push(PrefixSource {
                        key: cursor.key().to_vec(),
                        value: cursor.value().to_vec(),
                        end_tx_num: f.end_tx_num,
                        from_db: false,
                        kind: SourceKind::File { cursor },
                    });
                }
            }
        }

        Ok(PrefixIter {
            heap,
            prefix: prefix.to_vec(),
            vals_table: &self.vals_table,
            aggregation_step: self.aggregation_step,
            tx,
        })
    }
}

enum SourceKind<'a> {
    Db { cursor: Box<dyn DupCursor + 'a> },
    File { cursor: btree::BtCursor<'a> },
}

struct PrefixSource<'a> {
    key: Vec<u8>,
    value: Vec<u8>,
    end_tx_num: u64,
    from_db: bool,
    kind: SourceKind<'a>,
}

impl PartialEq for PrefixSource<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.end_tx_num == other.end_tx_num && self.from_db == other.from_db
    }
}
impl Eq for PrefixSource<'_> {}
impl PartialOrd for PrefixSource<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PrefixSource<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: smallest key first; among equal keys the newest
        // endTxNum wins, the KV store breaking ties.
        use std::cmp::Reverse;
        Reverse(&self.key)
            .cmp(&Reverse(&other.key))
            .then_with(|| self.end_tx_num.cmp(&other.end_tx_num))
            .then_with(|| self.from_db.cmp(&other.from_db))
    }
}

/// Ordered latest-wins iterator over a key prefix.
pub struct PrefixIter<'a> {
    heap: BinaryHeap<PrefixSource<'a>>,
    prefix: Vec<u8>,
    vals_table: &'a str,
    aggregation_step: u64,
    tx: &'a dyn Tx,
}

impl PrefixIter<'_> {
    fn advance(&mut self, source: &mut PrefixSource<'_>) -> Result<bool, Error> {
        match &mut source.kind {
            SourceKind::Db { cursor } => {
                let Some((key, inv)) = cursor.next_no_dup()? else {
                    return Ok(false);
                };
                if !key.starts_with(&self.prefix) {
                    return Ok(false);
                }
                source.value = self
                    .tx
                    .get_one(self.vals_table, &composite(&key, &inv))?
                    .unwrap_or_default();
                source.end_tx_num = (step_of_inverted(&inv) + 1) * self.aggregation_step;
                source.key = key;
                Ok(true)
            }
            SourceKind::File { cursor } => {
                if !cursor.next()? {
                    return Ok(false);
                }
                if !cursor.key().starts_with(&self.prefix) {
                    return Ok(false);
                }
                source.key = cursor.key().to_vec();
                source.value = cursor.value().to_vec();
                Ok(true)
            }
        }
    }
}

impl Iterator for PrefixIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top_key = self.heap.peek()?.key.clone();
            let mut winner: Option<Vec<u8>> = None;
            while self.heap.peek().is_some_and(|s| s.key == top_key) {
                let mut source = self.heap.pop().expect("peeked");
                if winner.is_none() {
                    winner = Some(std::mem::take(&mut source.value));
                }
                match self.advance(&mut source) {
                    Ok(true) => self.heap.push(source),
                    Ok(false) => {}
                    Err(e) => return Some(Err(e)),
                }
            }
            let value = winner.expect("at least the top source");
            if !value.is_empty() {
                return Some(Ok((top_key, value)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;
    use std::io::Read;

    fn setup_named(dir: &Path, base: &str) -> (MemKv, Domain) {
        let kv = MemKv::new();
        let tables = DomainTables::new(base);
        for (name, dup) in tables.all() {
            kv.create_table(name, dup);
        }
        let mut d = Domain::new(dir, dir, 4, base, tables, false);
        d.start_writes(wal::Mode::Buffered);
        (kv, d)
    }

    fn setup(dir: &Path) -> (MemKv, Domain) {
        setup_named(dir, "accounts")
    }

    fn put(d: &mut Domain, tx: &dyn RwTx, tx_num: u64, key: &[u8], value: &[u8]) {
        d.set_tx_num(tx_num);
        let ctx = d.make_context();
        d.put(tx, &ctx, key, value).unwrap();
        drop(ctx);
        d.rotate_wal().flush(tx).unwrap();
        d.start_writes(wal::Mode::Buffered);
    }

    fn delete(d: &mut Domain, tx: &dyn RwTx, tx_num: u64, key: &[u8]) {
        d.set_tx_num(tx_num);
        let ctx = d.make_context();
        d.delete(tx, &ctx, key).unwrap();
        drop(ctx);
        d.rotate_wal().flush(tx).unwrap();
        d.start_writes(wal::Mode::Buffered);
    }

    fn aggregate_step(d: &Domain, tx: &dyn RwTx, step: u64) {
        let cancel = CancelToken::new();
        let (from, to) = (step * 4, (step + 1) * 4);
        let collation = d.collate_stream(tx, step, from, to, &cancel).unwrap();
        let sf = d.build_files(step, collation, &cancel).unwrap();
        d.integrate_files(sf);
        d.prune(tx, step, from, to, u64::MAX, &cancel).unwrap();
    }

    #[test]
    fn read_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut d) = setup(dir.path());
        let tx = kv.begin_rw();

        put(&mut d, &tx, 0, b"k", b"v0");
        let ctx = d.make_context();
        assert_eq!(ctx.get(b"k", 0, &tx).unwrap().unwrap(), b"v0");
        drop(ctx);

        put(&mut d, &tx, 2, b"k", b"v1");
        let ctx = d.make_context();
        assert_eq!(ctx.get(b"k", 2, &tx).unwrap().unwrap(), b"v1");
        assert!(ctx.get(b"missing", 2, &tx).unwrap().is_none());
    }

    #[test]
    fn first_step_freezes_first_value() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut d) = setup(dir.path());
        let tx = kv.begin_rw();

        // Two writes in different steps; freezing step 0 must capture the
        // first value even though a newer marker exists.
        put(&mut d, &tx, 0, b"A", b"one");
        put(&mut d, &tx, 5, b"A", b"two");
        aggregate_step(&d, &tx, 0);

        assert!(dir.path().join("accounts.0-1.kv").exists());
        let seg = SegReader::open(dir.path().join("accounts.0-1.kv")).unwrap();
        let mut g = seg.getter();
        assert_eq!(g.next_word().unwrap(), b"A");
        assert_eq!(g.next_word().unwrap(), b"one");

        let ctx = d.make_context();
        assert_eq!(ctx.get(b"A", 6, &tx).unwrap().unwrap(), b"two");
        assert_eq!(ctx.get_before_tx_num(b"A", 5, &tx).unwrap().unwrap(), b"one");
    }

    #[test]
    fn serial_and_streamed_collation_are_byte_identical() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let mut outputs = Vec::new();
        for (dir, streamed) in [(&dir_a, false), (&dir_b, true)] {
            let (kv, mut d) = setup(dir.path());
            let tx = kv.begin_rw();
            for i in 0..40u64 {
                put(&mut d, &tx, i % 4, format!("key{:03}", i * 7 % 50).as_bytes(), &i.to_be_bytes());
            }
            let collation = if streamed {
                d.collate_stream(&tx, 0, 0, 4, &cancel).unwrap()
            } else {
                d.collate(&tx, 0, 0, 4, &cancel).unwrap()
            };
            let sf = d.build_files(0, collation, &cancel).unwrap();
            d.integrate_files(sf);
            let mut bytes = Vec::new();
            std::fs::File::open(dir.path().join("accounts.0-1.kv"))
                .unwrap()
                .read_to_end(&mut bytes)
                .unwrap();
            outputs.push(bytes);
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn reads_unchanged_after_prune() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut d) = setup(dir.path());
        let tx = kv.begin_rw();

        put(&mut d, &tx, 1, b"a", b"v-a");
        put(&mut d, &tx, 2, b"b", b"v-b");
        put(&mut d, &tx, 5, b"a", b"v-a2");

        let before: Vec<_> = {
            let ctx = d.make_context();
            vec![
                ctx.get(b"a", 6, &tx).unwrap(),
                ctx.get(b"b", 6, &tx).unwrap(),
                ctx.get_before_tx_num(b"a", 5, &tx).unwrap(),
                ctx.get_before_tx_num(b"a", 1, &tx).unwrap(),
            ]
        };
        aggregate_step(&d, &tx, 0);
        let after: Vec<_> = {
            let ctx = d.make_context();
            vec![
                ctx.get(b"a", 6, &tx).unwrap(),
                ctx.get(b"b", 6, &tx).unwrap(),
                ctx.get_before_tx_num(b"a", 5, &tx).unwrap(),
                ctx.get_before_tx_num(b"a", 1, &tx).unwrap(),
            ]
        };
        assert_eq!(before, after);
        // Pruning again converges to the same state.
        let cancel = CancelToken::new();
        d.prune(&tx, 0, 0, 4, u64::MAX, &cancel).unwrap();
        let ctx = d.make_context();
        assert_eq!(ctx.get(b"a", 6, &tx).unwrap(), before[0]);
    }

    #[test]
    fn historical_reads_across_steps() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut d) = setup(dir.path());
        let tx = kv.begin_rw();

        // Single key rewritten every even txNum across 4 steps.
        for t in (0..16u64).step_by(2) {
            put(&mut d, &tx, t, b"K", format!("v{t}").as_bytes());
        }
        for step in 0..3 {
            aggregate_step(&d, &tx, step);
        }

        let ctx = d.make_context();
        for t in (2..16u64).step_by(2) {
            let got = ctx.get_before_tx_num(b"K", t, &tx).unwrap().unwrap();
            assert_eq!(got, format!("v{}", t - 2).as_bytes(), "before {t}");
        }
        assert!(ctx.get_before_tx_num(b"K", 0, &tx).unwrap().is_none());
    }

    #[test]
    fn delete_is_noop_for_missing_and_masks_files() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut d) = setup(dir.path());
        let tx = kv.begin_rw();

        delete(&mut d, &tx, 0, b"ghost");
        let ctx = d.make_context();
        assert!(ctx.get(b"ghost", 0, &tx).unwrap().is_none());
        drop(ctx);

        put(&mut d, &tx, 1, b"k", b"v");
        aggregate_step(&d, &tx, 0);
        delete(&mut d, &tx, 5, b"k");

        let ctx = d.make_context();
        assert!(ctx.get(b"k", 5, &tx).unwrap().is_none());
        // But the historical value is still there.
        assert_eq!(ctx.get_before_tx_num(b"k", 5, &tx).unwrap().unwrap(), b"v");
    }

    #[test]
    fn prefix_iteration_latest_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut d) = setup_named(dir.path(), "storage");
        let tx = kv.begin_rw();

        // 100 slots under one address, written across three steps, a few
        // rewritten later.
        for i in 0..100u64 {
            let t = i % 12; // steps 0..3
            let mut key = b"addr1".to_vec();
            key.extend_from_slice(&i.to_be_bytes());
            put(&mut d, &tx, t, &key, format!("v{i}").as_bytes());
        }
        for step in 0..2 {
            aggregate_step(&d, &tx, step);
        }
        // Rewrites land in the KV layer on top of the files.
        let mut key42 = b"addr1".to_vec();
        key42.extend_from_slice(&42u64.to_be_bytes());
        put(&mut d, &tx, 13, &key42, b"fresh");

        // An unrelated prefix must not leak in.
        put(&mut d, &tx, 13, b"addr2-other", b"zzz");

        let ctx = d.make_context();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = ctx
            .iterate_prefix(b"addr1", &tx)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 100);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        for (key, value) in &entries {
            let i = u64::from_be_bytes(key[5..].try_into().unwrap());
            if i == 42 {
                assert_eq!(value, b"fresh");
            } else {
                assert_eq!(value, format!("v{i}").as_bytes());
            }
        }
    }

    #[test]
    fn merge_preserves_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut d) = setup(dir.path());
        let tx = kv.begin_rw();

        put(&mut d, &tx, 0, b"x", b"x0");
        put(&mut d, &tx, 5, b"x", b"x1");
        put(&mut d, &tx, 6, b"y", b"y0");
        for step in 0..2 {
            aggregate_step(&d, &tx, step);
        }

        let probe = |d: &Domain| {
            let ctx = d.make_context();
            (
                ctx.get(b"x", 10, &tx).unwrap(),
                ctx.get(b"y", 10, &tx).unwrap(),
                ctx.get_before_tx_num(b"x", 5, &tx).unwrap(),
                ctx.get_before_tx_num(b"y", 6, &tx).unwrap(),
            )
        };
        let before = probe(&d);

        let cancel = CancelToken::new();
        let ranges = d.find_merge_range(8, 32 * 4);
        assert_eq!(ranges.values, Some((0, 8)));
        let ctx = d.make_context();
        let value_inputs = d.value_files_in_range(&ctx, 0, 8);
        let merged = d.merge_value_files(&value_inputs, 0, 8, &cancel).unwrap();
        d.integrate_merged_value_files(&value_inputs, merged);
        let ef_inputs = d.history.index_files_in_range(&ctx.hc, 0, 8);
        let v_inputs = d.history.value_files_in_range(&ctx.hc, 0, 8);
        let (ef_item, v_item) = d
            .history
            .merge_files(&ef_inputs, &v_inputs, 0, 8, &cancel)
            .unwrap();
        d.history
            .integrate_merged_files(&ef_inputs, &v_inputs, ef_item, v_item);
        drop(ctx);

        assert_eq!(probe(&d), before);
        assert!(dir.path().join("accounts.0-2.kv").exists());
        assert!(!dir.path().join("accounts.0-1.kv").exists());
    }
}
