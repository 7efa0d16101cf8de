//! Append-only per-key posting lists of txNums.
//!
//! Recent posts live in two dup-sorted KV tables: `keys` (txNum -> key,
//! the replay order) and `idx` (key -> txNum, the query order). On each
//! step boundary the posts of the closed step are collated into a `.ef`
//! file (key word followed by its Elias–Fano packed txNum list, keys
//! sorted) with a `.efi` hash index, after which the KV-resident copy is
//! pruned.
//!
//! Query iterators union the frozen files with the recent table lazily,
//! in ascending txNum order with duplicates collapsed, so they compose
//! with other iterators without callbacks.

use crate::{
    eliasfano::{self, EliasFano},
    files::{self, FileItem, FileRegistry, FileSpec},
    index::{self, hash::HashIndexBuilder},
    kv::{self, IndexTables, RwTx, Tx},
    seg::{SegReader, SegWriter},
    wal, CancelToken,
};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
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
    Index(#[from] index::Error),
    #[error("file error: {0}")]
    Files(#[from] files::Error),
    #[error("wal error: {0}")]
    Wal(#[from] wal::Error),
    #[error("posting list error: {0}")]
    Posting(#[from] eliasfano::Error),
    #[error("writes not started")]
    WritesNotStarted,
    #[error("operation cancelled")]
    Cancelled,
}

fn check_cancel(cancel: &CancelToken, i: usize) -> Result<(), Error> {
    if i % CANCEL_POLL == 0 && cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Posting lists for one named index.
pub struct InvertedIndex {
    spec: FileSpec,
    files: FileRegistry,
    tables: IndexTables,
    aggregation_step: u64,
    tmpdir: PathBuf,
    tx_num_bytes: [u8; 8],
    wal: Option<IndexWal>,
    wal_mode: wal::Mode,
}

/// Buffered writes for one index, rotated out at flush time.
pub struct IndexWal {
    keys: wal::Collector,
    idx: wal::Collector,
}

impl IndexWal {
    fn new(tables: &IndexTables, tmpdir: &Path, mode: wal::Mode) -> Self {
        Self {
            keys: wal::Collector::new(&tables.keys, tmpdir, mode),
            idx: wal::Collector::new(&tables.idx, tmpdir, mode),
        }
    }

    pub fn flush(mut self, tx: &dyn RwTx) -> Result<(), wal::Error> {
        self.keys.load(tx)?;
        self.idx.load(tx)
    }
}

impl InvertedIndex {
    pub fn new(
        dir: impl AsRef<Path>,
        tmpdir: impl AsRef<Path>,
        aggregation_step: u64,
        filename_base: &str,
        tables: IndexTables,
        integrity_exts: Vec<&'static str>,
    ) -> Self {
        Self {
            spec: FileSpec {
                dir: dir.as_ref().to_path_buf(),
                base: filename_base.to_string(),
                aggregation_step,
                data_ext: "ef",
                index_ext: "efi",
                btree_ext: None,
                integrity_exts,
            },
            files: FileRegistry::new(),
            tables,
            aggregation_step,
            tmpdir: tmpdir.as_ref().to_path_buf(),
            tx_num_bytes: [0; 8],
            wal: None,
            wal_mode: wal::Mode::Buffered,
        }
    }

    pub fn filename_base(&self) -> &str {
        &self.spec.base
    }

    pub fn tables(&self) -> &IndexTables {
        &self.tables
    }

    /// Open every usable `.ef`/`.efi` pair found in the data directory.
    pub fn open_folder(&self) -> Result<(), Error> {
        self.spec.scan_and_open(&self.files)?;
        Ok(())
    }

    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num_bytes = tx_num.to_be_bytes();
    }

    pub fn start_writes(&mut self, mode: wal::Mode) {
        self.wal_mode = mode;
        self.wal = Some(IndexWal::new(&self.tables, &self.tmpdir, mode));
    }

    pub fn finish_writes(&mut self) {
        self.wal = None;
    }

    /// Swap in a fresh write buffer and hand back the filled one.
    pub fn rotate_wal(&mut self) -> Option<IndexWal> {
        let next = IndexWal::new(&self.tables, &self.tmpdir, self.wal_mode);
        self.wal.replace(next)
    }

    /// Post the current txNum for `key`.
    pub fn add(&mut self, key: &[u8]) -> Result<(), Error> {
        let tx_num_bytes = self.tx_num_bytes;
        let wal = self.wal.as_mut().ok_or(Error::WritesNotStarted)?;
        wal.keys.collect(&tx_num_bytes, key)?;
        wal.idx.collect(key, &tx_num_bytes)?;
        Ok(())
    }

    /// Group the posts of `[tx_from, tx_to)` by key, txNums ascending and
    /// deduplicated.
    pub fn collate(
        &self,
        tx: &dyn Tx,
        tx_from: u64,
        tx_to: u64,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<Vec<u8>, Vec<u64>>, Error> {
        let mut out: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
        let mut cursor = tx.cursor_dup_sort(&self.tables.keys)?;
        let mut at = cursor.seek(&tx_from.to_be_bytes())?;
        let mut i = 0usize;
        while let Some((k, key)) = at {
            check_cancel(cancel, i)?;
            i += 1;
            let tx_num = u64::from_be_bytes(k.as_slice().try_into().expect("txNum key"));
            if tx_num >= tx_to {
                break;
            }
            let list = out.entry(key).or_default();
            if list.last() != Some(&tx_num) {
                list.push(tx_num);
            }
            at = cursor.next()?;
        }
        for list in out.values_mut() {
            list.sort_unstable();
            list.dedup();
        }
        Ok(out)
    }

    /// Freeze one collated step into a `.ef` + `.efi` pair. An empty
    /// collation still produces an (empty) file so every aggregated step
    /// is uniformly covered.
    pub fn build_files(
        &self,
        step: u64,
        collation: &BTreeMap<Vec<u8>, Vec<u64>>,
        cancel: &CancelToken,
    ) -> Result<FileItem, Error> {
        let entries = collation
            .iter()
            .map(|(k, v)| (k.as_slice(), eliasfano::encode(v)));
        self.build_posting_file(step, step + 1, entries, cancel)
    }

    fn build_posting_file<'k>(
        &self,
        from_step: u64,
        to_step: u64,
        entries: impl Iterator<Item = (&'k [u8], Vec<u8>)>,
        cancel: &CancelToken,
    ) -> Result<FileItem, Error> {
        let data_path = self.spec.data_path(from_step, to_step);
        let idx_path = self.spec.index_path(from_step, to_step);
        let result = self.write_posting_file(&data_path, &idx_path, entries, cancel);
        if result.is_err() {
            let _ = std::fs::remove_file(&data_path);
            let _ = std::fs::remove_file(&idx_path);
        }
        result.map(|(data, index)| {
            FileItem::new(
                from_step * self.aggregation_step,
                to_step * self.aggregation_step,
                self.aggregation_step,
                data,
                Some(index),
                None,
            )
        })
    }

    fn write_posting_file<'k>(
        &self,
        data_path: &Path,
        idx_path: &Path,
        entries: impl Iterator<Item = (&'k [u8], Vec<u8>)>,
        cancel: &CancelToken,
    ) -> Result<(Arc<SegReader>, index::hash::HashIndex), Error> {
        let mut writer = SegWriter::create(data_path, None)?;
        for (i, (key, ef_bytes)) in entries.enumerate() {
            check_cancel(cancel, i)?;
            writer.add_uncompressed_word(key)?;
            writer.add_uncompressed_word(&ef_bytes)?;
        }
        writer.finish()?;

        let data = Arc::new(SegReader::open(data_path)?);
        let mut builder = HashIndexBuilder::new(idx_path);
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
        debug!(
            base = %self.spec.base,
            file = %data_path.display(),
            keys = index.key_count(),
            "built posting file"
        );
        Ok((data, index))
    }

    pub fn integrate_files(&self, item: FileItem) {
        self.files.insert(Arc::new(item));
    }

    /// Delete the KV-resident posts of `[tx_from, tx_to)`: first the
    /// replay-order table (collecting the victim keys), then the per-key
    /// postings. Idempotent and resumable.
    pub fn prune(
        &self,
        tx: &dyn RwTx,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let mut keys_cursor = tx.rw_cursor_dup_sort(&self.tables.keys)?;
        let Some((first, _)) = keys_cursor.seek(&tx_from.to_be_bytes())? else {
            return Ok(());
        };
        let first_tx = u64::from_be_bytes(first.as_slice().try_into().expect("txNum key"));
        let tx_to = if limit != u64::MAX && limit != 0 {
            tx_to.min(first_tx.saturating_add(limit))
        } else {
            tx_to
        };
        if first_tx >= tx_to {
            return Ok(());
        }

        let mut victims: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut at = keys_cursor.seek(&tx_from.to_be_bytes())?;
        let mut i = 0usize;
        while let Some((k, key)) = at {
            check_cancel(cancel, i)?;
            i += 1;
            let tx_num = u64::from_be_bytes(k.as_slice().try_into().expect("txNum key"));
            if tx_num >= tx_to {
                break;
            }
            victims.insert(key);
            let mut dup = keys_cursor.next_dup()?;
            while let Some((_, key)) = dup {
                victims.insert(key);
                dup = keys_cursor.next_dup()?;
            }
            // Whole txNum groups are pruned at once, so dropping the
            // duplicates wholesale is safe.
            keys_cursor.delete_current_duplicates()?;
            at = keys_cursor.seek(&tx_from.to_be_bytes())?;
        }
        drop(keys_cursor);

        let mut idx_cursor = tx.rw_cursor_dup_sort(&self.tables.idx)?;
        for (i, key) in victims.iter().enumerate() {
            check_cancel(cancel, i)?;
            let mut at = idx_cursor.seek_both_range(key, &tx_from.to_be_bytes())?;
            while let Some(v) = at {
                let tx_num = u64::from_be_bytes(v.as_slice().try_into().expect("txNum value"));
                if tx_num >= tx_to {
                    break;
                }
                idx_cursor.delete_current()?;
                at = idx_cursor
                    .seek_both_range(key, &tx_from.to_be_bytes())?;
            }
        }
        Ok(())
    }

    pub fn end_tx_num_max(&self) -> u64 {
        self.files.end_tx_num_max()
    }

    /// Largest aligned power-of-two window (up to `max_span`) fully tiled
    /// by at least two smaller files ending at or before `max_end`.
    pub fn find_merge_range(&self, max_end: u64, max_span: u64) -> Option<(u64, u64)> {
        find_merge_range(&self.files, self.aggregation_step, max_end, max_span)
    }

    /// Input files of the pinned context lying inside `[from_tx, to_tx)`.
    pub fn files_in_range(
        &self,
        ctx: &IndexContext,
        from_tx: u64,
        to_tx: u64,
    ) -> Vec<Arc<FileItem>> {
        ctx.files
            .iter()
            .filter(|f| f.start_tx_num >= from_tx && f.end_tx_num <= to_tx)
            .map(|f| f.src.clone())
            .collect()
    }

    /// Streaming k-way merge of `inputs` into one posting file spanning
    /// `[from_tx, to_tx)`. Per-key lists are concatenated preserving
    /// ascending txNum.
    pub fn merge_files(
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

        let result = (|| {
            let mut writer = SegWriter::create(&data_path, None)?;
            let mut heap = BinaryHeap::new();
            for (i, input) in inputs.iter().enumerate() {
                let mut getter = input.data.getter();
                if getter.has_next() {
                    let key = getter.next_word()?;
                    let ef = getter.next_word()?;
                    heap.push(MergeSource {
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
                let mut merged: Vec<u64> =
                    EliasFano::from_bytes(&top.ef)?.iter().collect();
                push_next(&mut heap, top)?;
                while heap.peek().is_some_and(|s| s.key == key) {
                    let source = heap.pop().expect("peeked");
                    merged.extend(EliasFano::from_bytes(&source.ef)?.iter());
                    push_next(&mut heap, source)?;
                }
                merged.sort_unstable();
                merged.dedup();
                writer.add_uncompressed_word(&key)?;
                writer.add_uncompressed_word(&eliasfano::encode(&merged))?;
            }
            writer.finish()?;

            let data = Arc::new(SegReader::open(&data_path)?);
            let mut builder = HashIndexBuilder::new(&idx_path);
            let mut getter = data.getter();
            while getter.has_next() {
                let offset = getter.word_offset();
                let key = getter.next_word()?;
                builder.add_key(&key, offset);
                getter.skip_word()?;
            }
            let index = builder.build()?;
            info!(
                base = %self.spec.base,
                from_step, to_step,
                inputs = inputs.len(),
                "merged posting files"
            );
            Ok(FileItem::new(
                from_tx,
                to_tx,
                self.aggregation_step,
                data,
                Some(index),
                None,
            ))
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&data_path);
            let _ = std::fs::remove_file(&idx_path);
        }
        result
    }

    /// Install the merge output and retire its inputs; files disappear
    /// once the last reader context releases them.
    pub fn integrate_merged_files(&self, inputs: &[Arc<FileItem>], merged: FileItem) {
        let merged = Arc::new(merged);
        self.files.insert(merged.clone());
        for input in inputs {
            self.files.retire(input);
        }
        if merged.frozen {
            self.files.retire_subsets_of(&merged);
        }
    }

    pub fn make_context(&self) -> IndexContext {
        IndexContext::new(self)
    }

    /// Close the registry view. Underlying files stay on disk.
    pub fn close(&mut self) {
        self.wal = None;
    }
}

pub(crate) fn find_merge_range(
    files: &FileRegistry,
    step: u64,
    max_end: u64,
    max_span: u64,
) -> Option<(u64, u64)> {
    let items: Vec<(u64, u64)> = files
        .ro_files()
        .iter()
        .filter(|f| f.end_tx_num <= max_end && f.end_tx_num - f.start_tx_num < max_span)
        .map(|f| (f.start_tx_num, f.end_tx_num))
        .collect();
    if items.len() < 2 {
        return None;
    }
    let mut span = max_span;
    while span > step {
        for &(start, _) in &items {
            if start % span != 0 {
                continue;
            }
            let window = (start, start + span);
            // The window must be tiled edge to edge by smaller files.
            let mut cursor = window.0;
            let mut pieces = 0;
            for &(s, e) in &items {
                if s == cursor && e <= window.1 {
                    cursor = e;
                    pieces += 1;
                }
            }
            if cursor == window.1 && pieces >= 2 {
                return Some(window);
            }
        }
        span /= 2;
    }
    None
}

struct MergeSource<'a> {
    key: Vec<u8>,
    ef: Vec<u8>,
    input: usize,
    getter: crate::seg::Getter<'a>,
}

impl PartialEq for MergeSource<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.input == other.input
    }
}
impl Eq for MergeSource<'_> {}
impl PartialOrd for MergeSource<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MergeSource<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert for smallest-key-first.
        Reverse(&self.key)
            .cmp(&Reverse(&other.key))
            .then_with(|| Reverse(self.input).cmp(&Reverse(other.input)))
    }
}

fn push_next<'a>(
    heap: &mut BinaryHeap<MergeSource<'a>>,
    mut source: MergeSource<'a>,
) -> Result<(), Error> {
    if source.getter.has_next() {
        source.key = source.getter.next_word()?;
        source.ef = source.getter.next_word()?;
        heap.push(source);
    }
    Ok(())
}

/// Pinned snapshot of an index's files; reads through it stay consistent
/// while merges land concurrently.
pub struct IndexContext {
    pub(crate) files: Arc<Vec<files::CtxFile>>,
    idx_table: String,
}

impl IndexContext {
    fn new(ii: &InvertedIndex) -> Self {
        let files = ii.files.ro_files();
        for f in files.iter() {
            f.src.pin();
        }
        Self {
            files,
            idx_table: ii.tables.idx.clone(),
        }
    }

    /// Ascending txNums posted for `key` within `[from_tx, to_tx)`,
    /// unioned across frozen files and the recent table, duplicates
    /// collapsed.
    pub fn iterate_range(
        &self,
        key: &[u8],
        from_tx: u64,
        to_tx: u64,
        limit: Option<usize>,
        tx: &dyn Tx,
    ) -> Result<PostingIter, Error> {
        let files: Vec<Arc<FileItem>> = self
            .files
            .iter()
            .filter(|f| f.start_tx_num < to_tx && f.end_tx_num > from_tx)
            .map(|f| f.src.clone())
            .collect();

        // When the frozen files already cover the whole range the table
        // scan is pure overhead.
        let frozen_to = self.files.last().map_or(0, |f| f.end_tx_num);
        let recent = if frozen_to >= to_tx {
            Vec::new()
        } else {
            tx.dup_range(
                &self.idx_table,
                key,
                Some(&from_tx.to_be_bytes()),
                Some(&to_tx.to_be_bytes()),
                true,
                None,
            )?
            .into_iter()
            .map(|v| u64::from_be_bytes(v.as_slice().try_into().expect("txNum value")))
            .collect()
        };

        Ok(PostingIter {
            key: key.to_vec(),
            from_tx,
            to_tx,
            files,
            next_file: 0,
            current: Vec::new().into_iter(),
            frozen_head: None,
            recent: recent.into_iter().peekable(),
            last: None,
            remaining: limit,
            failed: false,
        })
    }
}

impl Drop for IndexContext {
    fn drop(&mut self) {
        for f in self.files.iter() {
            f.src.unpin();
        }
    }
}

/// Lazy ascending union over frozen posting files and the recent table.
pub struct PostingIter {
    key: Vec<u8>,
    from_tx: u64,
    to_tx: u64,
    files: Vec<Arc<FileItem>>,
    next_file: usize,
    current: std::vec::IntoIter<u64>,
    frozen_head: Option<u64>,
    recent: std::iter::Peekable<std::vec::IntoIter<u64>>,
    last: Option<u64>,
    remaining: Option<usize>,
    failed: bool,
}

impl PostingIter {
    fn advance_frozen(&mut self) -> Result<Option<u64>, Error> {
        loop {
            if let Some(v) = self.current.next() {
                return Ok(Some(v));
            }
            let Some(file) = self.files.get(self.next_file) else {
                return Ok(None);
            };
            let file = file.clone();
            self.next_file += 1;
            let Some(index) = &file.index else { continue };
            let Some(offset) = index.lookup(&self.key) else {
                continue;
            };
            let mut getter = file.data.getter();
            getter.reset(offset);
            let stored_key = getter.next_word()?;
            if stored_key != self.key {
                continue;
            }
            let ef = EliasFano::from_bytes(&getter.next_word()?)?;
            let values: Vec<u64> = ef
                .iter_from(self.from_tx)
                .take_while(|&v| v < self.to_tx)
                .collect();
            self.current = values.into_iter();
        }
    }
}

impl Iterator for PostingIter {
    type Item = Result<u64, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == Some(0) {
            return None;
        }
        loop {
            if self.frozen_head.is_none() {
                match self.advance_frozen() {
                    Ok(head) => self.frozen_head = head,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }
            let candidate = match (self.frozen_head, self.recent.peek().copied()) {
                (None, None) => return None,
                (Some(f), None) => {
                    self.frozen_head = None;
                    f
                }
                (None, Some(r)) => {
                    self.recent.next();
                    r
                }
                (Some(f), Some(r)) => {
                    if f <= r {
                        self.frozen_head = None;
                        if f == r {
                            self.recent.next();
                        }
                        f
                    } else {
                        self.recent.next();
                        r
                    }
                }
            };
            if self.last == Some(candidate) {
                continue;
            }
            self.last = Some(candidate);
            if let Some(n) = &mut self.remaining {
                *n -= 1;
            }
            return Some(Ok(candidate));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;

    fn setup(dir: &Path) -> (MemKv, InvertedIndex) {
        let kv = MemKv::new();
        let tables = IndexTables::new("testidx");
        for (name, dup) in tables.all() {
            kv.create_table(name, dup);
        }
        let mut ii = InvertedIndex::new(dir, dir, 4, "testidx", tables, Vec::new());
        ii.start_writes(wal::Mode::Buffered);
        (kv, ii)
    }

    fn post(ii: &mut InvertedIndex, tx: &dyn RwTx, tx_num: u64, key: &[u8]) {
        ii.set_tx_num(tx_num);
        ii.add(key).unwrap();
        ii.rotate_wal().unwrap().flush(tx).unwrap();
        ii.start_writes(wal::Mode::Buffered);
    }

    fn collect(iter: PostingIter) -> Vec<u64> {
        iter.collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn collate_groups_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut ii) = setup(dir.path());
        let tx = kv.begin_rw();

        for (tx_num, key) in [(0u64, b"a"), (1, b"b"), (1, b"a"), (3, b"a"), (5, b"a")] {
            post(&mut ii, &tx, tx_num, key);
        }
        let cancel = CancelToken::new();
        let collation = ii.collate(&tx, 0, 4, &cancel).unwrap();
        assert_eq!(collation.len(), 2);
        assert_eq!(collation[b"a".as_slice()], vec![0, 1, 3]);
        assert_eq!(collation[b"b".as_slice()], vec![1]);
    }

    #[test]
    fn build_prune_and_iterate() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut ii) = setup(dir.path());
        let tx = kv.begin_rw();
        let cancel = CancelToken::new();

        // Posts in step 0 plus one recent post in step 1.
        for tx_num in [0u64, 2, 3] {
            post(&mut ii, &tx, tx_num, b"addr");
        }
        post(&mut ii, &tx, 5, b"addr");

        let collation = ii.collate(&tx, 0, 4, &cancel).unwrap();
        let item = ii.build_files(0, &collation, &cancel).unwrap();
        assert!(dir.path().join("testidx.0-1.ef").exists());
        assert!(dir.path().join("testidx.0-1.efi").exists());
        ii.integrate_files(item);
        ii.prune(&tx, 0, 4, u64::MAX, &cancel).unwrap();

        // The pruned range only survives in the file.
        assert!(tx
            .dup_range(&ii.tables.idx, b"addr", None, Some(&4u64.to_be_bytes()), true, None)
            .unwrap()
            .is_empty());

        let ctx = ii.make_context();
        let values = collect(ctx.iterate_range(b"addr", 0, 50, None, &tx).unwrap());
        assert_eq!(values, vec![0, 2, 3, 5]);

        // Sub-ranges and limits.
        let values = collect(ctx.iterate_range(b"addr", 2, 5, None, &tx).unwrap());
        assert_eq!(values, vec![2, 3]);
        let values = collect(ctx.iterate_range(b"addr", 0, 50, Some(2), &tx).unwrap());
        assert_eq!(values, vec![0, 2]);
    }

    #[test]
    fn duplicate_posts_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut ii) = setup(dir.path());
        let tx = kv.begin_rw();
        let cancel = CancelToken::new();

        for tx_num in [3u64, 17, 17, 42] {
            post(&mut ii, &tx, tx_num, b"x");
        }
        // Freeze steps 0..11 in one go via per-step collations.
        for step in 0..11 {
            let collation = ii.collate(&tx, step * 4, (step + 1) * 4, &cancel).unwrap();
            let item = ii.build_files(step, &collation, &cancel).unwrap();
            ii.integrate_files(item);
            ii.prune(&tx, step * 4, (step + 1) * 4, u64::MAX, &cancel).unwrap();
        }

        let ctx = ii.make_context();
        let values = collect(ctx.iterate_range(b"x", 0, 50, None, &tx).unwrap());
        assert_eq!(values, vec![3, 17, 42]);
    }

    #[test]
    fn merge_adjacent_files() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut ii) = setup(dir.path());
        let tx = kv.begin_rw();
        let cancel = CancelToken::new();

        for step in 0..2u64 {
            for offset in 0..4u64 {
                post(&mut ii, &tx, step * 4 + offset, b"k");
            }
            let collation = ii.collate(&tx, step * 4, (step + 1) * 4, &cancel).unwrap();
            let item = ii.build_files(step, &collation, &cancel).unwrap();
            ii.integrate_files(item);
            ii.prune(&tx, step * 4, (step + 1) * 4, u64::MAX, &cancel).unwrap();
        }

        let (from, to) = ii.find_merge_range(8, 32 * 4).unwrap();
        assert_eq!((from, to), (0, 8));

        let ctx = ii.make_context();
        let inputs = ii.files_in_range(&ctx, from, to);
        assert_eq!(inputs.len(), 2);
        let merged = ii.merge_files(&inputs, from, to, &cancel).unwrap();
        ii.integrate_merged_files(&inputs, merged);
        drop(ctx);

        // Inputs are gone from disk once the context released them.
        assert!(!dir.path().join("testidx.0-1.ef").exists());
        assert!(!dir.path().join("testidx.1-2.ef").exists());
        assert!(dir.path().join("testidx.0-2.ef").exists());

        let ctx = ii.make_context();
        let values = collect(ctx.iterate_range(b"k", 0, 100, None, &tx).unwrap());
        assert_eq!(values, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn find_merge_range_prefers_widest_window() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut ii) = setup(dir.path());
        let tx = kv.begin_rw();
        let cancel = CancelToken::new();

        for step in 0..8u64 {
            post(&mut ii, &tx, step * 4, b"k");
            let collation = ii.collate(&tx, step * 4, (step + 1) * 4, &cancel).unwrap();
            let item = ii.build_files(step, &collation, &cancel).unwrap();
            ii.integrate_files(item);
        }
        let range = ii.find_merge_range(8 * 4, 32 * 4).unwrap();
        assert_eq!(range, (0, 8 * 4));
    }

    #[test]
    fn cancellation_aborts_collation() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, mut ii) = setup(dir.path());
        let tx = kv.begin_rw();
        post(&mut ii, &tx, 0, b"a");

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            ii.collate(&tx, 0, 4, &cancel),
            Err(Error::Cancelled)
        ));
    }
}
