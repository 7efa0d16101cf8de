//! Immutable on-disk slices and the per-column registry that tracks them.
//!
//! A [`FileItem`] is one `[startTxNum, endTxNum)` slice: a data segment
//! plus its indices. Items spanning [`STEPS_IN_BIGGEST_FILE`] steps are
//! frozen — immutable forever and shared without reference counting.
//! Smaller items are immutable in content but may be superseded by a
//! merged file: they are pinned by reader contexts via an atomic refcount
//! and physically removed once the last pin drops after `can_delete` has
//! latched.
//!
//! The [`FileRegistry`] keeps items ordered by (endTxNum asc, startTxNum
//! desc) and maintains `ro_files`, a garbage-free projection (no
//! `can_delete` items, no shadowed subsets) that reader contexts snapshot
//! zero-copy.

use crate::{
    index::{btree::BtIndex, hash::HashIndex},
    seg::SegReader,
    STEPS_IN_BIGGEST_FILE,
};
use parking_lot::{Mutex, RwLock};
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment error: {0}")]
    Seg(#[from] crate::seg::Error),
    #[error("index error: {0}")]
    Index(#[from] crate::index::Error),
}

/// One immutable on-disk slice.
#[derive(Debug)]
pub struct FileItem {
    pub start_tx_num: u64,
    pub end_tx_num: u64,
    pub frozen: bool,
    refcount: AtomicU32,
    can_delete: AtomicBool,
    pub data: Arc<SegReader>,
    pub index: Option<HashIndex>,
    pub btree: Option<BtIndex>,
    paths: Vec<PathBuf>,
}

impl FileItem {
    pub fn new(
        start_tx_num: u64,
        end_tx_num: u64,
        aggregation_step: u64,
        data: Arc<SegReader>,
        index: Option<HashIndex>,
        btree: Option<BtIndex>,
    ) -> Self {
        assert!(
            start_tx_num < end_tx_num,
            "file item {start_tx_num}-{end_tx_num} has inverted bounds"
        );
        let mut paths = vec![data.path().to_path_buf()];
        if let Some(index) = &index {
            paths.push(index.path().to_path_buf());
        }
        if let Some(btree) = &btree {
            paths.push(btree.path().to_path_buf());
        }
        Self {
            start_tx_num,
            end_tx_num,
            frozen: (end_tx_num - start_tx_num) / aggregation_step == STEPS_IN_BIGGEST_FILE,
            refcount: AtomicU32::new(0),
            can_delete: AtomicBool::new(false),
            data,
            index,
            btree,
            paths,
        }
    }

    /// Strict containment: `self` lies inside `other` and differs from it.
    pub fn is_subset_of(&self, other: &FileItem) -> bool {
        other.start_tx_num <= self.start_tx_num
            && self.end_tx_num <= other.end_tx_num
            && (other.start_tx_num != self.start_tx_num || self.end_tx_num != other.end_tx_num)
    }

    pub fn can_delete(&self) -> bool {
        self.can_delete.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Pin for a reader context. Frozen items are shared freely.
    pub fn pin(&self) {
        if !self.frozen {
            self.refcount.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Release a reader pin; the last release of a retired item removes its
    /// files.
    pub fn unpin(&self) {
        if self.frozen {
            return;
        }
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "file item refcount underflow");
        if prev == 1 && self.can_delete() {
            self.remove_files();
        }
    }

    /// Latch `can_delete`. Frozen items are never retired.
    fn retire(&self) {
        assert!(!self.frozen, "attempted to retire a frozen file");
        self.can_delete.store(true, Ordering::Release);
        if self.refcount.load(Ordering::Acquire) == 0 {
            self.remove_files();
        }
    }

    fn remove_files(&self) {
        for path in &self.paths {
            if let Err(err) = std::fs::remove_file(path) {
                trace!(?path, %err, "failed to remove retired file");
            } else {
                trace!(?path, "removed retired file");
            }
        }
    }

    pub fn from_step(&self, aggregation_step: u64) -> u64 {
        self.start_tx_num / aggregation_step
    }

    pub fn to_step(&self, aggregation_step: u64) -> u64 {
        self.end_tx_num / aggregation_step
    }
}

/// Entry of the `ro_files` projection a reader context snapshots.
#[derive(Clone, Debug)]
pub struct CtxFile {
    pub start_tx_num: u64,
    pub end_tx_num: u64,
    pub src: Arc<FileItem>,
}

type ItemKey = (u64, Reverse<u64>);

fn key_of(item: &FileItem) -> ItemKey {
    (item.end_tx_num, Reverse(item.start_tx_num))
}

/// Concurrent ordered set of [`FileItem`]s for one column.
#[derive(Debug, Default)]
pub struct FileRegistry {
    items: Mutex<BTreeMap<ItemKey, Arc<FileItem>>>,
    ro: RwLock<Arc<Vec<CtxFile>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item: Arc<FileItem>) {
        {
            let mut items = self.items.lock();
            items.insert(key_of(&item), item);
        }
        self.recalc_ro_files();
    }

    pub fn contains(&self, start_tx_num: u64, end_tx_num: u64) -> bool {
        self.items
            .lock()
            .contains_key(&(end_tx_num, Reverse(start_tx_num)))
    }

    /// Snapshot of all items in registry order.
    pub fn walk(&self) -> Vec<Arc<FileItem>> {
        self.items.lock().values().cloned().collect()
    }

    /// Garbage-free projection shared with reader contexts.
    pub fn ro_files(&self) -> Arc<Vec<CtxFile>> {
        self.ro.read().clone()
    }

    /// Largest endTxNum covered by any item, 0 when empty.
    pub fn end_tx_num_max(&self) -> u64 {
        self.items
            .lock()
            .keys()
            .next_back()
            .map_or(0, |(end, _)| *end)
    }

    /// Remove `item` from the registry and latch it for deletion; the files
    /// go away once the last reader context unpins.
    pub fn retire(&self, item: &Arc<FileItem>) {
        {
            let mut items = self.items.lock();
            items.remove(&key_of(item));
        }
        self.recalc_ro_files();
        item.retire();
    }

    /// Retire every strict subset of `superset` (used after a frozen merge
    /// lands).
    pub fn retire_subsets_of(&self, superset: &FileItem) {
        let subsets: Vec<_> = {
            let items = self.items.lock();
            items
                .values()
                .filter(|item| item.is_subset_of(superset))
                .cloned()
                .collect()
        };
        for item in subsets {
            self.retire(&item);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn recalc_ro_files(&self) {
        let items = self.items.lock();
        let mut out: Vec<CtxFile> = Vec::with_capacity(items.len());
        for item in items.values() {
            if item.can_delete() {
                continue;
            }
            // A later item with a smaller start is a superset of tail
            // entries (order is end asc, start desc); drop the shadowed
            // subsets so readers only see the widest slice.
            while let Some(last) = out.last() {
                if last.start_tx_num >= item.start_tx_num {
                    out.pop();
                } else {
                    break;
                }
            }
            out.push(CtxFile {
                start_tx_num: item.start_tx_num,
                end_tx_num: item.end_tx_num,
                src: item.clone(),
            });
        }
        drop(items);
        *self.ro.write() = Arc::new(out);
    }
}

/// `<base>.<fromStep>-<toStep>.<ext>`
pub fn file_name(base: &str, from_step: u64, to_step: u64, ext: &str) -> String {
    format!("{base}.{from_step}-{to_step}.{ext}")
}

/// Parse a state file name into `(base, from_step, to_step, ext)`.
pub fn parse_file_name(name: &str) -> Option<(&str, u64, u64, &str)> {
    let mut parts = name.rsplitn(3, '.');
    let ext = parts.next()?;
    let range = parts.next()?;
    let base = parts.next()?;
    let (from, to) = range.split_once('-')?;
    Some((base, from.parse().ok()?, to.parse().ok()?, ext))
}

/// Filename scheme of one column's files.
#[derive(Clone, Debug)]
pub struct FileSpec {
    pub dir: PathBuf,
    pub base: String,
    pub aggregation_step: u64,
    pub data_ext: &'static str,
    pub index_ext: &'static str,
    pub btree_ext: Option<&'static str>,
    /// Sibling extensions that must exist for a slice to be usable (e.g. a
    /// posting-list file is useless without its value file).
    pub integrity_exts: Vec<&'static str>,
}

impl FileSpec {
    pub fn path(&self, from_step: u64, to_step: u64, ext: &str) -> PathBuf {
        self.dir.join(file_name(&self.base, from_step, to_step, ext))
    }

    pub fn data_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.path(from_step, to_step, self.data_ext)
    }

    pub fn index_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.path(from_step, to_step, self.index_ext)
    }

    /// Candidate step ranges found on disk, sorted by (end asc, start desc).
    pub fn scan(&self) -> Result<Vec<(u64, u64)>, Error> {
        let mut ranges = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((base, from, to, ext)) = parse_file_name(name) else {
                continue;
            };
            if base != self.base || ext != self.data_ext {
                continue;
            }
            if from > to {
                warn!(name, "file ignored by scan: fromStep > toStep");
                continue;
            }
            ranges.push((from, to));
        }
        ranges.sort_by_key(|&(from, to)| (to, Reverse(from)));
        Ok(ranges)
    }

    /// Open the slice `[fromStep, toStep)` from disk.
    pub fn open_item(&self, from_step: u64, to_step: u64) -> Result<FileItem, Error> {
        let data = Arc::new(SegReader::open(self.data_path(from_step, to_step))?);
        let index = HashIndex::open(self.index_path(from_step, to_step))?;
        let btree = match self.btree_ext {
            Some(ext) => Some(BtIndex::open(
                self.path(from_step, to_step, ext),
                data.clone(),
            )?),
            None => None,
        };
        Ok(FileItem::new(
            from_step * self.aggregation_step,
            to_step * self.aggregation_step,
            self.aggregation_step,
            data,
            Some(index),
            btree,
        ))
    }

    /// Scan the directory and fill `registry` with every usable slice.
    ///
    /// Slices with missing or unreadable siblings are skipped with a
    /// warning; subsets of a frozen superset are not opened at all.
    pub fn scan_and_open(&self, registry: &FileRegistry) -> Result<(), Error> {
        let ranges = self.scan()?;
        let frozen: Vec<(u64, u64)> = ranges
            .iter()
            .copied()
            .filter(|&(from, to)| to - from == STEPS_IN_BIGGEST_FILE)
            .collect();

        for (from, to) in ranges {
            let shadowed = frozen.iter().any(|&(ffrom, fto)| {
                ffrom <= from && to <= fto && (ffrom, fto) != (from, to)
            });
            if shadowed {
                warn!(
                    base = %self.base,
                    from, to,
                    "slice shadowed by a frozen superset, leaving for cleanup"
                );
                continue;
            }
            if registry.contains(from * self.aggregation_step, to * self.aggregation_step) {
                continue;
            }

            let mut missing = Vec::new();
            for ext in std::iter::once(self.index_ext)
                .chain(self.btree_ext)
                .chain(self.integrity_exts.iter().copied())
            {
                let path = self.path(from, to, ext);
                if !path.exists() {
                    missing.push(ext);
                }
            }
            if !missing.is_empty() {
                warn!(
                    base = %self.base,
                    from, to, ?missing,
                    "slice skipped: required sibling files missing"
                );
                continue;
            }

            match self.open_item(from, to) {
                Ok(item) => registry.insert(Arc::new(item)),
                Err(err) => {
                    warn!(base = %self.base, from, to, %err, "slice skipped: unreadable");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seg::SegWriter;

    fn seg_at(dir: &Path, name: &str) -> Arc<SegReader> {
        let path = dir.join(name);
        let mut w = SegWriter::create(&path, None).unwrap();
        w.add_word(b"k").unwrap();
        w.add_word(b"v").unwrap();
        w.finish().unwrap();
        Arc::new(SegReader::open(&path).unwrap())
    }

    fn item(dir: &Path, name: &str, start: u64, end: u64) -> Arc<FileItem> {
        Arc::new(FileItem::new(start, end, 2, seg_at(dir, name), None, None))
    }

    #[test]
    fn parse_and_format_names() {
        assert_eq!(file_name("accounts", 0, 1, "kv"), "accounts.0-1.kv");
        assert_eq!(
            parse_file_name("storage.4-8.bt"),
            Some(("storage", 4, 8, "bt"))
        );
        assert_eq!(parse_file_name("nodots"), None);
        assert_eq!(parse_file_name("x.8-4x.kv"), None);
    }

    #[test]
    fn frozen_flag_from_span() {
        let dir = tempfile::tempdir().unwrap();
        let cold = item(dir.path(), "a.seg", 0, 2);
        assert!(!cold.frozen);
        let frozen = item(dir.path(), "b.seg", 0, 2 * STEPS_IN_BIGGEST_FILE);
        assert!(frozen.frozen);
    }

    #[test]
    fn registry_order_and_ro_projection() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        reg.insert(item(dir.path(), "a.seg", 0, 2));
        reg.insert(item(dir.path(), "b.seg", 2, 4));
        // Superset of both.
        reg.insert(item(dir.path(), "c.seg", 0, 4));

        let ro = reg.ro_files();
        assert_eq!(ro.len(), 1);
        assert_eq!((ro[0].start_tx_num, ro[0].end_tx_num), (0, 4));
        assert_eq!(reg.end_tx_num_max(), 4);
    }

    #[test]
    fn retire_waits_for_pins() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new();
        let it = item(dir.path(), "a.seg", 0, 2);
        let data_path = it.data.path().to_path_buf();
        reg.insert(it.clone());

        it.pin();
        reg.retire(&it);
        assert!(reg.ro_files().is_empty());
        assert!(data_path.exists(), "pinned file must survive retire");

        it.unpin();
        assert!(!data_path.exists(), "last unpin removes the file");
    }

    #[test]
    fn frozen_items_bypass_refcounting() {
        let dir = tempfile::tempdir().unwrap();
        let it = item(dir.path(), "a.seg", 0, 2 * STEPS_IN_BIGGEST_FILE);
        it.pin();
        assert_eq!(it.refcount(), 0);
        it.unpin();
        assert!(!it.can_delete());
    }

    #[test]
    fn subset_relation() {
        let dir = tempfile::tempdir().unwrap();
        let small = item(dir.path(), "a.seg", 2, 4);
        let big = item(dir.path(), "b.seg", 0, 8);
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
        let twin = item(dir.path(), "c.seg", 2, 4);
        assert!(!small.is_subset_of(&twin));
    }
}
