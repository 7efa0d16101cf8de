//! In-memory reference implementation of the [`kv`](super) interface.
//!
//! Tables are ordered maps of `key -> ordered set of values`. Read
//! transactions snapshot the whole store at `begin_ro`, so a reader keeps
//! observing the state as of its creation while the single writer keeps
//! mutating. This mirrors the snapshot isolation the engine expects from a
//! production MVCC store.

use super::{DupCursor, Error, RwDupCursor, RwTx, Tx};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound::{Excluded, Unbounded},
    sync::Arc,
};

#[derive(Clone, Debug, Default)]
struct Table {
    dup_sort: bool,
    rows: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
}

type Tables = BTreeMap<String, Table>;

/// In-memory dup-sort store.
#[derive(Clone, Default)]
pub struct MemKv {
    tables: Arc<RwLock<Tables>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table. Recreating an existing table is a no-op.
    pub fn create_table(&self, name: &str, dup_sort: bool) {
        self.tables
            .write()
            .entry(name.to_string())
            .or_insert(Table {
                dup_sort,
                rows: BTreeMap::new(),
            });
    }

    /// Snapshot read transaction.
    pub fn begin_ro(&self) -> MemRoTx {
        MemRoTx {
            tables: self.tables.read().clone(),
        }
    }

    /// Write transaction. The caller is responsible for keeping at most one
    /// of these active; writes are visible to later `begin_ro` snapshots
    /// immediately.
    pub fn begin_rw(&self) -> MemRwTx {
        MemRwTx {
            tables: self.tables.clone(),
        }
    }
}

/// Snapshot read transaction.
pub struct MemRoTx {
    tables: Tables,
}

/// Write-through transaction sharing the live store.
#[derive(Clone)]
pub struct MemRwTx {
    tables: Arc<RwLock<Tables>>,
}

enum TxRef<'a> {
    Snap(&'a Tables),
    Live(&'a Arc<RwLock<Tables>>),
}

impl TxRef<'_> {
    fn with<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        match self {
            TxRef::Snap(t) => f(t),
            TxRef::Live(l) => f(&l.read()),
        }
    }
}

fn table<'t>(tables: &'t Tables, name: &str) -> Result<&'t Table, Error> {
    tables
        .get(name)
        .ok_or_else(|| Error::UnknownTable(name.to_string()))
}

fn get_one(tables: &Tables, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    Ok(table(tables, name)?
        .rows
        .get(key)
        .and_then(|set| set.iter().next().cloned()))
}

fn dup_range(
    tables: &Tables,
    name: &str,
    key: &[u8],
    from: Option<&[u8]>,
    to: Option<&[u8]>,
    asc: bool,
    limit: Option<usize>,
) -> Result<Vec<Vec<u8>>, Error> {
    let t = table(tables, name)?;
    let mut out = Vec::new();
    if let Some(set) = t.rows.get(key) {
        let within = |v: &Vec<u8>| {
            from.map_or(true, |f| v.as_slice() >= f) && to.map_or(true, |t| v.as_slice() < t)
        };
        let limit = limit.unwrap_or(usize::MAX);
        if asc {
            out.extend(set.iter().filter(|v| within(v)).take(limit).cloned());
        } else {
            out.extend(set.iter().rev().filter(|v| within(v)).take(limit).cloned());
        }
    }
    Ok(out)
}

impl Tx for MemRoTx {
    fn get_one(&self, table_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        get_one(&self.tables, table_name, key)
    }

    fn cursor_dup_sort<'a>(&'a self, table_name: &str) -> Result<Box<dyn DupCursor + 'a>, Error> {
        table(&self.tables, table_name)?;
        Ok(Box::new(MemCursor {
            tx: TxRef::Snap(&self.tables),
            table: table_name.to_string(),
            pos: None,
        }))
    }

    fn dup_range(
        &self,
        table_name: &str,
        key: &[u8],
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        asc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        dup_range(&self.tables, table_name, key, from, to, asc, limit)
    }
}

impl Tx for MemRwTx {
    fn get_one(&self, table_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        get_one(&self.tables.read(), table_name, key)
    }

    fn cursor_dup_sort<'a>(&'a self, table_name: &str) -> Result<Box<dyn DupCursor + 'a>, Error> {
        table(&self.tables.read(), table_name)?;
        Ok(Box::new(MemCursor {
            tx: TxRef::Live(&self.tables),
            table: table_name.to_string(),
            pos: None,
        }))
    }

    fn dup_range(
        &self,
        table_name: &str,
        key: &[u8],
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        asc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        dup_range(&self.tables.read(), table_name, key, from, to, asc, limit)
    }
}

impl RwTx for MemRwTx {
    fn put(&self, table_name: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table_name)
            .ok_or_else(|| Error::UnknownTable(table_name.to_string()))?;
        let set = t.rows.entry(key.to_vec()).or_default();
        if !t.dup_sort {
            set.clear();
        }
        set.insert(value.to_vec());
        Ok(())
    }

    fn delete(&self, table_name: &str, key: &[u8]) -> Result<(), Error> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table_name)
            .ok_or_else(|| Error::UnknownTable(table_name.to_string()))?;
        t.rows.remove(key);
        Ok(())
    }

    fn delete_exact(&self, table_name: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table_name)
            .ok_or_else(|| Error::UnknownTable(table_name.to_string()))?;
        if let Some(set) = t.rows.get_mut(key) {
            set.remove(value);
            if set.is_empty() {
                t.rows.remove(key);
            }
        }
        Ok(())
    }

    fn rw_cursor_dup_sort<'a>(
        &'a self,
        table_name: &str,
    ) -> Result<Box<dyn RwDupCursor + 'a>, Error> {
        table(&self.tables.read(), table_name)?;
        Ok(Box::new(MemRwCursor {
            tables: &self.tables,
            table: table_name.to_string(),
            pos: None,
        }))
    }
}

/// Cursor positions are `(key, value)` pairs; movement recomputes the next
/// position against the current map contents, so deletions behind the
/// cursor never invalidate it.
struct MemCursor<'a> {
    tx: TxRef<'a>,
    table: String,
    pos: Option<(Vec<u8>, Vec<u8>)>,
}

type Pair = Option<(Vec<u8>, Vec<u8>)>;

fn op_first(rows: &BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>) -> Pair {
    rows.iter()
        .next()
        .and_then(|(k, set)| set.iter().next().map(|v| (k.clone(), v.clone())))
}

fn op_next(rows: &BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>, pos: &Pair) -> Pair {
    match pos {
        None => op_first(rows),
        Some((k, v)) => {
            if let Some(set) = rows.get(k) {
                if let Some(nv) = set.range((Excluded(v.clone()), Unbounded)).next() {
                    return Some((k.clone(), nv.clone()));
                }
            }
            op_next_key(rows, k)
        }
    }
}

fn op_next_key(rows: &BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>, after: &[u8]) -> Pair {
    rows.range((Excluded(after.to_vec()), Unbounded))
        .next()
        .and_then(|(k, set)| set.iter().next().map(|v| (k.clone(), v.clone())))
}

fn op_seek(rows: &BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>, target: &[u8]) -> Pair {
    rows.range(target.to_vec()..)
        .next()
        .and_then(|(k, set)| set.iter().next().map(|v| (k.clone(), v.clone())))
}

impl MemCursor<'_> {
    fn with<R>(&self, f: impl FnOnce(&Table) -> Result<R, Error>) -> Result<R, Error> {
        let name = self.table.clone();
        self.tx.with(|tables| f(table(tables, &name)?))
    }
}

fn cursor_first(t: &Table, pos: &mut Pair) -> Pair {
    *pos = op_first(&t.rows);
    pos.clone()
}

fn cursor_next(t: &Table, pos: &mut Pair) -> Pair {
    *pos = op_next(&t.rows, pos);
    pos.clone()
}

fn cursor_next_no_dup(t: &Table, pos: &mut Pair) -> Pair {
    *pos = match pos {
        None => op_first(&t.rows),
        Some((k, _)) => op_next_key(&t.rows, k),
    };
    pos.clone()
}

fn cursor_next_dup(t: &Table, pos: &mut Pair) -> Result<Pair, Error> {
    let (k, v) = pos.clone().ok_or(Error::NoCurrent)?;
    let next = t
        .rows
        .get(&k)
        .and_then(|set| set.range((Excluded(v), Unbounded)).next().cloned())
        .map(|nv| (k, nv));
    if next.is_some() {
        *pos = next.clone();
    }
    Ok(next)
}

fn cursor_prev_dup(t: &Table, pos: &mut Pair) -> Result<Pair, Error> {
    let (k, v) = pos.clone().ok_or(Error::NoCurrent)?;
    let prev = t
        .rows
        .get(&k)
        .and_then(|set| set.range(..v).next_back().cloned())
        .map(|pv| (k, pv));
    if prev.is_some() {
        *pos = prev.clone();
    }
    Ok(prev)
}

fn cursor_seek(t: &Table, pos: &mut Pair, target: &[u8]) -> Pair {
    *pos = op_seek(&t.rows, target);
    pos.clone()
}

fn cursor_seek_exact(t: &Table, pos: &mut Pair, target: &[u8]) -> Pair {
    let hit = t
        .rows
        .get(target)
        .and_then(|set| set.iter().next())
        .map(|v| (target.to_vec(), v.clone()));
    if hit.is_some() {
        *pos = hit.clone();
    }
    hit
}

fn cursor_seek_both_range(
    t: &Table,
    pos: &mut Pair,
    key: &[u8],
    value: &[u8],
) -> Option<Vec<u8>> {
    let hit = t
        .rows
        .get(key)
        .and_then(|set| set.range(value.to_vec()..).next().cloned());
    if let Some(v) = &hit {
        *pos = Some((key.to_vec(), v.clone()));
    }
    hit
}

fn cursor_last_dup(t: &Table, pos: &Pair) -> Result<Option<Vec<u8>>, Error> {
    let (k, _) = pos.clone().ok_or(Error::NoCurrent)?;
    Ok(t.rows.get(&k).and_then(|set| set.iter().next_back().cloned()))
}

fn cursor_count(t: &Table) -> u64 {
    t.rows.values().map(|set| set.len() as u64).sum()
}

impl DupCursor for MemCursor<'_> {
    fn first(&mut self) -> Result<Pair, Error> {
        let mut pos = self.pos.take();
        let out = self.with(|t| Ok(cursor_first(t, &mut pos)));
        self.pos = pos;
        out
    }

    fn next(&mut self) -> Result<Pair, Error> {
        let mut pos = self.pos.take();
        let out = self.with(|t| Ok(cursor_next(t, &mut pos)));
        self.pos = pos;
        out
    }

    fn next_no_dup(&mut self) -> Result<Pair, Error> {
        let mut pos = self.pos.take();
        let out = self.with(|t| Ok(cursor_next_no_dup(t, &mut pos)));
        self.pos = pos;
        out
    }

    fn next_dup(&mut self) -> Result<Pair, Error> {
        let mut pos = self.pos.take();
        let out = self.with(|t| cursor_next_dup(t, &mut pos));
        self.pos = pos;
        out
    }

    fn prev_dup(&mut self) -> Result<Pair, Error> {
        let mut pos = self.pos.take();
        let out = self.with(|t| cursor_prev_dup(t, &mut pos));
        self.pos = pos;
        out
    }

    fn seek(&mut self, target: &[u8]) -> Result<Pair, Error> {
        let mut pos = self.pos.take();
        let out = self.with(|t| Ok(cursor_seek(t, &mut pos, target)));
        self.pos = pos;
        out
    }

    fn seek_exact(&mut self, target: &[u8]) -> Result<Pair, Error> {
        let mut pos = self.pos.take();
        let out = self.with(|t| Ok(cursor_seek_exact(t, &mut pos, target)));
        self.pos = pos;
        out
    }

    fn seek_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let mut pos = self.pos.take();
        let out = self.with(|t| Ok(cursor_seek_both_range(t, &mut pos, key, value)));
        self.pos = pos;
        out
    }

    fn last_dup(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let pos = self.pos.clone();
        self.with(|t| cursor_last_dup(t, &pos))
    }

    fn count(&mut self) -> Result<u64, Error> {
        self.with(|t| Ok(cursor_count(t)))
    }
}

struct MemRwCursor<'a> {
    tables: &'a Arc<RwLock<Tables>>,
    table: String,
    pos: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemRwCursor<'_> {
    fn with_mut<R>(
        &mut self,
        f: impl FnOnce(&mut Table, &mut Pair) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(&self.table)
            .ok_or_else(|| Error::UnknownTable(self.table.clone()))?;
        let mut pos = self.pos.take();
        let out = f(t, &mut pos);
        self.pos = pos;
        out
    }
}

impl DupCursor for MemRwCursor<'_> {
    fn first(&mut self) -> Result<Pair, Error> {
        self.with_mut(|t, pos| Ok(cursor_first(t, pos)))
    }

    fn next(&mut self) -> Result<Pair, Error> {
        self.with_mut(|t, pos| Ok(cursor_next(t, pos)))
    }

    fn next_no_dup(&mut self) -> Result<Pair, Error> {
        self.with_mut(|t, pos| Ok(cursor_next_no_dup(t, pos)))
    }

    fn next_dup(&mut self) -> Result<Pair, Error> {
        self.with_mut(|t, pos| cursor_next_dup(t, pos))
    }

    fn prev_dup(&mut self) -> Result<Pair, Error> {
        self.with_mut(|t, pos| cursor_prev_dup(t, pos))
    }

    fn seek(&mut self, target: &[u8]) -> Result<Pair, Error> {
        self.with_mut(|t, pos| Ok(cursor_seek(t, pos, target)))
    }

    fn seek_exact(&mut self, target: &[u8]) -> Result<Pair, Error> {
        self.with_mut(|t, pos| Ok(cursor_seek_exact(t, pos, target)))
    }

    fn seek_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.with_mut(|t, pos| Ok(cursor_seek_both_range(t, pos, key, value)))
    }

    fn last_dup(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.with_mut(|t, pos| {
            let p = pos.clone();
            cursor_last_dup(t, &p)
        })
    }

    fn count(&mut self) -> Result<u64, Error> {
        self.with_mut(|t, _| Ok(cursor_count(t)))
    }
}

impl RwDupCursor for MemRwCursor<'_> {
    fn delete_current(&mut self) -> Result<(), Error> {
        self.with_mut(|t, pos| {
            let (k, v) = pos.clone().ok_or(Error::NoCurrent)?;
            if let Some(set) = t.rows.get_mut(&k) {
                set.remove(&v);
                if set.is_empty() {
                    t.rows.remove(&k);
                }
            }
            Ok(())
        })
    }

    fn delete_current_duplicates(&mut self) -> Result<(), Error> {
        self.with_mut(|t, pos| {
            let (k, _) = pos.clone().ok_or(Error::NoCurrent)?;
            t.rows.remove(&k);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemKv {
        let kv = MemKv::new();
        kv.create_table("dup", true);
        kv.create_table("plain", false);
        kv
    }

    #[test]
    fn dup_sort_orders_values() {
        let kv = store();
        let tx = kv.begin_rw();
        tx.put("dup", b"k", b"\x03").unwrap();
        tx.put("dup", b"k", b"\x01").unwrap();
        tx.put("dup", b"k", b"\x02").unwrap();

        let mut c = tx.cursor_dup_sort("dup").unwrap();
        let (_, v) = c.first().unwrap().unwrap();
        assert_eq!(v, b"\x01");
        assert_eq!(c.next_dup().unwrap().unwrap().1, b"\x02");
        assert_eq!(c.next_dup().unwrap().unwrap().1, b"\x03");
        assert!(c.next_dup().unwrap().is_none());
        assert_eq!(c.last_dup().unwrap().unwrap(), b"\x03");
    }

    #[test]
    fn plain_table_replaces() {
        let kv = store();
        let tx = kv.begin_rw();
        tx.put("plain", b"k", b"a").unwrap();
        tx.put("plain", b"k", b"b").unwrap();
        assert_eq!(tx.get_one("plain", b"k").unwrap().unwrap(), b"b");
    }

    #[test]
    fn seek_both_range_exact_key_only() {
        let kv = store();
        let tx = kv.begin_rw();
        tx.put("dup", b"a", b"\x05").unwrap();
        tx.put("dup", b"b", b"\x01").unwrap();

        let mut c = tx.cursor_dup_sort("dup").unwrap();
        assert_eq!(c.seek_both_range(b"a", b"\x03").unwrap().unwrap(), b"\x05");
        assert!(c.seek_both_range(b"a", b"\x06").unwrap().is_none());
        assert!(c.seek_both_range(b"c", b"\x00").unwrap().is_none());
    }

    #[test]
    fn delete_during_iteration_repositions() {
        let kv = store();
        let tx = kv.begin_rw();
        for k in [b"a", b"b", b"c"] {
            tx.put("dup", k, b"\x01").unwrap();
            tx.put("dup", k, b"\x02").unwrap();
        }

        let mut c = tx.rw_cursor_dup_sort("dup").unwrap();
        let (k, _) = c.first().unwrap().unwrap();
        assert_eq!(k, b"a");
        c.delete_current_duplicates().unwrap();
        let (k, v) = c.next_no_dup().unwrap().unwrap();
        assert_eq!((k.as_slice(), v.as_slice()), (b"b".as_slice(), b"\x01".as_slice()));
        c.delete_current().unwrap();
        assert_eq!(c.next().unwrap().unwrap().1, b"\x02");
    }

    #[test]
    fn snapshot_isolation() {
        let kv = store();
        let rw = kv.begin_rw();
        rw.put("plain", b"k", b"old").unwrap();

        let ro = kv.begin_ro();
        rw.put("plain", b"k", b"new").unwrap();
        assert_eq!(ro.get_one("plain", b"k").unwrap().unwrap(), b"old");
        assert_eq!(rw.get_one("plain", b"k").unwrap().unwrap(), b"new");
    }

    #[test]
    fn dup_range_bounds_and_order() {
        let kv = store();
        let tx = kv.begin_rw();
        for v in 1u8..=5 {
            tx.put("dup", b"k", &[v]).unwrap();
        }
        let asc = tx
            .dup_range("dup", b"k", Some(&[2]), Some(&[5]), true, None)
            .unwrap();
        assert_eq!(asc, vec![vec![2], vec![3], vec![4]]);
        let desc = tx
            .dup_range("dup", b"k", None, None, false, Some(2))
            .unwrap();
        assert_eq!(desc, vec![vec![5], vec![4]]);
    }
}
