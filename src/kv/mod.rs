//! Transactional key-value interface the engine runs against.
//!
//! The engine does not own a database: the embedder supplies one that
//! exposes named tables with MDBX-style cursor semantics, including
//! dup-sorted tables (one key, many sorted values). [`mem::MemKv`] is a
//! bundled in-memory implementation with snapshot read transactions, used
//! by the tests and by embedders that do not bring their own store.
//!
//! # Tables
//!
//! Each domain requires six tables ([`DomainTables`]) and each inverted
//! index two ([`IndexTables`]). Dup-sorted tables keep their values in
//! ascending byte order, which the engine relies on for inverted-step and
//! txNum ordering.

pub mod mem;
pub use mem::MemKv;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("write on read-only transaction")]
    ReadOnly,
    #[error("cursor has no current position")]
    NoCurrent,
}

/// Read transaction over named tables.
pub trait Tx: Send + Sync {
    /// Single value of `key` (first duplicate for dup-sorted tables).
    fn get_one(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Cursor over a dup-sorted table.
    fn cursor_dup_sort<'a>(&'a self, table: &str) -> Result<Box<dyn DupCursor + 'a>, Error>;

    /// Duplicates of `key` with values in `[from, to)`, ordered by `asc`,
    /// at most `limit` results.
    fn dup_range(
        &self,
        table: &str,
        key: &[u8],
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        asc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, Error>;
}

/// Write transaction. There must be at most one of these alive per store;
/// readers remain free to run concurrently.
pub trait RwTx: Tx {
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Delete `key` along with all of its duplicates.
    fn delete(&self, table: &str, key: &[u8]) -> Result<(), Error>;

    /// Delete exactly the `(key, value)` pair.
    fn delete_exact(&self, table: &str, key: &[u8], value: &[u8]) -> Result<(), Error>;

    fn rw_cursor_dup_sort<'a>(&'a self, table: &str)
        -> Result<Box<dyn RwDupCursor + 'a>, Error>;
}

/// Cursor over a dup-sorted table.
///
/// All movement returns the `(key, value)` pair landed on, or `None` when
/// the table is exhausted in that direction. Deleting entries out from
/// under a cursor is allowed: the cursor repositions relative to its last
/// observed pair.
pub trait DupCursor {
    fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error>;

    /// Next duplicate of the current key, or the first duplicate of the
    /// next key.
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error>;

    /// First duplicate of the next distinct key.
    fn next_no_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error>;

    /// Next duplicate of the current key only.
    fn next_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error>;

    /// Previous duplicate of the current key only.
    fn prev_dup(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error>;

    /// Smallest `(key, value)` with `key >= target`.
    fn seek(&mut self, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error>;

    /// First duplicate of exactly `target`.
    fn seek_exact(&mut self, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error>;

    /// For exactly `key`, the smallest duplicate `>= value`.
    fn seek_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Largest duplicate of the current key.
    fn last_dup(&mut self) -> Result<Option<Vec<u8>>, Error>;

    /// Total number of `(key, value)` pairs in the table, duplicates
    /// included.
    fn count(&mut self) -> Result<u64, Error>;
}

/// Mutating cursor over a dup-sorted table.
pub trait RwDupCursor: DupCursor {
    /// Delete the pair the cursor is positioned on.
    fn delete_current(&mut self) -> Result<(), Error>;

    /// Delete every duplicate of the current key.
    fn delete_current_duplicates(&mut self) -> Result<(), Error>;
}

/// Names of the six tables backing one domain.
#[derive(Clone, Debug)]
pub struct DomainTables {
    pub keys: String,
    pub vals: String,
    pub history_keys: String,
    pub history_vals: String,
    pub settings: String,
    pub idx: String,
}

impl DomainTables {
    pub fn new(base: &str) -> Self {
        Self {
            keys: format!("{base}_keys"),
            vals: format!("{base}_vals"),
            history_keys: format!("{base}_history_keys"),
            history_vals: format!("{base}_history_vals"),
            settings: format!("{base}_settings"),
            idx: format!("{base}_idx"),
        }
    }

    /// `(name, dup_sorted)` for every table, in creation order.
    pub fn all(&self) -> [(&str, bool); 6] {
        [
            (&self.keys, true),
            (&self.vals, false),
            (&self.history_keys, true),
            (&self.history_vals, false),
            (&self.settings, false),
            (&self.idx, true),
        ]
    }
}

/// Names of the two tables backing one inverted index.
#[derive(Clone, Debug)]
pub struct IndexTables {
    pub keys: String,
    pub idx: String,
}

impl IndexTables {
    pub fn new(base: &str) -> Self {
        Self {
            keys: format!("{base}_keys"),
            idx: format!("{base}_idx"),
        }
    }

    pub fn all(&self) -> [(&str, bool); 2] {
        [(&self.keys, true), (&self.idx, true)]
    }
}
