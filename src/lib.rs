//! Persist a stream of per-transaction state mutations as a layered set of
//! immutable on-disk files, while answering both latest-value and
//! point-in-time reads.
//!
//! # Terminology
//!
//! Every mutation is stamped with a _txNum_, a monotonically increasing
//! 64-bit counter supplied by the caller. A _step_ is a fixed window of
//! txNums; it is the unit at which recent activity is frozen into files.
//! A _domain_ is a named versioned key-value column (accounts, storage,
//! code, commitment). An _inverted index_ is a per-key posting list of
//! txNums. _History_ records the previous value of a key at the moment it
//! was overwritten.
//!
//! # Layering
//!
//! Recent writes live in a caller-provided transactional KV store (see
//! [`kv`]). On each step boundary the [`aggregator::Aggregator`] collates
//! the closed step into compressed, indexed files, prunes the KV-resident
//! copy, and merges adjacent files into larger ones in the background.
//! Reads traverse the file stack newest-first with a fallthrough to the KV
//! store.

pub mod account;
pub mod aggregator;
pub mod commitment;
pub mod domain;
pub mod eliasfano;
pub mod files;
pub mod history;
pub mod index;
pub mod inverted_index;
pub mod kv;
pub mod seg;
pub mod wal;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Files spanning this many steps are completely frozen: they are never
/// merged away and never reference-counted. Files spanning fewer steps are
/// immutable in content but may be superseded by a larger merged file.
pub const STEPS_IN_BIGGEST_FILE: u64 = 32;

/// Cooperative cancellation flag polled by every long-running loop
/// (collation, file building, pruning, merging) at bounded intervals.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag. All holders observe the cancellation on their next
    /// poll.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
