//! Indices over sealed segment files.
//!
//! Two flavors back the read paths:
//!
//! - [`hash::HashIndex`] — a minimal perfect hash from key to segment
//!   offset (the `.kvi`/`.efi`/`.vi` files). Probes never fail for absent
//!   keys; callers verify the key word at the returned offset.
//! - [`btree::BtIndex`] — a static B-tree over the sorted keys of a value
//!   segment (the `.bt` files), used for ordered seeks and prefix scans.

pub mod btree;
pub mod hash;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment error: {0}")]
    Seg(#[from] crate::seg::Error),
    #[error("corrupt index {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("perfect hash build exhausted salt retries")]
    SaltRetriesExhausted,
}
