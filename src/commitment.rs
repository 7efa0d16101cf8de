//! Patricia commitment over the account and storage state.
//!
//! The `commitment` domain stores one branch node per nibble prefix of a
//! compressed hex Patricia trie. Between step boundaries the wrapper only
//! collects touched plain keys; `compute_commitment` resolves the touched
//! leaves through caller-provided callbacks, restructures the affected
//! paths, rehashes bottom-up and emits one *delta* per changed prefix.
//! The caller merges each delta into the stored node with
//! [`BranchMerger::merge`] and writes back only branches that changed.
//!
//! Node encoding (stored nodes and deltas share the shape):
//!
//! ```text
//! [touchMap u16][afterMap u16]
//! per set bit of afterMap, ascending:
//!   [kind u8][extLen u8][ext nibbles]
//!   kind 0 (leaf):   [keyLen u16][key][hash 32]
//!   kind 1 (branch): [hash 32]
//! [valueMarker u8]            0 none/untouched, 1 set, 2 cleared
//!   marker 1: [keyLen u16][key][hash 32]
//! ```
//!
//! `touchMap` names the child slots a delta replaces; unnamed slots come
//! from the stored node. A delta with an empty `afterMap` and a full
//! `touchMap` tombstones the node.

use crate::{
    domain::{Domain, DomainContext},
    kv::{RwTx, Tx},
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::trace;

/// Reserved key of the recovery marker inside the commitment domain.
pub const STATE_KEY: &[u8] = b"state";

#[derive(Debug, Error)]
pub enum Error {
    #[error("domain error: {0}")]
    Domain(#[from] crate::domain::Error),
    #[error("corrupt branch node at prefix {0:02x?}")]
    CorruptBranch(Vec<u8>),
    #[error("missing branch node at prefix {0:02x?}")]
    MissingBranch(Vec<u8>),
    #[error("corrupt commitment state marker")]
    CorruptState,
    #[error("state read failed: {0}")]
    StateRead(String),
}

/// How much commitment work happens on each step boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitmentMode {
    /// Skip commitment entirely.
    Disabled,
    /// Recompute over the touched keys on every boundary.
    Direct,
    /// Collect touched keys, resolve them only at computation time.
    UpdateKeys,
}

/// Trie layout selector. One variant today; the config surface stays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrieVariant {
    #[default]
    HexPatricia,
}

/// Leaf-resolution callbacks: reads go through the aggregator's current
/// reader context into the accounts, code and storage domains.
pub trait StateReader {
    /// Stored branch node for a prefix key produced by [`node_key`].
    fn branch(&self, prefix_key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Resolved account payload (account encoding with the code digest
    /// folded in), or `None` if the account is gone.
    fn account_leaf(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Resolved storage payload, or `None` if the slot is empty.
    fn storage_leaf(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TouchKind {
    Account,
    Storage,
}

fn to_nibbles(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() * 2);
    for b in key {
        out.push(b >> 4);
        out.push(b & 0x0f);
    }
    out
}

/// Domain key of the branch node stored for `prefix` (nibbles).
pub fn node_key(prefix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + prefix.len());
    out.push(0x01);
    out.push(prefix.len() as u8);
    out.extend_from_slice(prefix);
    out
}

fn leaf_hash(key: &[u8], payload: &[u8]) -> [u8; 32] {
    let payload_digest: [u8; 32] = Sha256::digest(payload).into();
    let mut h = Sha256::new();
    h.update([0x00]);
    h.update((key.len() as u16).to_be_bytes());
    h.update(key);
    h.update(payload_digest);
    h.finalize().into()
}

fn empty_root() -> [u8; 32] {
    Sha256::digest([0x03]).into()
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ChildNode {
    Leaf { key: Vec<u8>, hash: [u8; 32] },
    Branch { hash: [u8; 32] },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Child {
    ext: Vec<u8>,
    node: ChildNode,
}

#[derive(Clone, Debug, Default)]
struct Node {
    children: BTreeMap<u8, Child>,
    value: Option<(Vec<u8>, [u8; 32])>,
    touch: u16,
    value_touched: bool,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.value.is_none()
    }

    fn hash(&self, prefix: &[u8], new_hashes: &BTreeMap<Vec<u8>, [u8; 32]>) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update([0x01]);
        for (n, child) in &self.children {
            h.update([*n, child.ext.len() as u8]);
            h.update(&child.ext);
            let hash = match &child.node {
                ChildNode::Leaf { hash, .. } => *hash,
                ChildNode::Branch { hash } => {
                    let mut q = prefix.to_vec();
                    q.push(*n);
                    q.extend_from_slice(&child.ext);
                    new_hashes.get(&q).copied().unwrap_or(*hash)
                }
            };
            h.update(hash);
        }
        if let Some((_, vh)) = &self.value {
            h.update([0x02]);
            h.update(vh);
        }
        h.finalize().into()
    }

    fn encode(&self) -> Vec<u8> {
        let after: u16 = self.children.keys().fold(0, |m, n| m | (1 << n));
        let mut out = Vec::new();
        out.extend_from_slice(&self.touch.to_be_bytes());
        out.extend_from_slice(&after.to_be_bytes());
        for (_, child) in &self.children {
            encode_child(&mut out, child);
        }
        match &self.value {
            Some((key, hash)) => {
                out.push(1);
                out.extend_from_slice(&(key.len() as u16).to_be_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(hash);
            }
            None => out.push(if self.value_touched { 2 } else { 0 }),
        }
        out
    }

    /// Delta: only the touched child slots and the value slot when it
    /// changed.
    fn encode_delta(&self) -> Vec<u8> {
        let after: u16 = self
            .children
            .keys()
            .filter(|n| self.touch & (1 << **n) != 0)
            .fold(0, |m, n| m | (1 << n));
        let mut out = Vec::new();
        out.extend_from_slice(&self.touch.to_be_bytes());
        out.extend_from_slice(&after.to_be_bytes());
        for (n, child) in &self.children {
            if self.touch & (1 << n) != 0 {
                encode_child(&mut out, child);
            }
        }
        match (&self.value, self.value_touched) {
            (Some((key, hash)), true) => {
                out.push(1);
                out.extend_from_slice(&(key.len() as u16).to_be_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(hash);
            }
            (None, true) => out.push(2),
            (_, false) => out.push(0),
        }
        out
    }
}

fn encode_child(out: &mut Vec<u8>, child: &Child) {
    match &child.node {
        ChildNode::Leaf { key, hash } => {
            out.push(0);
            out.push(child.ext.len() as u8);
            out.extend_from_slice(&child.ext);
            out.extend_from_slice(&(key.len() as u16).to_be_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(hash);
        }
        ChildNode::Branch { hash } => {
            out.push(1);
            out.push(child.ext.len() as u8);
            out.extend_from_slice(&child.ext);
            out.extend_from_slice(hash);
        }
    }
}

struct Decoded {
    touch: u16,
    children: BTreeMap<u8, Child>,
    value: Option<(Vec<u8>, [u8; 32])>,
    value_marker: u8,
}

fn decode(data: &[u8], prefix: &[u8]) -> Result<Decoded, Error> {
    let corrupt = || Error::CorruptBranch(prefix.to_vec());
    let mut at = 0usize;
    let mut take = |n: usize, data: &[u8]| -> Result<std::ops::Range<usize>, Error> {
        let r = at..at + n;
        if r.end > data.len() {
            return Err(Error::CorruptBranch(prefix.to_vec()));
        }
        at = r.end;
        Ok(r)
    };

    let touch = u16::from_be_bytes(data[take(2, data)?].try_into().expect("sized"));
    let after = u16::from_be_bytes(data[take(2, data)?].try_into().expect("sized"));
    let mut children = BTreeMap::new();
    for n in 0u8..16 {
        if after & (1 << n) == 0 {
            continue;
        }
        let kind = data[take(1, data)?][0];
        let ext_len = data[take(1, data)?][0] as usize;
        let ext = data[take(ext_len, data)?].to_vec();
        let node = match kind {
            0 => {
                let key_len =
                    u16::from_be_bytes(data[take(2, data)?].try_into().expect("sized")) as usize;
                let key = data[take(key_len, data)?].to_vec();
                let hash = data[take(32, data)?].try_into().expect("sized");
                ChildNode::Leaf { key, hash }
            }
            1 => ChildNode::Branch {
                hash: data[take(32, data)?].try_into().expect("sized"),
            },
            _ => return Err(corrupt()),
        };
        children.insert(n, Child { ext, node });
    }
    let value_marker = data[take(1, data)?][0];
    let value = match value_marker {
        1 => {
            let key_len =
                u16::from_be_bytes(data[take(2, data)?].try_into().expect("sized")) as usize;
            let key = data[take(key_len, data)?].to_vec();
            let hash = data[take(32, data)?].try_into().expect("sized");
            Some((key, hash))
        }
        0 | 2 => None,
        _ => return Err(corrupt()),
    };
    Ok(Decoded {
        touch,
        children,
        value,
        value_marker,
    })
}

/// Merges a delta into the stored form of a branch node.
#[derive(Clone, Copy, Debug, Default)]
pub struct BranchMerger;

impl BranchMerger {
    /// `stated` is the stored node (if any), `update` a delta produced by
    /// the trie. Returns the new stored form.
    pub fn merge(&self, stated: Option<&[u8]>, update: &[u8]) -> Result<Vec<u8>, Error> {
        let up = decode(update, &[])?;
        let st = match stated {
            Some(data) if !data.is_empty() => Some(decode(data, &[])?),
            _ => None,
        };

        let mut node = Node {
            touch: up.touch,
            ..Node::default()
        };
        for n in 0u8..16 {
            let bit = 1 << n;
            let source = if up.touch & bit != 0 {
                up.children.get(&n)
            } else {
                st.as_ref().and_then(|s| s.children.get(&n))
            };
            if let Some(child) = source {
                node.children.insert(n, child.clone());
            }
        }
        node.value = match up.value_marker {
            1 => up.value,
            2 => None,
            _ => st.and_then(|s| s.value),
        };
        Ok(node.encode())
    }
}

/// Whether a stored node encoding is a live branch (tombstones and empty
/// nodes read as absent).
fn is_live(decoded: &Decoded) -> bool {
    !decoded.children.is_empty() || decoded.value.is_some()
}

struct CacheEntry {
    node: Node,
    loaded: bool,
}

/// Overlay of the stored trie for one computation round.
struct Overlay<'a> {
    reader: &'a dyn StateReader,
    cache: BTreeMap<Vec<u8>, CacheEntry>,
    deleted: BTreeSet<Vec<u8>>,
}

impl<'a> Overlay<'a> {
    fn new(reader: &'a dyn StateReader) -> Self {
        Self {
            reader,
            cache: BTreeMap::new(),
            deleted: BTreeSet::new(),
        }
    }

    fn load(&mut self, prefix: &[u8]) -> Result<Option<&mut Node>, Error> {
        if self.deleted.contains(prefix) {
            return Ok(None);
        }
        if !self.cache.contains_key(prefix) {
            let stored = self.reader.branch(&node_key(prefix))?;
            let node = match stored {
                Some(data) if !data.is_empty() => {
                    let d = decode(&data, prefix)?;
                    if !is_live(&d) {
                        return Ok(None);
                    }
                    Some(Node {
                        children: d.children,
                        value: d.value,
                        touch: 0,
                        value_touched: false,
                    })
                }
                _ => None,
            };
            match node {
                Some(node) => {
                    self.cache
                        .insert(prefix.to_vec(), CacheEntry { node, loaded: true });
                }
                None => return Ok(None),
            }
        }
        Ok(self.cache.get_mut(prefix).map(|e| &mut e.node))
    }

    fn create(&mut self, prefix: Vec<u8>) -> &mut Node {
        self.deleted.remove(&prefix);
        &mut self
            .cache
            .entry(prefix)
            .or_insert(CacheEntry {
                node: Node::default(),
                loaded: false,
            })
            .node
    }

    fn delete(&mut self, prefix: &[u8]) {
        self.cache.remove(prefix);
        self.deleted.insert(prefix.to_vec());
    }

    /// Insert (`leaf` set) or remove (`leaf` empty) one key.
    fn apply(&mut self, key: &[u8], leaf: Option<[u8; 32]>) -> Result<(), Error> {
        let path = to_nibbles(key);
        let mut stack: Vec<(Vec<u8>, u8)> = Vec::new();
        let mut prefix: Vec<u8> = Vec::new();

        loop {
            if prefix.is_empty() && self.load(&prefix)?.is_none() {
                if leaf.is_none() {
                    return Ok(());
                }
                self.create(Vec::new());
            }
            let node = self
                .load(&prefix)?
                .ok_or_else(|| Error::MissingBranch(prefix.clone()))?;
            let rest = &path[prefix.len()..];

            if rest.is_empty() {
                node.value = leaf.map(|h| (key.to_vec(), h));
                node.value_touched = true;
                break;
            }
            let n = rest[0];
            let tail = &rest[1..];
            let bit = 1u16 << n;

            let Some(child) = node.children.get(&n).cloned() else {
                if let Some(h) = leaf {
                    node.children.insert(
                        n,
                        Child {
                            ext: tail.to_vec(),
                            node: ChildNode::Leaf {
                                key: key.to_vec(),
                                hash: h,
                            },
                        },
                    );
                    node.touch |= bit;
                }
                break;
            };

            let common = child
                .ext
                .iter()
                .zip(tail.iter())
                .take_while(|(a, b)| a == b)
                .count();

            if common == child.ext.len() {
                match &child.node {
                    ChildNode::Branch { .. } => {
                        stack.push((prefix.clone(), n));
                        prefix.push(n);
                        prefix.extend_from_slice(&child.ext);
                        continue;
                    }
                    ChildNode::Leaf {
                        key: leaf_key,
                        hash: old_hash,
                    } => {
                        if leaf_key == key {
                            match leaf {
                                Some(h) => {
                                    if h != *old_hash {
                                        node.children.insert(
                                            n,
                                            Child {
                                                ext: child.ext,
                                                node: ChildNode::Leaf {
                                                    key: key.to_vec(),
                                                    hash: h,
                                                },
                                            },
                                        );
                                        node.touch |= bit;
                                    }
                                }
                                None => {
                                    node.children.remove(&n);
                                    node.touch |= bit;
                                }
                            }
                            break;
                        }
                        let Some(h) = leaf else { break };
                        // The stored leaf terminates where our key keeps
                        // going: grow a branch at the leaf's position.
                        let more = &tail[child.ext.len()..];
                        let old_leaf = (leaf_key.clone(), *old_hash);
                        let mut q = prefix.clone();
                        q.push(n);
                        q.extend_from_slice(&child.ext);
                        node.children.insert(
                            n,
                            Child {
                                ext: child.ext.clone(),
                                node: ChildNode::Branch { hash: [0; 32] },
                            },
                        );
                        node.touch |= bit;
                        let branch = self.create(q);
                        branch.value = Some(old_leaf);
                        branch.value_touched = true;
                        branch.children.insert(
                            more[0],
                            Child {
                                ext: more[1..].to_vec(),
                                node: ChildNode::Leaf {
                                    key: key.to_vec(),
                                    hash: h,
                                },
                            },
                        );
                        branch.touch |= 1 << more[0];
                        break;
                    }
                }
            }

            // Paths diverge inside the extension.
            let Some(h) = leaf else { break };
            let mut q = prefix.clone();
            q.push(n);
            q.extend_from_slice(&child.ext[..common]);
            let old_entry = Child {
                ext: child.ext[common + 1..].to_vec(),
                node: child.node.clone(),
            };
            let old_nibble = child.ext[common];
            node.children.insert(
                n,
                Child {
                    ext: child.ext[..common].to_vec(),
                    node: ChildNode::Branch { hash: [0; 32] },
                },
            );
            node.touch |= bit;
            let branch = self.create(q);
            branch.children.insert(old_nibble, old_entry);
            branch.touch |= 1 << old_nibble;
            if tail.len() == common {
                branch.value = Some((key.to_vec(), h));
                branch.value_touched = true;
            } else {
                branch.children.insert(
                    tail[common],
                    Child {
                        ext: tail[common + 1..].to_vec(),
                        node: ChildNode::Leaf {
                            key: key.to_vec(),
                            hash: h,
                        },
                    },
                );
                branch.touch |= 1 << tail[common];
            }
            break;
        }

        // Unwind: collapse or remove emptied nodes so only genuine
        // branching points stay stored.
        let mut current = prefix;
        while let Some((parent_prefix, nibble)) = stack.pop() {
            let node = match self.load(&current)? {
                Some(node) => node,
                None => break,
            };
            let replacement = if node.is_empty() {
                Some(None)
            } else if node.value.is_none() && node.children.len() == 1 {
                let (cn, child) = node.children.iter().next().expect("one child");
                Some(Some((*cn, child.clone())))
            } else if node.children.is_empty() {
                let (lk, lh) = node.value.clone().expect("value present");
                Some(Some((
                    // Sentinel: collapse a value-only node into a plain
                    // leaf in the parent; nibble unused.
                    16,
                    Child {
                        ext: Vec::new(),
                        node: ChildNode::Leaf { key: lk, hash: lh },
                    },
                )))
            } else {
                None
            };

            if let Some(repl) = replacement {
                let parent = self
                    .load(&parent_prefix)?
                    .ok_or_else(|| Error::MissingBranch(parent_prefix.clone()))?;
                let bit = 1u16 << nibble;
                match repl {
                    None => {
                        parent.children.remove(&nibble);
                        parent.touch |= bit;
                    }
                    Some((cn, child)) => {
                        let old = parent
                            .children
                            .get(&nibble)
                            .ok_or_else(|| Error::MissingBranch(parent_prefix.clone()))?;
                        let mut ext = old.ext.clone();
                        if cn < 16 {
                            ext.push(cn);
                        }
                        ext.extend_from_slice(&child.ext);
                        parent.children.insert(
                            nibble,
                            Child {
                                ext,
                                node: child.node,
                            },
                        );
                        parent.touch |= bit;
                    }
                }
                self.delete(&current.clone());
            }
            current = parent_prefix;
        }
        Ok(())
    }

    /// Rehash bottom-up and emit one delta per changed prefix.
    fn finalize(mut self) -> ([u8; 32], BTreeMap<Vec<u8>, Vec<u8>>) {
        let mut prefixes: Vec<Vec<u8>> = self.cache.keys().cloned().collect();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut new_hashes: BTreeMap<Vec<u8>, [u8; 32]> = BTreeMap::new();
        for prefix in &prefixes {
            let entry = self.cache.get(prefix).expect("cached");
            // Refresh branch-child hashes recomputed below this node.
            let mut refreshed: Vec<(u8, [u8; 32])> = Vec::new();
            for (n, child) in &entry.node.children {
                if let ChildNode::Branch { hash } = &child.node {
                    let mut q = prefix.clone();
                    q.push(*n);
                    q.extend_from_slice(&child.ext);
                    if let Some(new) = new_hashes.get(&q) {
                        if new != hash {
                            refreshed.push((*n, *new));
                        }
                    }
                }
            }
            let entry = self.cache.get_mut(prefix).expect("cached");
            for (n, hash) in refreshed {
                if let Some(child) = entry.node.children.get_mut(&n) {
                    child.node = ChildNode::Branch { hash };
                    entry.node.touch |= 1 << n;
                }
            }
            let hash = entry.node.hash(prefix, &new_hashes);
            new_hashes.insert(prefix.clone(), hash);
        }

        let mut updates = BTreeMap::new();
        for (prefix, entry) in &self.cache {
            if entry.node.touch == 0 && !entry.node.value_touched && entry.loaded {
                continue;
            }
            updates.insert(node_key(prefix), entry.node.encode_delta());
        }
        for prefix in &self.deleted {
            let mut tombstone = Vec::new();
            tombstone.extend_from_slice(&0xffffu16.to_be_bytes());
            tombstone.extend_from_slice(&0u16.to_be_bytes());
            tombstone.push(2);
            updates.insert(node_key(prefix), tombstone);
        }

        let root = match self.cache.get(&Vec::new()) {
            Some(entry) if !entry.node.is_empty() => new_hashes[&Vec::new()],
            Some(_) => empty_root(),
            None => empty_root(),
        };
        (root, updates)
    }
}

/// Root hash of the stored trie without applying any updates.
fn stored_root(reader: &dyn StateReader) -> Result<[u8; 32], Error> {
    match reader.branch(&node_key(&[]))? {
        Some(data) if !data.is_empty() => {
            let d = decode(&data, &[])?;
            if !is_live(&d) {
                return Ok(empty_root());
            }
            let node = Node {
                children: d.children,
                value: d.value,
                touch: 0,
                value_touched: false,
            };
            Ok(node.hash(&[], &BTreeMap::new()))
        }
        _ => Ok(empty_root()),
    }
}

/// The commitment domain plus the trie bookkeeping above it.
pub struct CommittedDomain {
    pub domain: Domain,
    mode: CommitmentMode,
    variant: TrieVariant,
    pub branch_merger: BranchMerger,
    touched: BTreeMap<Vec<u8>, TouchKind>,
}

impl CommittedDomain {
    pub fn new(domain: Domain, mode: CommitmentMode, variant: TrieVariant) -> Self {
        Self {
            domain,
            mode,
            variant,
            branch_merger: BranchMerger,
            touched: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> CommitmentMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CommitmentMode) {
        self.mode = mode;
    }

    pub fn variant(&self) -> TrieVariant {
        self.variant
    }

    pub fn touch_account(&mut self, addr: &[u8]) {
        self.touched.insert(addr.to_vec(), TouchKind::Account);
    }

    /// Code changes hash into the account leaf.
    pub fn touch_code(&mut self, addr: &[u8]) {
        self.touched.insert(addr.to_vec(), TouchKind::Account);
    }

    pub fn touch_storage(&mut self, key: &[u8]) {
        self.touched.insert(key.to_vec(), TouchKind::Storage);
    }

    pub fn has_touches(&self) -> bool {
        !self.touched.is_empty()
    }

    /// Fold the touched keys into the trie. Returns the root and the
    /// branch deltas to merge into the commitment domain.
    pub fn compute_commitment(
        &mut self,
        reader: &dyn StateReader,
        trace_updates: bool,
    ) -> Result<([u8; 32], BTreeMap<Vec<u8>, Vec<u8>>), Error> {
        if self.mode == CommitmentMode::Disabled {
            self.touched.clear();
            return Ok((empty_root(), BTreeMap::new()));
        }
        let touched = std::mem::take(&mut self.touched);
        if touched.is_empty() {
            return Ok((stored_root(reader)?, BTreeMap::new()));
        }

        let mut overlay = Overlay::new(reader);
        for (key, kind) in &touched {
            let payload = match kind {
                TouchKind::Account => reader.account_leaf(key)?,
                TouchKind::Storage => reader.storage_leaf(key)?,
            };
            let hash = payload.map(|p| leaf_hash(key, &p));
            overlay.apply(key, hash)?;
        }
        let (root, updates) = overlay.finalize();
        if trace_updates {
            for (prefix, update) in &updates {
                trace!(prefix = ?prefix, len = update.len(), "branch update");
            }
        }
        Ok((root, updates))
    }

    /// Persist the `(blockNum, txNum, root)` recovery marker.
    pub fn store_state(
        &mut self,
        tx: &dyn RwTx,
        ctx: &DomainContext,
        block_num: u64,
        tx_num: u64,
        root: &[u8; 32],
    ) -> Result<(), Error> {
        let mut value = Vec::with_capacity(48);
        value.extend_from_slice(&block_num.to_be_bytes());
        value.extend_from_slice(&tx_num.to_be_bytes());
        value.extend_from_slice(root);
        self.domain.put(tx, ctx, STATE_KEY, &value)?;
        Ok(())
    }

    /// Newest persisted recovery marker with `txNum <= files_tx_num`.
    pub fn seek_state(
        ctx: &DomainContext,
        files_tx_num: u64,
        tx: &dyn Tx,
    ) -> Result<Option<(u64, u64, [u8; 32])>, Error> {
        if let Some(value) = ctx.get_latest(STATE_KEY, tx)? {
            let state = decode_state(&value)?;
            if state.1 <= files_tx_num {
                return Ok(Some(state));
            }
        }
        match ctx.get_before_tx_num(STATE_KEY, files_tx_num.saturating_add(1), tx)? {
            Some(value) => Ok(Some(decode_state(&value)?)),
            None => Ok(None),
        }
    }
}

fn decode_state(value: &[u8]) -> Result<(u64, u64, [u8; 32]), Error> {
    if value.len() != 48 {
        return Err(Error::CorruptState);
    }
    let block = u64::from_be_bytes(value[..8].try_into().expect("sized"));
    let tx_num = u64::from_be_bytes(value[8..16].try_into().expect("sized"));
    let root = value[16..48].try_into().expect("sized");
    Ok((block, tx_num, root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Stored branches plus flat state, standing in for the aggregator's
    /// reader context.
    #[derive(Default)]
    struct MockState {
        branches: RefCell<HashMap<Vec<u8>, Vec<u8>>>,
        accounts: HashMap<Vec<u8>, Vec<u8>>,
        storage: HashMap<Vec<u8>, Vec<u8>>,
    }

    impl StateReader for MockState {
        fn branch(&self, prefix_key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
            Ok(self.branches.borrow().get(prefix_key).cloned())
        }
        fn account_leaf(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
            Ok(self.accounts.get(key).cloned())
        }
        fn storage_leaf(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
            Ok(self.storage.get(key).cloned())
        }
    }

    impl MockState {
        fn commit(&self, updates: &BTreeMap<Vec<u8>, Vec<u8>>) {
            let merger = BranchMerger;
            let mut branches = self.branches.borrow_mut();
            for (key, update) in updates {
                let stated = branches.get(key).cloned();
                let merged = merger.merge(stated.as_deref(), update).unwrap();
                branches.insert(key.clone(), merged);
            }
        }
    }

    fn compute(state: &mut MockState, touches: &[(&[u8], TouchKind)]) -> [u8; 32] {
        let mut overlay = Overlay::new(&*state);
        for (key, kind) in touches {
            let payload = match kind {
                TouchKind::Account => state.accounts.get(*key).cloned(),
                TouchKind::Storage => state.storage.get(*key).cloned(),
            };
            let hash = payload.map(|p| leaf_hash(key, &p));
            overlay.apply(key, hash).unwrap();
        }
        let (root, updates) = overlay.finalize();
        state.commit(&updates);
        root
    }

    #[test]
    fn empty_trie_has_constant_root() {
        let mut state = MockState::default();
        let root = compute(&mut state, &[]);
        assert_eq!(root, empty_root());
    }

    #[test]
    fn incremental_equals_batch() {
        // Keys engineered to share prefixes, forcing splits and deep
        // branches.
        let keys: Vec<Vec<u8>> = vec![
            b"\x11\x22\x33".to_vec(),
            b"\x11\x22\x44".to_vec(),
            b"\x11\x99".to_vec(),
            b"\x80".to_vec(),
            b"\x11\x22".to_vec(), // prefix of the first two
        ];

        // Batch: all keys in one round.
        let mut batch = MockState::default();
        for (i, k) in keys.iter().enumerate() {
            batch.accounts.insert(k.clone(), vec![i as u8 + 1]);
        }
        let touches: Vec<(&[u8], TouchKind)> = keys
            .iter()
            .map(|k| (k.as_slice(), TouchKind::Account))
            .collect();
        let batch_root = compute(&mut batch, &touches);

        // Incremental: one key per round, merged through stored branches.
        let mut inc = MockState::default();
        let mut inc_root = empty_root();
        for (i, k) in keys.iter().enumerate() {
            inc.accounts.insert(k.clone(), vec![i as u8 + 1]);
            inc_root = compute(&mut inc, &[(k.as_slice(), TouchKind::Account)]);
        }
        assert_eq!(batch_root, inc_root);
        assert_ne!(batch_root, empty_root());
    }

    #[test]
    fn update_changes_root_and_is_order_independent() {
        let mut a = MockState::default();
        a.accounts.insert(b"k1".to_vec(), b"v1".to_vec());
        a.accounts.insert(b"k2".to_vec(), b"v2".to_vec());
        let root_a = compute(
            &mut a,
            &[
                (b"k1".as_slice(), TouchKind::Account),
                (b"k2".as_slice(), TouchKind::Account),
            ],
        );

        let mut b = MockState::default();
        b.accounts.insert(b"k1".to_vec(), b"v1".to_vec());
        b.accounts.insert(b"k2".to_vec(), b"v2".to_vec());
        let r1 = compute(&mut b, &[(b"k2".as_slice(), TouchKind::Account)]);
        assert_ne!(r1, root_a);
        let root_b = compute(&mut b, &[(b"k1".as_slice(), TouchKind::Account)]);
        assert_eq!(root_a, root_b);

        // Changing a value changes the root.
        a.accounts.insert(b"k1".to_vec(), b"other".to_vec());
        let root_c = compute(&mut a, &[(b"k1".as_slice(), TouchKind::Account)]);
        assert_ne!(root_c, root_a);
    }

    #[test]
    fn delete_restores_previous_root() {
        let mut state = MockState::default();
        state.accounts.insert(b"\x11\x22".to_vec(), b"a".to_vec());
        let root_one = compute(&mut state, &[(b"\x11\x22".as_slice(), TouchKind::Account)]);

        state.accounts.insert(b"\x11\x23".to_vec(), b"b".to_vec());
        let root_two = compute(&mut state, &[(b"\x11\x23".as_slice(), TouchKind::Account)]);
        assert_ne!(root_one, root_two);

        state.accounts.remove(b"\x11\x23".as_slice());
        let root_back = compute(&mut state, &[(b"\x11\x23".as_slice(), TouchKind::Account)]);
        assert_eq!(root_back, root_one);

        state.accounts.remove(b"\x11\x22".as_slice());
        let root_empty = compute(&mut state, &[(b"\x11\x22".as_slice(), TouchKind::Account)]);
        assert_eq!(root_empty, empty_root());
    }

    #[test]
    fn accounts_and_storage_are_distinct_leaves() {
        let mut state = MockState::default();
        state.accounts.insert(b"addr".to_vec(), b"acct".to_vec());
        state
            .storage
            .insert(b"addrslot".to_vec(), b"value".to_vec());
        let root = compute(
            &mut state,
            &[
                (b"addr".as_slice(), TouchKind::Account),
                (b"addrslot".as_slice(), TouchKind::Storage),
            ],
        );
        assert_ne!(root, empty_root());

        // Clearing the slot changes the root; the account alone remains.
        state.storage.remove(b"addrslot".as_slice());
        let root2 = compute(&mut state, &[(b"addrslot".as_slice(), TouchKind::Storage)]);
        assert_ne!(root, root2);
    }

    #[test]
    fn state_marker_roundtrip() {
        let root = [7u8; 32];
        let mut value = Vec::new();
        value.extend_from_slice(&3u64.to_be_bytes());
        value.extend_from_slice(&77u64.to_be_bytes());
        value.extend_from_slice(&root);
        assert_eq!(decode_state(&value).unwrap(), (3, 77, root));
        assert!(decode_state(&value[..40]).is_err());
    }
}
