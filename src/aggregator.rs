//! Orchestrates four domains and four inverted indices in lockstep.
//!
//! The aggregator is single-writer: one caller thread drives `set_tx_num`,
//! the update methods and `finish_tx`. On each step boundary
//! (`txNum + 1 ≡ 0 mod step`) it computes the commitment root, flushes the
//! write buffers, collates the closed step into files for every column
//! (domains serially against the shared cursors, indices in parallel),
//! prunes the KV-resident copy and runs merge passes until no adjacent
//! files remain. A bounded notification channel carries one root per
//! completed non-empty step.
//!
//! Reader contexts pin a snapshot of every column's files; merge outputs
//! become visible only to contexts opened afterwards, and retired inputs
//! are removed from disk when the last context releases them.

use crate::{
    commitment::{self, CommitmentMode, CommittedDomain, StateReader, TrieVariant},
    domain::{Collation, Domain, DomainContext, DomainRanges},
    history,
    inverted_index::{self, IndexContext, InvertedIndex, PostingIter},
    kv::{self, DomainTables, IndexTables, MemKv, RwTx, Tx},
    wal, CancelToken, STEPS_IN_BIGGEST_FILE,
};
use parking_lot::Mutex;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{mpsc, Arc},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("domain error: {0}")]
    Domain(#[from] crate::domain::Error),
    #[error("history error: {0}")]
    History(#[from] history::Error),
    #[error("index error: {0}")]
    Index(#[from] inverted_index::Error),
    #[error("commitment error: {0}")]
    Commitment(#[from] commitment::Error),
    #[error("kv error: {0}")]
    Kv(#[from] kv::Error),
    #[error("wal error: {0}")]
    Wal(#[from] wal::Error),
    #[error("no active write transaction")]
    NoTransaction,
    #[error("writes not started")]
    WritesNotStarted,
    #[error("thread pool: {0}")]
    Pool(String),
}

/// Aggregator-level counters, registered into a caller-provided registry.
#[derive(Clone)]
struct Metrics {
    tx_processed: Counter,
    collations: Counter,
    built_files: Counter,
    prunes: Counter,
    merges: Counter,
    running_merges: Gauge,
}

impl Metrics {
    fn new() -> Self {
        Self {
            tx_processed: Counter::default(),
            collations: Counter::default(),
            built_files: Counter::default(),
            prunes: Counter::default(),
            merges: Counter::default(),
            running_merges: Gauge::default(),
        }
    }

    fn register(&self, registry: &mut Registry) {
        registry.register(
            "txs_processed",
            "Transactions finished",
            self.tx_processed.clone(),
        );
        registry.register("collations", "Step collations run", self.collations.clone());
        registry.register("built_files", "Frozen files built", self.built_files.clone());
        registry.register("prunes", "Prune passes run", self.prunes.clone());
        registry.register("merges", "Merge steps completed", self.merges.clone());
        registry.register(
            "running_merges",
            "Merge steps in flight",
            self.running_merges.clone(),
        );
    }
}

/// Per-column merge work found by one merge pass.
#[derive(Clone, Copy, Debug, Default)]
struct Ranges {
    accounts: DomainRanges,
    storage: DomainRanges,
    code: DomainRanges,
    commitment: DomainRanges,
    log_addrs: Option<(u64, u64)>,
    log_topics: Option<(u64, u64)>,
    traces_from: Option<(u64, u64)>,
    traces_to: Option<(u64, u64)>,
}

impl Ranges {
    fn any(&self) -> bool {
        self.accounts.any()
            || self.storage.any()
            || self.code.any()
            || self.commitment.any()
            || self.log_addrs.is_some()
            || self.log_topics.is_some()
            || self.traces_from.is_some()
            || self.traces_to.is_some()
    }
}

/// The state engine: four domains, four indices, one writer.
pub struct Aggregator {
    aggregation_step: u64,
    accounts: Domain,
    storage: Domain,
    code: Domain,
    commitment: CommittedDomain,
    log_addrs: InvertedIndex,
    log_topics: InvertedIndex,
    traces_from: InvertedIndex,
    traces_to: InvertedIndex,
    tx_num: u64,
    block_num: u64,
    seek_tx_num: u64,
    rw_tx: Option<Arc<dyn RwTx>>,
    default_ctx: Option<ReaderContext>,
    roots_tx: mpsc::SyncSender<[u8; 32]>,
    roots_rx: Mutex<Option<mpsc::Receiver<[u8; 32]>>>,
    pool: rayon::ThreadPool,
    metrics: Metrics,
}

const DOMAIN_BASES: [&str; 4] = ["accounts", "storage", "code", "commitment"];
const INDEX_BASES: [&str; 4] = ["logaddrs", "logtopics", "tracesfrom", "tracesto"];

impl Aggregator {
    pub fn new(
        dir: impl AsRef<Path>,
        tmpdir: impl AsRef<Path>,
        aggregation_step: u64,
        commitment_mode: CommitmentMode,
        trie_variant: TrieVariant,
    ) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        let tmpdir = tmpdir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(&tmpdir)?;

        let mk_domain = |base: &str, compress: bool| {
            Domain::new(
                &dir,
                &tmpdir,
                aggregation_step,
                base,
                DomainTables::new(base),
                compress,
            )
        };
        let mk_index = |base: &str| {
            InvertedIndex::new(
                &dir,
                &tmpdir,
                aggregation_step,
                base,
                IndexTables::new(base),
                Vec::new(),
            )
        };

        let (roots_tx, roots_rx) = mpsc::sync_channel(1);
        Ok(Self {
            aggregation_step,
            accounts: mk_domain("accounts", false),
            storage: mk_domain("storage", false),
            code: mk_domain("code", true),
            commitment: CommittedDomain::new(
                mk_domain("commitment", false),
                commitment_mode,
                trie_variant,
            ),
            log_addrs: mk_index("logaddrs"),
            log_topics: mk_index("logtopics"),
            traces_from: mk_index("tracesfrom"),
            traces_to: mk_index("tracesto"),
            tx_num: 0,
            block_num: 0,
            seek_tx_num: 0,
            rw_tx: None,
            default_ctx: None,
            roots_tx,
            roots_rx: Mutex::new(Some(roots_rx)),
            pool: rayon::ThreadPoolBuilder::new()
                .build()
                .map_err(|e| Error::Pool(e.to_string()))?,
            metrics: Metrics::new(),
        })
    }

    /// `(table, dup_sorted)` for every table the aggregator requires.
    pub fn tables() -> Vec<(String, bool)> {
        let mut out = Vec::new();
        for base in DOMAIN_BASES {
            let tables = DomainTables::new(base);
            for (name, dup) in tables.all() {
                out.push((name.to_string(), dup));
            }
        }
        for base in INDEX_BASES {
            let tables = IndexTables::new(base);
            for (name, dup) in tables.all() {
                out.push((name.to_string(), dup));
            }
        }
        out
    }

    /// Create every required table in the bundled in-memory store.
    pub fn create_tables(kv: &MemKv) {
        for (name, dup) in Self::tables() {
            kv.create_table(&name, dup);
        }
    }

    pub fn register_metrics(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    /// Open every usable state file found in the data directory.
    pub fn reopen_folder(&mut self) -> Result<(), Error> {
        self.accounts.open_folder()?;
        self.storage.open_folder()?;
        self.code.open_folder()?;
        self.commitment.domain.open_folder()?;
        self.log_addrs.open_folder()?;
        self.log_topics.open_folder()?;
        self.traces_from.open_folder()?;
        self.traces_to.open_folder()?;
        self.seek_tx_num = self.end_tx_num_minimax();
        Ok(())
    }

    pub fn set_tx(&mut self, tx: Arc<dyn RwTx>) {
        self.rw_tx = Some(tx);
    }

    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
        self.accounts.set_tx_num(tx_num);
        self.storage.set_tx_num(tx_num);
        self.code.set_tx_num(tx_num);
        self.commitment.domain.set_tx_num(tx_num);
        self.log_addrs.set_tx_num(tx_num);
        self.log_topics.set_tx_num(tx_num);
        self.traces_from.set_tx_num(tx_num);
        self.traces_to.set_tx_num(tx_num);
    }

    pub fn set_block_num(&mut self, block_num: u64) {
        self.block_num = block_num;
    }

    pub fn set_workers(&mut self, workers: usize) -> Result<(), Error> {
        self.pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;
        Ok(())
    }

    pub fn set_commitment_mode(&mut self, mode: CommitmentMode) {
        self.commitment.set_mode(mode);
    }

    /// Begin buffering writes and open the default reader context.
    pub fn start_writes(&mut self) {
        self.start_writes_with(wal::Mode::Buffered);
    }

    /// Drop all history and index writes; tests and history-free modes.
    pub fn discard_history(&mut self) {
        self.start_writes_with(wal::Mode::Discard);
    }

    fn start_writes_with(&mut self, mode: wal::Mode) {
        self.accounts.start_writes(mode);
        self.storage.start_writes(mode);
        self.code.start_writes(mode);
        self.commitment.domain.start_writes(mode);
        self.log_addrs.start_writes(mode);
        self.log_topics.start_writes(mode);
        self.traces_from.start_writes(mode);
        self.traces_to.start_writes(mode);
        self.refresh_default_ctx();
    }

    pub fn finish_writes(&mut self) {
        self.accounts.finish_writes();
        self.storage.finish_writes();
        self.code.finish_writes();
        self.commitment.domain.finish_writes();
        self.log_addrs.finish_writes();
        self.log_topics.finish_writes();
        self.traces_from.finish_writes();
        self.traces_to.finish_writes();
        self.default_ctx = None;
    }

    fn refresh_default_ctx(&mut self) {
        self.default_ctx = Some(self.make_context());
    }

    /// Smallest endTxNum across every column's files: the txNum to which
    /// files are already built.
    pub fn end_tx_num_minimax(&self) -> u64 {
        [
            self.accounts.end_tx_num_max(),
            self.storage.end_tx_num_max(),
            self.code.end_tx_num_max(),
            self.commitment.domain.end_tx_num_max(),
            self.log_addrs.end_tx_num_max(),
            self.log_topics.end_tx_num_max(),
            self.traces_from.end_tx_num_max(),
            self.traces_to.end_tx_num_max(),
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
    }

    /// Replay the commitment recovery marker: position the engine just
    /// past the newest persisted `(blockNum, txNum)` covered by files.
    /// Returns the txNum to resume writing from.
    pub fn seek_commitment(&mut self) -> Result<u64, Error> {
        let files_tx = self.end_tx_num_minimax();
        let tx = self.rw_tx.clone().ok_or(Error::NoTransaction)?;
        let ctx = self.default_ctx.as_ref().ok_or(Error::WritesNotStarted)?;
        let Some((block_num, tx_num, _root)) =
            CommittedDomain::seek_state(&ctx.commitment, files_tx, &*tx)?
        else {
            return Ok(0);
        };
        self.block_num = block_num;
        self.seek_tx_num = tx_num + 1;
        info!(block_num, tx_num, "resuming from commitment marker");
        Ok(tx_num + 1)
    }

    fn tx(&self) -> Result<Arc<dyn RwTx>, Error> {
        self.rw_tx.clone().ok_or(Error::NoTransaction)
    }

    pub fn update_account_data(&mut self, addr: &[u8], account: &[u8]) -> Result<(), Error> {
        let tx = self.tx()?;
        let ctx = self.default_ctx.as_ref().ok_or(Error::WritesNotStarted)?;
        self.commitment.touch_account(addr);
        self.accounts.put(&*tx, &ctx.accounts, addr, account)?;
        Ok(())
    }

    pub fn update_account_code(&mut self, addr: &[u8], code: &[u8]) -> Result<(), Error> {
        let tx = self.tx()?;
        let ctx = self.default_ctx.as_ref().ok_or(Error::WritesNotStarted)?;
        self.commitment.touch_code(addr);
        if code.is_empty() {
            self.code.delete(&*tx, &ctx.code, addr)?;
        } else {
            self.code.put(&*tx, &ctx.code, addr, code)?;
        }
        Ok(())
    }

    pub fn update_commitment_data(&mut self, prefix: &[u8], data: &[u8]) -> Result<(), Error> {
        let tx = self.tx()?;
        let ctx = self.default_ctx.as_ref().ok_or(Error::WritesNotStarted)?;
        self.commitment.domain.put(&*tx, &ctx.commitment, prefix, data)?;
        Ok(())
    }

    pub fn delete_account(&mut self, addr: &[u8]) -> Result<(), Error> {
        let tx = self.tx()?;
        let ctx = self.default_ctx.as_ref().ok_or(Error::WritesNotStarted)?;
        self.commitment.touch_account(addr);
        self.accounts.delete(&*tx, &ctx.accounts, addr)?;
        self.code.delete(&*tx, &ctx.code, addr)?;

        let slots: Vec<Vec<u8>> = ctx
            .storage
            .iterate_prefix(addr, &*tx)?
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<Result<_, _>>()?;
        for key in slots {
            self.commitment.touch_storage(&key);
            self.storage.delete(&*tx, &ctx.storage, &key)?;
        }
        Ok(())
    }

    pub fn write_account_storage(
        &mut self,
        addr: &[u8],
        loc: &[u8],
        value: &[u8],
    ) -> Result<(), Error> {
        let tx = self.tx()?;
        let ctx = self.default_ctx.as_ref().ok_or(Error::WritesNotStarted)?;
        let mut key = Vec::with_capacity(addr.len() + loc.len());
        key.extend_from_slice(addr);
        key.extend_from_slice(loc);
        self.commitment.touch_storage(&key);
        if value.is_empty() {
            self.storage.delete(&*tx, &ctx.storage, &key)?;
        } else {
            self.storage.put(&*tx, &ctx.storage, &key, value)?;
        }
        Ok(())
    }

    pub fn add_log_addr(&mut self, addr: &[u8]) -> Result<(), Error> {
        self.log_addrs.add(addr)?;
        Ok(())
    }

    pub fn add_log_topic(&mut self, topic: &[u8]) -> Result<(), Error> {
        self.log_topics.add(topic)?;
        Ok(())
    }

    pub fn add_trace_from(&mut self, addr: &[u8]) -> Result<(), Error> {
        self.traces_from.add(addr)?;
        Ok(())
    }

    pub fn add_trace_to(&mut self, addr: &[u8]) -> Result<(), Error> {
        self.traces_to.add(addr)?;
        Ok(())
    }

    /// Load every buffered write into the KV store. Must run before the
    /// closed step is collated.
    pub fn flush(&mut self) -> Result<(), Error> {
        let tx = self.tx()?;
        for flusher in [
            self.accounts.rotate_wal(),
            self.storage.rotate_wal(),
            self.code.rotate_wal(),
            self.commitment.domain.rotate_wal(),
        ] {
            flusher.flush(&*tx)?;
        }
        for rotated in [
            self.log_addrs.rotate_wal(),
            self.log_topics.rotate_wal(),
            self.traces_from.rotate_wal(),
            self.traces_to.rotate_wal(),
        ] {
            if let Some(w) = rotated {
                w.flush(&*tx)?;
            }
        }
        Ok(())
    }

    /// Fold the touched keys into the Patricia trie, merge the branch
    /// deltas into the commitment domain and return the root.
    pub fn compute_commitment(
        &mut self,
        save_state: bool,
        trace: bool,
    ) -> Result<[u8; 32], Error> {
        let tx = self.tx()?;
        let ctx = self.default_ctx.as_ref().ok_or(Error::WritesNotStarted)?;
        let reader = ContextStateReader { ctx, tx: &*tx };
        let (root, updates) = self.commitment.compute_commitment(&reader, trace)?;

        for (prefix, update) in &updates {
            let stated = ctx.commitment.get_latest(prefix, &*tx)?;
            let merged = self
                .commitment
                .branch_merger
                .merge(stated.as_deref(), update)?;
            if stated.as_deref() == Some(merged.as_slice()) {
                continue;
            }
            self.commitment
                .domain
                .put(&*tx, &ctx.commitment, prefix, &merged)?;
        }

        // Replay below the file ceiling must not move the marker.
        if save_state && self.seek_tx_num <= self.tx_num && !updates.is_empty() {
            let (block_num, tx_num) = (self.block_num, self.tx_num);
            self.commitment
                .store_state(&*tx, &ctx.commitment, block_num, tx_num, &root)?;
        }
        Ok(root)
    }

    pub fn ready_to_finish_tx(&self) -> bool {
        (self.tx_num + 1) % self.aggregation_step == 0 && self.seek_tx_num < self.tx_num
    }

    /// Close the current transaction. On a step boundary this computes the
    /// commitment, freezes the previous step into files, prunes, merges
    /// and emits the root.
    pub fn finish_tx(&mut self) -> Result<(), Error> {
        self.metrics.tx_processed.inc();
        if !self.ready_to_finish_tx() {
            return Ok(());
        }
        let root = self.compute_commitment(true, false)?;
        let step = self.tx_num / self.aggregation_step;
        if step == 0 {
            self.notify_aggregated(&root);
            return Ok(());
        }
        let step = step - 1; // leave one step worth in the DB
        self.flush()?;
        let aggregated = self.aggregate(step)?;
        self.seek_tx_num = self.end_tx_num_minimax();
        self.merge_all()?;
        if aggregated {
            self.notify_aggregated(&root);
        }
        Ok(())
    }

    /// One commitment root per completed non-empty step. Take-once.
    pub fn aggregated_roots(&self) -> Option<mpsc::Receiver<[u8; 32]>> {
        self.roots_rx.lock().take()
    }

    fn notify_aggregated(&self, root: &[u8; 32]) {
        let _ = self.roots_tx.try_send(*root);
    }

    /// Freeze step `step` into files for every column and prune the
    /// KV-resident copy. Returns false when the step carried no writes at
    /// all (then nothing is produced).
    fn aggregate(&mut self, step: u64) -> Result<bool, Error> {
        let tx = self.tx()?;
        let tx_from = step * self.aggregation_step;
        let tx_to = (step + 1) * self.aggregation_step;
        let cancel = CancelToken::new();
        let started = Instant::now();

        // Domains collate serially against the shared cursors...
        let domains: [&Domain; 4] = [
            &self.accounts,
            &self.storage,
            &self.code,
            &self.commitment.domain,
        ];
        let mut domain_collations: Vec<Collation> = Vec::with_capacity(4);
        for d in domains {
            self.metrics.collations.inc();
            match d.collate_stream(&*tx, step, tx_from, tx_to, &cancel) {
                Ok(c) => domain_collations.push(c),
                Err(e) => {
                    for c in domain_collations {
                        c.close();
                    }
                    return Err(e.into());
                }
            }
        }

        // ...the indices collate in parallel.
        let indices: [&InvertedIndex; 4] = [
            &self.log_addrs,
            &self.log_topics,
            &self.traces_from,
            &self.traces_to,
        ];
        let mut index_slots: [Option<
            Result<BTreeMap<Vec<u8>, Vec<u64>>, inverted_index::Error>,
        >; 4] = [None, None, None, None];
        self.pool.in_place_scope(|scope| {
            for (slot, ii) in index_slots.iter_mut().zip(indices) {
                let tx = tx.clone();
                let cancel = cancel.clone();
                scope.spawn(move |_| {
                    *slot = Some(ii.collate(&*tx, tx_from, tx_to, &cancel));
                });
            }
        });
        let mut index_maps = Vec::with_capacity(4);
        for slot in index_slots {
            match slot.expect("collation task completed") {
                Ok(map) => index_maps.push(map),
                Err(e) => {
                    for c in domain_collations {
                        c.close();
                    }
                    return Err(e.into());
                }
            }
        }

        if domain_collations.iter().all(|c| c.is_empty())
            && index_maps.iter().all(|m| m.is_empty())
        {
            debug!(step, "empty step, nothing to aggregate");
            return Ok(false);
        }

        // Build every column in parallel; prune behind the builds on this
        // thread. A failing worker cancels its siblings.
        let (err_tx, err_rx) = mpsc::channel::<Error>();
        let metrics = &self.metrics;
        self.pool.in_place_scope(|scope| {
            for (d, collation) in domains.into_iter().zip(domain_collations) {
                let cancel = cancel.clone();
                let err_tx = err_tx.clone();
                scope.spawn(move |_| match d.build_files(step, collation, &cancel) {
                    Ok(sf) => {
                        d.integrate_files(sf);
                        metrics.built_files.inc();
                    }
                    Err(e) => {
                        cancel.cancel();
                        let _ = err_tx.send(e.into());
                    }
                });
            }
            for (ii, map) in indices.into_iter().zip(&index_maps) {
                let cancel = cancel.clone();
                let err_tx = err_tx.clone();
                scope.spawn(move |_| match ii.build_files(step, map, &cancel) {
                    Ok(item) => {
                        ii.integrate_files(item);
                        metrics.built_files.inc();
                    }
                    Err(e) => {
                        cancel.cancel();
                        let _ = err_tx.send(e.into());
                    }
                });
            }

            for d in domains {
                metrics.prunes.inc();
                if let Err(e) = d.prune(&*tx, step, tx_from, tx_to, u64::MAX, &cancel) {
                    cancel.cancel();
                    let _ = err_tx.send(e.into());
                    break;
                }
            }
            for ii in indices {
                metrics.prunes.inc();
                if let Err(e) = ii.prune(&*tx, tx_from, tx_to, u64::MAX, &cancel) {
                    cancel.cancel();
                    let _ = err_tx.send(e.into());
                    break;
                }
            }
        });
        drop(err_tx);
        if let Some(e) = err_rx.try_iter().next() {
            return Err(e);
        }
        info!(step, took = ?started.elapsed(), "aggregated step");
        Ok(true)
    }

    /// Run merge steps until no adjacent files remain, refreshing the
    /// default context between steps so each pass sees the previous
    /// outputs.
    fn merge_all(&mut self) -> Result<usize, Error> {
        let max_end = self.end_tx_num_minimax();
        let mut rounds = 0;
        loop {
            self.refresh_default_ctx();
            if !self.merge_loop_step(max_end)? {
                break;
            }
            rounds += 1;
        }
        if rounds > 0 {
            self.refresh_default_ctx();
        }
        Ok(rounds)
    }

    fn find_merge_ranges(&self, max_end: u64) -> Ranges {
        let max_span = self.aggregation_step * STEPS_IN_BIGGEST_FILE;
        Ranges {
            accounts: self.accounts.find_merge_range(max_end, max_span),
            storage: self.storage.find_merge_range(max_end, max_span),
            code: self.code.find_merge_range(max_end, max_span),
            commitment: self.commitment.domain.find_merge_range(max_end, max_span),
            log_addrs: self.log_addrs.find_merge_range(max_end, max_span),
            log_topics: self.log_topics.find_merge_range(max_end, max_span),
            traces_from: self.traces_from.find_merge_range(max_end, max_span),
            traces_to: self.traces_to.find_merge_range(max_end, max_span),
        }
    }

    /// One merge pass. The commitment domain merges strictly after the
    /// accounts and storage merges complete for the same batch.
    fn merge_loop_step(&mut self, max_end: u64) -> Result<bool, Error> {
        let r = self.find_merge_ranges(max_end);
        if !r.any() {
            return Ok(false);
        }
        let cancel = CancelToken::new();
        let ctx = self.default_ctx.as_ref().ok_or(Error::WritesNotStarted)?;
        self.metrics.running_merges.inc();
        let (err_tx, err_rx) = mpsc::channel::<Error>();
        let merged_any = std::sync::atomic::AtomicBool::new(false);

        // Task group one: everything except commitment.
        self.pool.in_place_scope(|scope| {
            let domain_jobs: [(&Domain, &DomainContext, DomainRanges); 3] = [
                (&self.accounts, &ctx.accounts, r.accounts),
                (&self.storage, &ctx.storage, r.storage),
                (&self.code, &ctx.code, r.code),
            ];
            for (d, dctx, ranges) in domain_jobs {
                if !ranges.any() {
                    continue;
                }
                let cancel = cancel.clone();
                let err_tx = err_tx.clone();
                let merged_any = &merged_any;
                scope.spawn(move |_| match merge_domain(d, dctx, ranges, &cancel) {
                    Ok(true) => {
                        merged_any.store(true, std::sync::atomic::Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        cancel.cancel();
                        let _ = err_tx.send(e);
                    }
                });
            }
            let index_jobs: [(&InvertedIndex, &IndexContext, Option<(u64, u64)>); 4] = [
                (&self.log_addrs, &ctx.log_addrs, r.log_addrs),
                (&self.log_topics, &ctx.log_topics, r.log_topics),
                (&self.traces_from, &ctx.traces_from, r.traces_from),
                (&self.traces_to, &ctx.traces_to, r.traces_to),
            ];
            for (ii, ictx, range) in index_jobs {
                let Some((from, to)) = range else { continue };
                let cancel = cancel.clone();
                let err_tx = err_tx.clone();
                let merged_any = &merged_any;
                scope.spawn(move |_| match merge_index(ii, ictx, from, to, &cancel) {
                    Ok(true) => {
                        merged_any.store(true, std::sync::atomic::Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        cancel.cancel();
                        let _ = err_tx.send(e);
                    }
                });
            }
        });

        // Task group two, behind the completion barrier above.
        let mut result = Ok(merged_any.load(std::sync::atomic::Ordering::Relaxed));
        drop(err_tx);
        if let Some(e) = err_rx.try_iter().next() {
            result = Err(e);
        } else if r.commitment.any() {
            result = merge_domain(&self.commitment.domain, &ctx.commitment, r.commitment, &cancel)
                .map(|did| did || merged_any.load(std::sync::atomic::Ordering::Relaxed));
        }
        self.metrics.running_merges.dec();
        if let Ok(true) = result {
            self.metrics.merges.inc();
        }
        result
    }

    /// Open a pinned reader snapshot over every column.
    pub fn make_context(&self) -> ReaderContext {
        ReaderContext {
            accounts: self.accounts.make_context(),
            storage: self.storage.make_context(),
            code: self.code.make_context(),
            commitment: self.commitment.domain.make_context(),
            log_addrs: self.log_addrs.make_context(),
            log_topics: self.log_topics.make_context(),
            traces_from: self.traces_from.make_context(),
            traces_to: self.traces_to.make_context(),
        }
    }

    /// Release contexts and write buffers. Files stay on disk.
    pub fn close(mut self) {
        self.default_ctx = None;
        self.accounts.close();
        self.storage.close();
        self.code.close();
        self.commitment.domain.close();
        self.log_addrs.close();
        self.log_topics.close();
        self.traces_from.close();
        self.traces_to.close();
    }
}

fn merge_domain(
    d: &Domain,
    ctx: &DomainContext,
    ranges: DomainRanges,
    cancel: &CancelToken,
) -> Result<bool, Error> {
    let mut did = false;
    if let Some((from, to)) = ranges.values {
        let inputs = d.value_files_in_range(ctx, from, to);
        if inputs.len() > 1 {
            let merged = d.merge_value_files(&inputs, from, to, cancel)?;
            d.integrate_merged_value_files(&inputs, merged);
            did = true;
        }
    }
    if let Some((from, to)) = ranges.history {
        let ef_inputs = d.history.index_files_in_range(&ctx.hc, from, to);
        let v_inputs = d.history.value_files_in_range(&ctx.hc, from, to);
        if ef_inputs.len() > 1 && ef_inputs.len() == v_inputs.len() {
            let (ef, v) = d.history.merge_files(&ef_inputs, &v_inputs, from, to, cancel)?;
            d.history.integrate_merged_files(&ef_inputs, &v_inputs, ef, v);
            did = true;
        }
    }
    Ok(did)
}

fn merge_index(
    ii: &InvertedIndex,
    ctx: &IndexContext,
    from: u64,
    to: u64,
    cancel: &CancelToken,
) -> Result<bool, Error> {
    let inputs = ii.files_in_range(ctx, from, to);
    if inputs.len() > 1 {
        let merged = ii.merge_files(&inputs, from, to, cancel)?;
        ii.integrate_merged_files(&inputs, merged);
        return Ok(true);
    }
    Ok(false)
}

/// Leaf resolution for the Patricia trie, reading through a context.
struct ContextStateReader<'a> {
    ctx: &'a ReaderContext,
    tx: &'a dyn Tx,
}

impl ContextStateReader<'_> {
    fn read_err(e: crate::domain::Error) -> commitment::Error {
        commitment::Error::StateRead(e.to_string())
    }
}

impl StateReader for ContextStateReader<'_> {
    fn branch(&self, prefix_key: &[u8]) -> Result<Option<Vec<u8>>, commitment::Error> {
        self.ctx
            .commitment
            .get_latest(prefix_key, self.tx)
            .map_err(Self::read_err)
    }

    fn account_leaf(&self, key: &[u8]) -> Result<Option<Vec<u8>>, commitment::Error> {
        let account = self
            .ctx
            .accounts
            .get_latest(key, self.tx)
            .map_err(Self::read_err)?;
        let code = self
            .ctx
            .code
            .get_latest(key, self.tx)
            .map_err(Self::read_err)?;
        if account.is_none() && code.is_none() {
            return Ok(None);
        }
        let account = account.unwrap_or_default();
        let mut payload = Vec::with_capacity(4 + account.len() + 32);
        payload.extend_from_slice(&(account.len() as u32).to_be_bytes());
        payload.extend_from_slice(&account);
        if let Some(code) = code {
            payload.extend_from_slice(&Sha256::digest(&code));
        }
        Ok(Some(payload))
    }

    fn storage_leaf(&self, key: &[u8]) -> Result<Option<Vec<u8>>, commitment::Error> {
        self.ctx
            .storage
            .get_latest(key, self.tx)
            .map_err(Self::read_err)
    }
}

/// Consistent reader over a pinned snapshot of every column's files.
///
/// Reads through the KV tables follow the isolation of the transaction
/// the caller passes in; merge outputs integrated after this context was
/// opened stay invisible to it.
pub struct ReaderContext {
    pub accounts: DomainContext,
    pub storage: DomainContext,
    pub code: DomainContext,
    pub commitment: DomainContext,
    log_addrs: IndexContext,
    log_topics: IndexContext,
    traces_from: IndexContext,
    traces_to: IndexContext,
}

impl ReaderContext {
    pub fn read_account_data(&self, addr: &[u8], tx: &dyn Tx) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.accounts.get_latest(addr, tx)?)
    }

    pub fn read_account_data_before_tx_num(
        &self,
        addr: &[u8],
        tx_num: u64,
        tx: &dyn Tx,
    ) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.accounts.get_before_tx_num(addr, tx_num, tx)?)
    }

    pub fn read_account_storage(
        &self,
        addr: &[u8],
        loc: &[u8],
        tx: &dyn Tx,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut key = Vec::with_capacity(addr.len() + loc.len());
        key.extend_from_slice(addr);
        key.extend_from_slice(loc);
        Ok(self.storage.get_latest(&key, tx)?)
    }

    pub fn read_account_storage_before_tx_num(
        &self,
        addr: &[u8],
        loc: &[u8],
        tx_num: u64,
        tx: &dyn Tx,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut key = Vec::with_capacity(addr.len() + loc.len());
        key.extend_from_slice(addr);
        key.extend_from_slice(loc);
        Ok(self.storage.get_before_tx_num(&key, tx_num, tx)?)
    }

    pub fn read_account_code(&self, addr: &[u8], tx: &dyn Tx) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.code.get_latest(addr, tx)?)
    }

    pub fn read_account_code_before_tx_num(
        &self,
        addr: &[u8],
        tx_num: u64,
        tx: &dyn Tx,
    ) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.code.get_before_tx_num(addr, tx_num, tx)?)
    }

    pub fn read_account_code_size(&self, addr: &[u8], tx: &dyn Tx) -> Result<usize, Error> {
        Ok(self.read_account_code(addr, tx)?.map_or(0, |c| c.len()))
    }

    pub fn read_account_code_size_before_tx_num(
        &self,
        addr: &[u8],
        tx_num: u64,
        tx: &dyn Tx,
    ) -> Result<usize, Error> {
        Ok(self
            .read_account_code_before_tx_num(addr, tx_num, tx)?
            .map_or(0, |c| c.len()))
    }

    pub fn read_commitment(&self, prefix: &[u8], tx: &dyn Tx) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.commitment.get_latest(prefix, tx)?)
    }

    pub fn read_commitment_before_tx_num(
        &self,
        prefix: &[u8],
        tx_num: u64,
        tx: &dyn Tx,
    ) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.commitment.get_before_tx_num(prefix, tx_num, tx)?)
    }

    /// Ascending txNums at which `addr` appeared in a log, within
    /// `[from_tx, to_tx)`.
    pub fn log_addr_iterator(
        &self,
        addr: &[u8],
        from_tx: u64,
        to_tx: u64,
        tx: &dyn Tx,
    ) -> Result<PostingIter, Error> {
        Ok(self.log_addrs.iterate_range(addr, from_tx, to_tx, None, tx)?)
    }

    pub fn log_topic_iterator(
        &self,
        topic: &[u8],
        from_tx: u64,
        to_tx: u64,
        tx: &dyn Tx,
    ) -> Result<PostingIter, Error> {
        Ok(self
            .log_topics
            .iterate_range(topic, from_tx, to_tx, None, tx)?)
    }

    pub fn trace_from_iterator(
        &self,
        addr: &[u8],
        from_tx: u64,
        to_tx: u64,
        tx: &dyn Tx,
    ) -> Result<PostingIter, Error> {
        Ok(self
            .traces_from
            .iterate_range(addr, from_tx, to_tx, None, tx)?)
    }

    pub fn trace_to_iterator(
        &self,
        addr: &[u8],
        from_tx: u64,
        to_tx: u64,
        tx: &dyn Tx,
    ) -> Result<PostingIter, Error> {
        Ok(self
            .traces_to
            .iterate_range(addr, from_tx, to_tx, None, tx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use primitive_types::U256;

    fn enc(nonce: u64, balance: u64) -> Vec<u8> {
        Account::new(nonce, U256::from(balance), None, 0).encode()
    }

    fn new_aggregator(dir: &Path, kv: &MemKv, step: u64) -> Aggregator {
        Aggregator::create_tables(kv);
        let mut agg = Aggregator::new(
            dir.join("data"),
            dir.join("tmp"),
            step,
            CommitmentMode::Direct,
            TrieVariant::HexPatricia,
        )
        .unwrap();
        agg.set_tx(Arc::new(kv.begin_rw()));
        agg.reopen_folder().unwrap();
        agg.start_writes();
        agg
    }

    #[test]
    fn account_update_and_first_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let kv = MemKv::new();
        let mut agg = new_aggregator(dir.path(), &kv, 4);
        let tx = kv.begin_rw();

        for t in 0..=7u64 {
            agg.set_tx_num(t);
            if t == 0 {
                agg.update_account_data(b"A", &enc(1, 10)).unwrap();
            }
            if t == 5 {
                agg.update_account_data(b"A", &enc(2, 20)).unwrap();
            }
            agg.finish_tx().unwrap();
        }

        // Step 0 is frozen: the file carries the first value.
        let kv_path = dir.path().join("data").join("accounts.0-1.kv");
        assert!(kv_path.exists());
        let seg = crate::seg::SegReader::open(&kv_path).unwrap();
        let mut g = seg.getter();
        assert_eq!(g.next_word().unwrap(), b"A");
        assert_eq!(g.next_word().unwrap(), enc(1, 10));

        let ctx = agg.make_context();
        assert_eq!(
            ctx.read_account_data(b"A", &tx).unwrap().unwrap(),
            enc(2, 20)
        );
        assert_eq!(
            ctx.read_account_data_before_tx_num(b"A", 5, &tx)
                .unwrap()
                .unwrap(),
            enc(1, 10)
        );
        assert!(ctx
            .read_account_data_before_tx_num(b"A", 0, &tx)
            .unwrap()
            .is_none());
    }

    #[test]
    fn empty_step_produces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let kv = MemKv::new();
        let mut agg = new_aggregator(dir.path(), &kv, 4);
        let roots = agg.aggregated_roots().unwrap();

        // One active step, then a completely silent one. The channel has
        // capacity one, so drain it at every boundary.
        let mut emitted = 0;
        for t in 0..=11u64 {
            agg.set_tx_num(t);
            if t == 1 {
                agg.update_account_data(b"A", &enc(1, 1)).unwrap();
            }
            agg.finish_tx().unwrap();
            while roots.try_recv().is_ok() {
                emitted += 1;
            }
        }

        // Step 0 was frozen (aggregated at the boundary of step 1)...
        assert!(dir.path().join("data").join("accounts.0-1.kv").exists());
        // ...but the silent step 1 produced no files.
        assert!(!dir.path().join("data").join("accounts.1-2.kv").exists());
        assert!(!dir.path().join("data").join("logaddrs.1-2.ef").exists());

        // Exactly the boundaries with activity emitted roots: the step-0
        // boundary (t=3) and the aggregation of step 0 (t=7). The empty
        // boundary at t=11 stayed silent.
        assert_eq!(emitted, 2);
    }

    #[test]
    fn log_index_collapses_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let kv = MemKv::new();
        let mut agg = new_aggregator(dir.path(), &kv, 4);
        let tx = kv.begin_rw();

        for t in 0..=47u64 {
            agg.set_tx_num(t);
            // Keep every step non-empty so files are produced throughout.
            agg.update_account_data(b"heartbeat", &enc(t, t)).unwrap();
            if matches!(t, 3 | 17 | 42) {
                agg.add_log_addr(b"X").unwrap();
            }
            if t == 17 {
                agg.add_log_addr(b"X").unwrap(); // duplicate within one tx
            }
            agg.finish_tx().unwrap();
        }

        let ctx = agg.make_context();
        let values: Vec<u64> = ctx
            .log_addr_iterator(b"X", 0, 50, &tx)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values, vec![3, 17, 42]);

        let none: Vec<u64> = ctx
            .log_topic_iterator(b"X", 0, 50, &tx)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn storage_files_merge_to_bigger_spans() {
        let dir = tempfile::tempdir().unwrap();
        let kv = MemKv::new();
        let mut agg = new_aggregator(dir.path(), &kv, 2);
        let tx = kv.begin_rw();

        // Drive 10 steps of storage writes; 8+ aggregated steps merge into
        // one 8-step file.
        for t in 0..=19u64 {
            agg.set_tx_num(t);
            agg.write_account_storage(b"addr", &t.to_be_bytes(), &enc(t, t))
                .unwrap();
            agg.finish_tx().unwrap();
        }

        let data = dir.path().join("data");
        assert!(data.join("storage.0-8.kv").exists());
        assert!(!data.join("storage.0-1.kv").exists());
        assert!(!data.join("storage.1-2.kv").exists());

        // Reads are unaffected by merging.
        let ctx = agg.make_context();
        for t in 0..16u64 {
            let v = ctx
                .read_account_storage(b"addr", &t.to_be_bytes(), &tx)
                .unwrap()
                .unwrap();
            assert_eq!(v, enc(t, t));
        }
    }

    #[test]
    fn single_key_across_many_steps_freezes() {
        let dir = tempfile::tempdir().unwrap();
        let kv = MemKv::new();
        let mut agg = new_aggregator(dir.path(), &kv, 2);
        let tx = kv.begin_rw();

        // 64 steps of a single key rewritten at every even txNum.
        for t in 0..128u64 {
            agg.set_tx_num(t);
            if t % 2 == 0 {
                agg.update_account_data(b"K", &enc(t, t)).unwrap();
            }
            agg.finish_tx().unwrap();
        }

        // A frozen file spans the first 32 steps.
        assert!(dir.path().join("data").join("accounts.0-32.kv").exists());

        let ctx = agg.make_context();
        for t in (2..=64u64).step_by(2) {
            let got = ctx
                .read_account_data_before_tx_num(b"K", t, &tx)
                .unwrap()
                .unwrap();
            assert_eq!(got, enc(t - 2, t - 2), "value before {t}");
        }
    }

    #[test]
    fn delete_account_clears_storage() {
        let dir = tempfile::tempdir().unwrap();
        let kv = MemKv::new();
        let mut agg = new_aggregator(dir.path(), &kv, 4);
        let tx = kv.begin_rw();

        agg.set_tx_num(0);
        agg.update_account_data(b"acct", &enc(1, 1)).unwrap();
        agg.update_account_code(b"acct", b"\x60\x00").unwrap();
        agg.write_account_storage(b"acct", b"s1", b"v1").unwrap();
        agg.write_account_storage(b"acct", b"s2", b"v2").unwrap();
        agg.finish_tx().unwrap();

        agg.set_tx_num(1);
        agg.delete_account(b"acct").unwrap();
        agg.finish_tx().unwrap();

        let ctx = agg.make_context();
        assert!(ctx.read_account_data(b"acct", &tx).unwrap().is_none());
        assert!(ctx.read_account_code(b"acct", &tx).unwrap().is_none());
        assert!(ctx
            .read_account_storage(b"acct", b"s1", &tx)
            .unwrap()
            .is_none());
        assert!(ctx
            .read_account_storage(b"acct", b"s2", &tx)
            .unwrap()
            .is_none());
        assert_eq!(ctx.read_account_code_size(b"acct", &tx).unwrap(), 0);

        // Deleting again is a no-op.
        agg.set_tx_num(2);
        agg.delete_account(b"acct").unwrap();
        agg.finish_tx().unwrap();
    }

    #[test]
    fn commitment_roots_are_deterministic() {
        let run = |dir: &Path| -> [u8; 32] {
            let kv = MemKv::new();
            let mut agg = new_aggregator(dir, &kv, 4);
            for t in 0..=15u64 {
                agg.set_tx_num(t);
                agg.update_account_data(format!("a{}", t % 3).as_bytes(), &enc(t, t * 10))
                    .unwrap();
                if t % 5 == 0 {
                    agg.write_account_storage(b"a0", b"slot", &enc(t, 1)).unwrap();
                }
                agg.finish_tx().unwrap();
            }
            agg.compute_commitment(false, false).unwrap()
        };
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        assert_eq!(run(dir_a.path()), run(dir_b.path()));
    }

    #[test]
    fn recovery_resumes_from_commitment_marker() {
        let step = 4u64;
        let writes = |agg: &mut Aggregator, t: u64| {
            agg.set_tx_num(t);
            agg.update_account_data(format!("a{}", t % 3).as_bytes(), &enc(t, t))
                .unwrap();
            agg.finish_tx().unwrap();
        };

        // Clean run through t=43.
        let clean_dir = tempfile::tempdir().unwrap();
        let clean_kv = MemKv::new();
        let mut clean = new_aggregator(clean_dir.path(), &clean_kv, step);
        for t in 0..44u64 {
            writes(&mut clean, t);
        }
        let clean_root = clean.compute_commitment(false, false).unwrap();

        // Interrupted run: stop right after step 7's files land (the
        // boundary at t=35 aggregates step 7), then reopen.
        let dir = tempfile::tempdir().unwrap();
        let kv = MemKv::new();
        let mut agg = new_aggregator(dir.path(), &kv, step);
        for t in 0..36u64 {
            writes(&mut agg, t);
        }
        drop(agg); // process exit: in-memory aggregator state is lost

        let mut agg = new_aggregator(dir.path(), &kv, step);
        assert_eq!(agg.end_tx_num_minimax(), 8 * step);
        let resume = agg.seek_commitment().unwrap();
        assert_eq!(resume, 32);

        // Replay the suffix and continue to t=43.
        for t in resume..44u64 {
            writes(&mut agg, t);
        }
        let replayed_root = agg.compute_commitment(false, false).unwrap();
        assert_eq!(replayed_root, clean_root);
    }

    #[test]
    fn metrics_register_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let kv = MemKv::new();
        let mut agg = new_aggregator(dir.path(), &kv, 4);
        let mut registry = Registry::default();
        agg.register_metrics(&mut registry);

        for t in 0..=7u64 {
            agg.set_tx_num(t);
            agg.update_account_data(b"A", &enc(t, t)).unwrap();
            agg.finish_tx().unwrap();
        }

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
        assert!(out.contains("txs_processed_total 8"));
        assert!(out.contains("built_files_total 8"));
        assert!(out.contains("running_merges 0"));
    }
}
