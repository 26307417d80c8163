//! The journal: lifecycle, the transaction slot, the commit pipeline and
//! free-space accounting.
//!
//! Lock order is `slot -> header -> reclaim`. The slot lock is never held
//! across log I/O; a commit in progress is flagged in the slot instead, which
//! keeps commits strictly serialized.

use crate::config::JournalOptions;
use crate::corrupt_at;
use crate::header::{HEADER_ENCODED_LEN, JournalHeader};
use crate::reclaim::{ReclaimMsg, ReclaimState, Reclaimer};
use crate::region::Geometry;
use crate::replay::{self, ReplayReport};
use crate::transaction::{Transaction, TransactionHandle};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rj_block::{BufferCache, ByteDevice};
use rj_error::{JournalError, Result};
use rj_types::{BlockNumber, ByteOrder, CommitSeq, OwnerId, TxnId};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Called when the journal is waiting for home writes to complete.
pub type FlushHook = Arc<dyn Fn() + Send + Sync>;

/// The collaborators a journal runs on.
pub struct JournalDevices {
    /// Device holding the log.
    pub log: Arc<dyn ByteDevice>,
    /// Buffer cache owning the metadata blocks.
    pub cache: Arc<dyn BufferCache>,
    /// Nudges the cache to push out queued home writes.
    pub flush: FlushHook,
}

impl JournalDevices {
    #[must_use]
    pub fn new(log: Arc<dyn ByteDevice>, cache: Arc<dyn BufferCache>) -> Self {
        Self {
            log,
            cache,
            flush: Arc::new(|| {}),
        }
    }

    #[must_use]
    pub fn with_flush_hook(mut self, flush: FlushHook) -> Self {
        self.flush = flush;
        self
    }
}

impl std::fmt::Debug for JournalDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalDevices")
            .field("log_len", &self.log.len_bytes())
            .field("log_physical_block_size", &self.log.physical_block_size())
            .finish_non_exhaustive()
    }
}

/// Point-in-time journal counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JournalStats {
    /// Transactions written to the log.
    pub commits: u64,
    /// Ends that left the transaction buffered for group commit.
    pub deferred_commits: u64,
    pub batches_written: u64,
    /// Log bytes written by commits, descriptors included.
    pub bytes_logged: u64,
    pub blocks_killed: u64,
    /// Times `start` moved forward.
    pub reclaim_advances: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    commits: AtomicU64,
    deferred_commits: AtomicU64,
    batches_written: AtomicU64,
    bytes_logged: AtomicU64,
    pub blocks_killed: AtomicU64,
    reclaim_advances: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> JournalStats {
        JournalStats {
            commits: self.commits.load(Ordering::Relaxed),
            deferred_commits: self.deferred_commits.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            bytes_logged: self.bytes_logged.load(Ordering::Relaxed),
            blocks_killed: self.blocks_killed.load(Ordering::Relaxed),
            reclaim_advances: self.reclaim_advances.load(Ordering::Relaxed),
        }
    }
}

/// State shared with the reclaimer thread.
pub(crate) struct Shared {
    pub log: Arc<dyn ByteDevice>,
    /// Owner of the home locations; synced before `start` moves.
    pub cache: Arc<dyn BufferCache>,
    pub geometry: Geometry,
    pub header: Mutex<JournalHeader>,
    pub reclaim: Mutex<ReclaimState>,
    /// Signalled whenever the reclaim state changes or the journal turns
    /// invalid.
    pub reclaimed: Condvar,
    invalid: AtomicBool,
    pub stats: StatCounters,
}

impl Shared {
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Irreversibly mark the journal invalid. Only the first reason is logged.
    pub fn mark_invalid(&self, reason: &str) {
        if !self.invalid.swap(true, Ordering::AcqRel) {
            error!(target: "rj::journal", reason, "journal_invalid");
        }
        self.reclaimed.notify_all();
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_invalid() {
            return Err(JournalError::invalid(
                "journal is invalid after an I/O failure",
            ));
        }
        Ok(())
    }

    /// Advance `start` over the completed run beginning at it, persisting the
    /// header if it moved.
    ///
    /// The filesystem device is synced first: a completion only means the
    /// home write was issued, and the log copy must outlive it until it is
    /// durable.
    pub fn reclaim_space(&self) -> Result<bool> {
        let mut header = self.header.lock();
        let Some(new_start) = self.reclaim.lock().take_reclaimable(header.start) else {
            return Ok(false);
        };
        if let Err(err) = self.cache.sync() {
            drop(header);
            self.mark_invalid(&format!("syncing home writes before reclaim failed: {err}"));
            return Err(err);
        }
        let old_start = header.start;
        header.start = new_start;
        if let Err(err) = header.persist(&*self.log) {
            drop(header);
            self.mark_invalid(&format!("persisting header after reclaim failed: {err}"));
            return Err(err);
        }
        drop(header);
        self.stats.reclaim_advances.fetch_add(1, Ordering::Relaxed);
        debug!(target: "rj::reclaim", from = old_start, to = new_start, "log_start_advanced");
        Ok(true)
    }

    fn occupied(&self) -> u64 {
        let header = self.header.lock();
        self.geometry.region().distance(header.start, header.end)
    }
}

#[derive(Debug, Default)]
struct SlotState {
    owner: Option<OwnerId>,
    depth: u32,
    committing: bool,
    /// Active transaction while `owner` is set; otherwise a transaction
    /// buffered for group commit.
    txn: Option<Transaction>,
}

/// A circular write-ahead journal over a log device.
pub struct Journal {
    shared: Arc<Shared>,
    cache: Arc<dyn BufferCache>,
    flush_hook: FlushHook,
    options: JournalOptions,
    slot: Mutex<SlotState>,
    slot_free: Condvar,
    next_txn: AtomicU64,
    reclaimer: Reclaimer,
    replay_report: Option<ReplayReport>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("header", &*self.shared.header.lock())
            .field("geometry", &self.shared.geometry)
            .field("invalid", &self.shared.is_invalid())
            .finish_non_exhaustive()
    }
}

fn negotiate_block_size(log: &dyn ByteDevice, min_block_size: u32) -> Result<u32> {
    let dbs = min_block_size.max(log.physical_block_size());
    if dbs == 0 || !dbs.is_power_of_two() {
        return Err(JournalError::DeviceMismatch(format!(
            "device block size {dbs} is not a power of two"
        )));
    }
    Ok(dbs)
}

fn check_log_size(log: &dyn ByteDevice, log_size: u64, dbs: u32) -> Result<()> {
    if log_size % u64::from(dbs) != 0 {
        return Err(JournalError::DeviceMismatch(format!(
            "log size {log_size} is not a multiple of the block size {dbs}"
        )));
    }
    if log_size > log.len_bytes() {
        return Err(JournalError::DeviceMismatch(format!(
            "log size {log_size} exceeds the device ({} bytes)",
            log.len_bytes()
        )));
    }
    Ok(())
}

impl Journal {
    /// Format a new, empty log of `log_size` bytes.
    pub fn create(
        devices: JournalDevices,
        log_size: u64,
        min_block_size: u32,
        options: &JournalOptions,
    ) -> Result<Self> {
        options.validate()?;
        let dbs = negotiate_block_size(&*devices.log, min_block_size)?;
        check_log_size(&*devices.log, log_size, dbs)?;
        let bhs = rj_types::align_up(u64::from(options.batch_header_size), u64::from(dbs))
            .and_then(|bhs| u32::try_from(bhs).ok())
            .ok_or_else(|| {
                JournalError::DeviceMismatch(format!(
                    "batch header size {} cannot be aligned to {dbs}",
                    options.batch_header_size
                ))
            })?;
        let geometry = Geometry::new(log_size, dbs, bhs, options.memory_budget)?;

        let mut header = JournalHeader::new(log_size, bhs, dbs);
        header.persist(&*devices.log)?;
        info!(
            target: "rj::journal",
            size = log_size,
            device_block_size = dbs,
            batch_header_size = bhs,
            staging_bytes = geometry.staging_bytes,
            "journal_created"
        );
        Self::assemble(devices, geometry, header, options, None)
    }

    /// Open an existing log, replaying whatever it still holds.
    pub fn open(
        devices: JournalDevices,
        log_size: u64,
        min_block_size: u32,
        options: &JournalOptions,
    ) -> Result<Self> {
        options.validate()?;
        let requested = negotiate_block_size(&*devices.log, min_block_size)?;

        let mut raw = vec![0_u8; HEADER_ENCODED_LEN];
        devices.log.read_exact_at(0, &mut raw)?;
        let mut header = JournalHeader::decode(&raw).map_err(|err| corrupt_at(0, &err))?;
        header
            .validate_geometry()
            .map_err(|err| corrupt_at(0, &err))?;
        if header.legacy_magic {
            warn!(target: "rj::journal", "legacy_magic_found");
        }
        if header.order == ByteOrder::Big {
            debug!(target: "rj::journal", "big_endian_log");
        }
        if header.size != log_size {
            return Err(JournalError::DeviceMismatch(format!(
                "log was formatted with {} bytes, opened with {log_size}",
                header.size
            )));
        }
        check_log_size(&*devices.log, log_size, header.device_block_size)?;
        if header.device_block_size != requested {
            let physical = devices.log.physical_block_size().max(1);
            if header.device_block_size % physical != 0 {
                return Err(JournalError::DeviceMismatch(format!(
                    "log block size {} is not a multiple of the device's {physical}",
                    header.device_block_size
                )));
            }
            warn!(
                target: "rj::journal",
                requested,
                adopted = header.device_block_size,
                "block_size_adopted"
            );
        }
        header.normalize();
        let geometry = Geometry::new(
            header.size,
            header.device_block_size,
            header.batch_header_size,
            options.memory_budget,
        )?;

        let report = if options.force_reset {
            let discarded = geometry.region().distance(header.start, header.end);
            if discarded > 0 {
                warn!(target: "rj::journal", discarded, "log_discarded");
            }
            header.start = header.end;
            header.persist(&*devices.log)?;
            None
        } else {
            Some(replay::replay(&*devices.log, &*devices.cache, &mut header)?)
        };

        info!(
            target: "rj::journal",
            size = header.size,
            device_block_size = header.device_block_size,
            batch_header_size = header.batch_header_size,
            replayed = report.is_some(),
            "journal_opened"
        );
        Self::assemble(devices, geometry, header, options, report)
    }

    fn assemble(
        devices: JournalDevices,
        geometry: Geometry,
        header: JournalHeader,
        options: &JournalOptions,
        replay_report: Option<ReplayReport>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            log: devices.log,
            cache: Arc::clone(&devices.cache),
            geometry,
            header: Mutex::new(header),
            reclaim: Mutex::new(ReclaimState::new(options.ring_capacity)),
            reclaimed: Condvar::new(),
            invalid: AtomicBool::new(false),
            stats: StatCounters::default(),
        });
        let reclaimer = Reclaimer::spawn(Arc::clone(&shared))?;
        Ok(Self {
            shared,
            cache: devices.cache,
            flush_hook: devices.flush,
            options: options.clone(),
            slot: Mutex::new(SlotState::default()),
            slot_free: Condvar::new(),
            next_txn: AtomicU64::new(1),
            reclaimer,
            replay_report,
        })
    }

    /// Copy of the cached header.
    #[must_use]
    pub fn header(&self) -> JournalHeader {
        *self.shared.header.lock()
    }

    #[must_use]
    pub fn device_block_size(&self) -> u32 {
        self.shared.geometry.device_block_size
    }

    #[must_use]
    pub fn batch_header_size(&self) -> u32 {
        self.shared.geometry.batch_header_size
    }

    /// Size of one staging buffer.
    #[must_use]
    pub fn staging_bytes(&self) -> u64 {
        self.shared.geometry.staging_bytes
    }

    /// Bytes in the circular region (`size - device_block_size`).
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.shared.geometry.capacity()
    }

    #[must_use]
    pub fn options(&self) -> &JournalOptions {
        &self.options
    }

    /// Summary of the replay performed by [`open`](Self::open), if any.
    #[must_use]
    pub fn replay_report(&self) -> Option<ReplayReport> {
        self.replay_report
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.shared.is_invalid()
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.shared.stats.snapshot()
    }

    /// Bytes between `start` and `end`.
    #[must_use]
    pub fn occupied_space(&self) -> u64 {
        self.shared.occupied()
    }

    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.capacity() - self.occupied_space()
    }

    /// Wait until `needed` bytes (plus the one block that is never handed
    /// out) are free, reclaiming completed commits along the way.
    pub fn check_free_space(&self, needed: u64) -> Result<()> {
        let geometry = self.shared.geometry;
        let wanted = needed.saturating_add(geometry.dbs());
        if wanted > geometry.capacity() {
            return Err(JournalError::NoSpace);
        }
        for _ in 0..=self.options.free_space_retries {
            self.shared.ensure_valid()?;
            self.shared.reclaim_space()?;
            if self.free_space() >= wanted {
                return Ok(());
            }
            (self.flush_hook)();
            let mut state = self.shared.reclaim.lock();
            self.shared
                .reclaimed
                .wait_for(&mut state, self.options.poll_interval());
        }
        warn!(
            target: "rj::journal",
            needed,
            free = self.free_space(),
            retries = self.options.free_space_retries,
            "free_space_exhausted"
        );
        Err(JournalError::NoSpace)
    }

    /// Begin (or re-enter) the transaction of `owner`.
    ///
    /// A different owner blocks until the current one has ended. A buffered
    /// group-commit transaction is reused.
    pub fn begin(&self, owner: OwnerId) -> Result<TransactionHandle<'_>> {
        let mut slot = self.slot.lock();
        loop {
            self.shared.ensure_valid()?;
            if !slot.committing {
                match slot.owner {
                    None => break,
                    Some(current) if current == owner => {
                        if let Some(txn) = slot.txn.as_ref() {
                            let id = txn.id();
                            slot.depth += 1;
                            trace!(target: "rj::txn", %owner, txn = %id, depth = slot.depth, "begin_nested");
                            return Ok(TransactionHandle::new(self, owner, id));
                        }
                    }
                    Some(_) => {}
                }
            }
            self.slot_free.wait(&mut slot);
        }

        slot.owner = Some(owner);
        slot.depth = 1;
        if let Some(txn) = slot.txn.as_ref() {
            let id = txn.id();
            trace!(target: "rj::txn", %owner, txn = %id, "begin_buffered");
            return Ok(TransactionHandle::new(self, owner, id));
        }
        drop(slot);

        let geometry = self.shared.geometry;
        if let Err(err) = self.check_free_space(geometry.staging_bytes + geometry.bhs()) {
            self.release_slot();
            return Err(err);
        }
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        self.slot.lock().txn = Some(Transaction::new(id));
        self.slot_free.notify_all();
        trace!(target: "rj::txn", %owner, txn = %id, "begin");
        Ok(TransactionHandle::new(self, owner, id))
    }

    fn release_slot(&self) {
        let mut slot = self.slot.lock();
        slot.owner = None;
        slot.depth = 0;
        drop(slot);
        self.slot_free.notify_all();
    }

    fn finish_commit_slot(&self) {
        let mut slot = self.slot.lock();
        slot.committing = false;
        slot.owner = None;
        drop(slot);
        self.slot_free.notify_all();
    }

    pub(crate) fn end_transaction(&self, owner: OwnerId) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.owner != Some(owner) || slot.depth == 0 || slot.committing {
            return Err(JournalError::invalid(format!(
                "{owner} ended a transaction it does not hold"
            )));
        }
        slot.depth -= 1;
        if slot.depth > 0 {
            return Ok(());
        }
        let Some(mut txn) = slot.txn.take() else {
            slot.owner = None;
            drop(slot);
            self.slot_free.notify_all();
            return Err(JournalError::invalid(format!("{owner} has no transaction")));
        };

        if self.shared.is_invalid() || txn.is_empty() {
            slot.owner = None;
            drop(slot);
            self.slot_free.notify_all();
            txn.release_pins(&*self.cache);
            return self.shared.ensure_valid();
        }

        let geometry = self.shared.geometry;
        if txn.should_defer(self.options.group_commit, geometry.staging_bytes) {
            debug!(
                target: "rj::journal",
                txn = %txn.id(),
                staged = txn.staged_bytes(),
                batches = txn.batches().len(),
                "commit_deferred"
            );
            slot.txn = Some(txn);
            slot.owner = None;
            drop(slot);
            self.slot_free.notify_all();
            self.shared
                .stats
                .deferred_commits
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        slot.committing = true;
        drop(slot);
        let result = self.commit(txn);
        self.finish_commit_slot();
        result
    }

    /// Commit a transaction buffered for group commit, if any.
    ///
    /// Waits for the slot to be free, so it must not be called while holding
    /// a [`TransactionHandle`] on this journal.
    pub fn flush(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        while slot.owner.is_some() || slot.committing {
            self.slot_free.wait(&mut slot);
        }
        let Some(mut txn) = slot.txn.take() else {
            return Ok(());
        };
        if self.shared.is_invalid() || txn.is_empty() {
            drop(slot);
            txn.release_pins(&*self.cache);
            return self.shared.ensure_valid();
        }
        slot.committing = true;
        drop(slot);
        let result = self.commit(txn);
        self.finish_commit_slot();
        result
    }

    fn commit(&self, mut txn: Transaction) -> Result<()> {
        let geometry = self.shared.geometry;
        let footprint = txn.footprint(geometry.bhs());
        if let Err(err) = self.check_free_space(footprint) {
            txn.release_pins(&*self.cache);
            return Err(err);
        }

        let start = self.shared.header.lock().end;
        let end = geometry.region().advance(start, footprint);
        let seq = match self.reserve_ring(start, end, txn.staged_bytes(), txn.killed_bytes()) {
            Ok(seq) => seq,
            Err(err) => {
                txn.release_pins(&*self.cache);
                return Err(err);
            }
        };
        if let Err(err) = txn.resolve_physical(&*self.cache) {
            self.shared.reclaim.lock().cancel(seq);
            txn.release_pins(&*self.cache);
            return Err(err);
        }

        if let Err(err) = self.write_commit(&mut txn, seq, start, end) {
            self.shared
                .mark_invalid(&format!("commit {seq} of {} failed: {err}", txn.id()));
            txn.release_pins(&*self.cache);
            return Err(err);
        }
        Ok(())
    }

    fn reserve_ring(&self, start: u64, end: u64, total: u64, killed: u64) -> Result<CommitSeq> {
        let mut state = self.shared.reclaim.lock();
        for _ in 0..=self.options.ring_retries {
            self.shared.ensure_valid()?;
            if let Some(seq) = state.try_reserve(start, end, total, killed) {
                return Ok(seq);
            }
            MutexGuard::unlocked(&mut state, || (self.flush_hook)());
            self.shared
                .reclaimed
                .wait_for(&mut state, self.options.poll_interval());
        }
        warn!(
            target: "rj::journal",
            in_flight = state.in_flight(),
            retries = self.options.ring_retries,
            "commit_ring_full"
        );
        Err(JournalError::NoSpace)
    }

    fn write_commit(
        &self,
        txn: &mut Transaction,
        seq: CommitSeq,
        start: u64,
        end: u64,
    ) -> Result<()> {
        let geometry = self.shared.geometry;
        let region = geometry.region();
        let log = &*self.shared.log;

        let mut offset = start;
        for batch in txn.batches() {
            let mut record = batch
                .descriptor(geometry.batch_header_size)
                .encode(geometry.batch_header_size, ByteOrder::Little);
            record.extend_from_slice(&batch.data);
            offset = region.write(log, offset, &record)?;
        }
        debug_assert_eq!(offset, end, "log footprint mismatch");
        log.sync()?;

        {
            let mut header = self.shared.header.lock();
            header.end = end;
            header.persist(log)?;
        }

        let completions = self.reclaimer.sender();
        txn.schedule_home_writes(&*self.cache, seq, &completions)?;
        if txn.live_bytes() == 0 {
            if completions.send(ReclaimMsg::Written { seq, bytes: 0 }).is_err() {
                trace!(target: "rj::reclaim", seq = seq.0, "completion_after_shutdown");
            }
        }

        let stats = &self.shared.stats;
        stats.commits.fetch_add(1, Ordering::Relaxed);
        stats
            .batches_written
            .fetch_add(txn.batches().len() as u64, Ordering::Relaxed);
        stats
            .bytes_logged
            .fetch_add(txn.footprint(geometry.bhs()), Ordering::Relaxed);
        debug!(
            target: "rj::journal",
            txn = %txn.id(),
            seq = seq.0,
            start,
            end,
            batches = txn.batches().len(),
            live_bytes = txn.live_bytes(),
            "commit_written"
        );
        Ok(())
    }

    /// Commit any buffered transaction, wait for the log to drain and stop
    /// the reclaimer.
    ///
    /// An invalid journal is not drained: buffered work is dropped and its
    /// blocks unpinned unwritten; the next open replays what reached the log.
    pub fn close(self) -> Result<()> {
        let pending = self.slot.lock().txn.take();
        if self.shared.is_invalid() {
            if let Some(mut txn) = pending {
                txn.release_pins(&*self.cache);
            }
            warn!(target: "rj::journal", "closing_invalid_journal");
            return Ok(());
        }
        if let Some(mut txn) = pending {
            if txn.is_empty() {
                txn.release_pins(&*self.cache);
            } else {
                self.commit(txn)?;
            }
        }
        self.drain()?;
        self.shared.header.lock().persist(&*self.shared.log)?;
        info!(target: "rj::journal", stats = ?self.stats(), "journal_closed");
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        for _ in 0..=self.options.close_retries {
            self.shared.ensure_valid()?;
            self.shared.reclaim_space()?;
            if self.shared.header.lock().is_empty() {
                return Ok(());
            }
            (self.flush_hook)();
            let mut state = self.shared.reclaim.lock();
            self.shared
                .reclaimed
                .wait_for(&mut state, self.options.poll_interval());
        }
        warn!(
            target: "rj::journal",
            occupied = self.occupied_space(),
            "close_drain_exhausted"
        );
        Err(JournalError::NoSpace)
    }

    pub(crate) fn cache(&self) -> &dyn BufferCache {
        &*self.cache
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.shared.geometry
    }

    pub(crate) fn note_killed(&self) {
        self.shared
            .stats
            .blocks_killed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Run `f` on the active transaction `id`.
    pub(crate) fn with_txn<R>(
        &self,
        id: TxnId,
        f: impl FnOnce(&mut Transaction) -> Result<R>,
    ) -> Result<R> {
        self.shared.ensure_valid()?;
        let mut slot = self.slot.lock();
        match slot.txn.as_mut() {
            Some(txn) if txn.id() == id => f(txn),
            _ => Err(JournalError::invalid(format!("{id} is no longer active"))),
        }
    }

    pub(crate) fn request_flush(&self, id: TxnId) -> Result<()> {
        let mut slot = self.slot.lock();
        match slot.txn.as_mut() {
            Some(txn) if txn.id() == id => {
                txn.request_flush();
                Ok(())
            }
            _ => Err(JournalError::invalid(format!("{id} is no longer active"))),
        }
    }

    /// Release a pin that was never staged. A pin that now backs a live
    /// staged copy stays.
    pub(crate) fn abort_pin(&self, id: TxnId, block: BlockNumber) {
        let mut slot = self.slot.lock();
        if let Some(txn) = slot.txn.as_mut()
            && txn.id() == id
            && txn.release_unstaged(block)
        {
            self.cache.unpin(block, id);
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Some(mut txn) = self.slot.get_mut().txn.take() {
            warn!(target: "rj::journal", txn = %txn.id(), "buffered_transaction_dropped");
            txn.release_pins(&*self.cache);
        }
        self.reclaimer.stop();
    }
}
