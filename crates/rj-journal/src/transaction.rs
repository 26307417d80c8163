//! Transaction staging.
//!
//! A [`TransactionHandle`] is the owner's view of the active transaction.
//! Blocks go through `stage_block_start` (pin) and then `stage_block_end`
//! (copy into the staging batches) or `stage_block_abort`; the
//! [`PinnedBlock`] in between is move-only, so a pin can be consumed once.

use crate::batch::Batch;
use crate::config::GROUP_COMMIT_MAX_BATCHES;
use crate::journal::Journal;
use crate::reclaim::ReclaimMsg;
use crate::region::Geometry;
use rj_block::{BufferCache, PinOutcome};
use rj_error::{JournalError, Result};
use rj_types::{BlockNumber, CommitSeq, OwnerId, TxnId};
use std::collections::BTreeSet;
use std::sync::mpsc::Sender;
use tracing::{debug, trace, warn};

/// In-memory staging state of one transaction.
#[derive(Debug)]
pub(crate) struct Transaction {
    id: TxnId,
    batches: Vec<Batch>,
    /// Data bytes in all batches, killed slots included.
    staged_bytes: u64,
    killed_bytes: u64,
    /// Blocks whose cache pin this transaction holds.
    pinned: BTreeSet<BlockNumber>,
    flush_requested: bool,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            batches: Vec::new(),
            staged_bytes: 0,
            killed_bytes: 0,
            pinned: BTreeSet::new(),
            flush_requested: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// No slot was ever staged.
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|batch| batch.entries.is_empty())
    }

    pub fn staged_bytes(&self) -> u64 {
        self.staged_bytes
    }

    pub fn killed_bytes(&self) -> u64 {
        self.killed_bytes
    }

    pub fn live_bytes(&self) -> u64 {
        self.staged_bytes - self.killed_bytes
    }

    /// Bytes the transaction occupies in the log.
    pub fn footprint(&self, batch_header_size: u64) -> u64 {
        self.batches.len() as u64 * batch_header_size + self.staged_bytes
    }

    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    /// Whether ending now should leave the transaction buffered for the next
    /// one to join.
    pub fn should_defer(&self, group_commit: bool, staging_bytes: u64) -> bool {
        let batches = self.batches.len() as u64;
        group_commit
            && !self.flush_requested
            && self.batches.len() < GROUP_COMMIT_MAX_BATCHES
            && self.staged_bytes * 4 < 3 * staging_bytes * batches
    }

    fn find_live(&self, block: BlockNumber) -> Option<(usize, usize)> {
        self.batches
            .iter()
            .enumerate()
            .find_map(|(b, batch)| batch.find_live(block).map(|e| (b, e)))
    }

    fn was_staged(&self, block: BlockNumber) -> bool {
        self.batches
            .iter()
            .any(|batch| batch.entries.iter().any(|entry| entry.block == block))
    }

    /// Check that a `size`-byte copy of `block` can be added.
    pub fn check_fits(&self, block: BlockNumber, size: u32, geometry: &Geometry) -> Result<()> {
        let dbs = geometry.dbs();
        let len = u64::from(size);
        if len == 0 || len % dbs != 0 {
            return Err(JournalError::invalid(format!(
                "block {block}: size {size} is not a non-zero multiple of {dbs}"
            )));
        }
        if len > geometry.staging_bytes {
            return Err(JournalError::invalid(format!(
                "block {block}: size {size} exceeds the staging buffer ({})",
                geometry.staging_bytes
            )));
        }
        if let Some((b, e)) = self.find_live(block)
            && self.batches[b].entries[e].size == size
        {
            return Ok(());
        }
        let projected = self.footprint(geometry.bhs()) + len + geometry.bhs();
        if projected + dbs > geometry.capacity() {
            return Err(JournalError::invalid(format!(
                "{}: staging block {block} would exceed the log capacity",
                self.id
            )));
        }
        Ok(())
    }

    pub fn note_pinned(&mut self, block: BlockNumber) {
        self.pinned.insert(block);
    }

    /// Copy `data` in as the latest version of `block`.
    pub fn stage(&mut self, block: BlockNumber, data: &[u8], geometry: &Geometry) -> Result<()> {
        let size = u32::try_from(data.len())
            .map_err(|_| JournalError::invalid(format!("block {block} is too large")))?;
        self.check_fits(block, size, geometry)?;

        if let Some((b, e)) = self.find_live(block) {
            let old = self.batches[b].entries[e].size;
            if old == size {
                self.batches[b].slot_data_mut(e).copy_from_slice(data);
                return Ok(());
            }
            self.batches[b].entries[e].killed = true;
            self.killed_bytes += u64::from(old);
        }

        let needs_batch = self
            .batches
            .last()
            .is_none_or(|batch| !batch.has_room(size, geometry.staging_bytes));
        if needs_batch {
            self.batches.push(Batch::new(geometry.max_slots));
        }
        let last = self.batches.len() - 1;
        self.batches[last].push(block, size).copy_from_slice(data);
        self.staged_bytes += u64::from(size);
        Ok(())
    }

    /// Kill the live copy of `block` and drop its pin. `Ok(false)` if it was
    /// already killed.
    pub fn kill(&mut self, block: BlockNumber, cache: &dyn BufferCache) -> Result<bool> {
        if let Some((b, e)) = self.find_live(block) {
            let entry = &mut self.batches[b].entries[e];
            entry.killed = true;
            self.killed_bytes += u64::from(entry.size);
            if self.pinned.remove(&block) {
                cache.unpin(block, self.id);
            }
            return Ok(true);
        }
        if self.was_staged(block) {
            return Ok(false);
        }
        Err(JournalError::invalid(format!(
            "block {block} was never staged in {}",
            self.id
        )))
    }

    /// Forget the pin on `block` unless it backs a live staged copy. Returns
    /// whether the caller should unpin it in the cache.
    pub fn release_unstaged(&mut self, block: BlockNumber) -> bool {
        if self.find_live(block).is_some() {
            return false;
        }
        self.pinned.remove(&block)
    }

    pub fn resolve_physical(&mut self, cache: &dyn BufferCache) -> Result<()> {
        for entry in self
            .batches
            .iter_mut()
            .flat_map(|batch| batch.entries.iter_mut())
            .filter(|entry| !entry.killed)
        {
            entry.physical = Some(cache.physical_block(entry.block)?);
        }
        Ok(())
    }

    /// Hand every live block to the cache for its home write. The cache
    /// takes over the pin; pins on blocks that were never staged are dropped.
    pub fn schedule_home_writes(
        &mut self,
        cache: &dyn BufferCache,
        seq: CommitSeq,
        completions: &Sender<ReclaimMsg>,
    ) -> Result<()> {
        for entry in self
            .batches
            .iter()
            .flat_map(|batch| batch.entries.iter())
            .filter(|entry| !entry.killed)
        {
            let bytes = u64::from(entry.size);
            let tx = completions.clone();
            cache.write_home(
                entry.block,
                entry.physical.unwrap_or(entry.block),
                self.id,
                Box::new(move |result: Result<()>| {
                    let msg = match result {
                        Ok(()) => ReclaimMsg::Written { seq, bytes },
                        Err(err) => ReclaimMsg::Failed {
                            seq,
                            errno: err.to_errno(),
                        },
                    };
                    if tx.send(msg).is_err() {
                        trace!(target: "rj::reclaim", seq = seq.0, "completion_after_shutdown");
                    }
                }),
            )?;
            self.pinned.remove(&entry.block);
        }
        for block in std::mem::take(&mut self.pinned) {
            cache.unpin(block, self.id);
        }
        Ok(())
    }

    /// Abort: drop every pin still held.
    pub fn release_pins(&mut self, cache: &dyn BufferCache) {
        if !self.pinned.is_empty() {
            debug!(target: "rj::txn", txn = %self.id, pins = self.pinned.len(), "releasing_pins");
        }
        for block in std::mem::take(&mut self.pinned) {
            cache.unpin(block, self.id);
        }
    }
}

/// An owner's handle on the active transaction.
///
/// Dropping it without [`end`](Self::end) ends it anyway and logs any error.
#[must_use = "a transaction must be ended"]
#[derive(Debug)]
pub struct TransactionHandle<'j> {
    journal: &'j Journal,
    owner: OwnerId,
    txn: TxnId,
    ended: bool,
}

impl<'j> TransactionHandle<'j> {
    pub(crate) fn new(journal: &'j Journal, owner: OwnerId, txn: TxnId) -> Self {
        Self {
            journal,
            owner,
            txn,
            ended: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.txn
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Pin `block` to this transaction.
    ///
    /// If the buffer still carries changes of an earlier transaction whose
    /// home write is outstanding, that version is written home first.
    pub fn stage_block_start(&self, block: BlockNumber) -> Result<PinnedBlock<'j>> {
        let journal = self.journal;
        let cache = journal.cache();
        let size = cache.buffer_len(block)?;
        journal.with_txn(self.txn, |txn| {
            txn.check_fits(block, size, journal.geometry())?;
            if let PinOutcome::DirtyUnder(previous) = cache.pin(block, self.txn)? {
                debug!(target: "rj::txn", %block, %previous, txn = %self.txn, "syncing_prior_version");
                cache.sync_block(block)?;
                if let PinOutcome::DirtyUnder(other) = cache.pin(block, self.txn)? {
                    return Err(JournalError::invalid(format!(
                        "block {block} is still dirty under {other}"
                    )));
                }
            }
            txn.note_pinned(block);
            Ok(())
        })?;
        trace!(target: "rj::txn", txn = %self.txn, %block, size, "block_pinned");
        Ok(PinnedBlock {
            journal,
            txn: self.txn,
            block,
            size,
            armed: true,
        })
    }

    /// Copy the pinned buffer's current contents into the transaction.
    ///
    /// The buffer stays pinned until the commit schedules its home write.
    pub fn stage_block_end(&self, mut pinned: PinnedBlock<'_>) -> Result<()> {
        pinned.armed = false;
        if pinned.txn != self.txn {
            return Err(JournalError::invalid(format!(
                "block {} is pinned by {}, not {}",
                pinned.block, pinned.txn, self.txn
            )));
        }
        let block = pinned.block;
        let journal = self.journal;
        let cache = journal.cache();
        let size = cache.buffer_len(block)?;
        let mut data = vec![0_u8; size as usize];
        cache.copy_out(block, &mut data)?;
        journal.with_txn(self.txn, |txn| txn.stage(block, &data, journal.geometry()))?;
        trace!(target: "rj::txn", txn = %self.txn, %block, size, "block_staged");
        Ok(())
    }

    /// Drop the staged copy of `block` so its home write is skipped.
    pub fn stage_block_kill(&self, block: BlockNumber) -> Result<()> {
        let journal = self.journal;
        let killed = journal.with_txn(self.txn, |txn| txn.kill(block, journal.cache()))?;
        if killed {
            journal.note_killed();
            trace!(target: "rj::txn", txn = %self.txn, %block, "block_killed");
        }
        Ok(())
    }

    /// Give back a pin that will not be staged.
    pub fn stage_block_abort(&self, mut pinned: PinnedBlock<'_>) {
        pinned.armed = false;
        self.journal.abort_pin(pinned.txn, pinned.block);
    }

    /// Make the outermost `end` commit immediately instead of buffering.
    pub fn request_flush(&self) -> Result<()> {
        self.journal.request_flush(self.txn)
    }

    /// End this level of the transaction; the outermost `end` commits it (or
    /// buffers it for group commit).
    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        self.journal.end_transaction(self.owner)
    }
}

impl Drop for TransactionHandle<'_> {
    fn drop(&mut self) {
        if !self.ended
            && let Err(err) = self.journal.end_transaction(self.owner)
        {
            warn!(target: "rj::txn", txn = %self.txn, error = %err, "implicit_end_failed");
        }
    }
}

/// A cache buffer pinned to a transaction, waiting to be staged.
///
/// Dropping it behaves like
/// [`stage_block_abort`](TransactionHandle::stage_block_abort).
#[must_use = "pass the pin to stage_block_end or stage_block_abort"]
#[derive(Debug)]
pub struct PinnedBlock<'j> {
    journal: &'j Journal,
    txn: TxnId,
    block: BlockNumber,
    size: u32,
    armed: bool,
}

impl PinnedBlock<'_> {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Buffer size at pin time.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn txn(&self) -> TxnId {
        self.txn
    }
}

impl Drop for PinnedBlock<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(target: "rj::txn", block = %self.block, txn = %self.txn, "pinned_block_dropped");
            self.journal.abort_pin(self.txn, self.block);
        }
    }
}
