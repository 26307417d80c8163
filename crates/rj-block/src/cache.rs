//! Buffer-cache collaborator.
//!
//! The journal never owns metadata block contents. It asks a [`BufferCache`]
//! to pin a buffer to a transaction, to copy the buffer out into the log, and
//! finally to write it to its home location asynchronously, reporting the
//! outcome through a [`WriteCompletion`].
//!
//! [`BlockCache`] is a deliberately small implementation: resident buffers
//! in a map, no eviction, and a single write-back worker thread fed in FIFO
//! order. [`WritebackMode::Held`] parks queued writes so tests can cut power
//! between the log commit and the home writes.

use crate::ByteDevice;
use parking_lot::{Condvar, Mutex};
use rj_error::{JournalError, Result};
use rj_types::{BlockNumber, TxnId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Completion callback for an asynchronous home write.
///
/// Invoked exactly once from the write-back context. Implementations must
/// not block.
pub type WriteCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Result of pinning a buffer to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// The buffer is now pinned to the requesting transaction.
    Pinned,
    /// The buffer still carries changes from an earlier transaction whose home
    /// write has not landed. Nothing was pinned; the caller must make that
    /// version durable (see [`BufferCache::sync_block`]) and retry.
    DirtyUnder(TxnId),
}

/// Metadata buffer cache as seen by the journal.
pub trait BufferCache: Send + Sync {
    /// Byte length of the resident buffer for `block`.
    fn buffer_len(&self, block: BlockNumber) -> Result<u32>;

    /// Pin `block` to `owner` and mark it dirty under `owner`.
    fn pin(&self, block: BlockNumber, owner: TxnId) -> Result<PinOutcome>;

    /// Release `owner`'s pin without writing the buffer.
    fn unpin(&self, block: BlockNumber, owner: TxnId);

    /// Copy the buffer's current contents into `dst` (`dst.len()` must equal
    /// [`buffer_len`](Self::buffer_len)).
    fn copy_out(&self, block: BlockNumber, dst: &mut [u8]) -> Result<()>;

    /// Durably write the buffer's current contents home now and forget the
    /// previous dirty owner.
    fn sync_block(&self, block: BlockNumber) -> Result<()>;

    /// Resolve the physical home block of a (possibly logical) block number.
    fn physical_block(&self, block: BlockNumber) -> Result<BlockNumber> {
        Ok(block)
    }

    /// Schedule an asynchronous write of the buffer to `physical` and release
    /// `owner`'s pin. `done` fires once the write has completed or failed;
    /// a completed write is durable only after [`sync`](Self::sync).
    fn write_home(
        &self,
        block: BlockNumber,
        physical: BlockNumber,
        owner: TxnId,
        done: WriteCompletion,
    ) -> Result<()>;

    /// Synchronously overwrite the home location of `physical` with `data`.
    /// This is the filesystem block writer used by replay.
    fn write_home_sync(&self, physical: BlockNumber, data: &[u8]) -> Result<()>;

    /// Flush the filesystem device.
    fn sync(&self) -> Result<()>;
}

/// How the write-back worker treats queued home writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritebackMode {
    /// Writes are performed as soon as the worker picks them up.
    #[default]
    Immediate,
    /// Writes stay queued until [`BlockCache::release_writes`].
    Held,
}

#[derive(Debug, Default)]
struct Buffer {
    data: Vec<u8>,
    pinned_by: Option<TxnId>,
    dirty_under: Option<TxnId>,
    pending_writes: usize,
}

struct WriteJob {
    block: BlockNumber,
    physical: BlockNumber,
    owner: TxnId,
    data: Vec<u8>,
    done: WriteCompletion,
}

#[derive(Default)]
struct CacheState {
    buffers: HashMap<BlockNumber, Buffer>,
    queue: VecDeque<WriteJob>,
    mode: WritebackMode,
    in_progress: usize,
    shutdown: bool,
}

struct CacheShared {
    device: Arc<dyn ByteDevice>,
    unit: u32,
    state: Mutex<CacheState>,
    work: Condvar,
    idle: Condvar,
}

impl CacheShared {
    fn home_offset(&self, physical: BlockNumber) -> Result<u64> {
        physical
            .to_byte_offset(self.unit)
            .map(|off| off.0)
            .ok_or_else(|| JournalError::OutOfBounds(format!("home offset of block {physical}")))
    }

    fn worker_loop(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if state.mode == WritebackMode::Immediate
                        && let Some(job) = state.queue.pop_front()
                    {
                        state.in_progress += 1;
                        break job;
                    }
                    self.work.wait(&mut state);
                }
            };

            let result = self
                .home_offset(job.physical)
                .and_then(|offset| self.device.write_all_at(offset, &job.data));
            trace!(block = %job.block, physical = %job.physical, ok = result.is_ok(), "home write");

            {
                let mut state = self.state.lock();
                if let Some(buf) = state.buffers.get_mut(&job.block) {
                    buf.pending_writes = buf.pending_writes.saturating_sub(1);
                    if buf.pending_writes == 0
                        && buf.pinned_by.is_none()
                        && buf.dirty_under == Some(job.owner)
                    {
                        buf.dirty_under = None;
                    }
                }
                state.in_progress -= 1;
                self.idle.notify_all();
            }

            (job.done)(result);
        }
    }
}

/// Reference write-back buffer cache over a [`ByteDevice`].
///
/// Block numbers address `unit`-byte blocks on the device; a buffer may span
/// several units.
pub struct BlockCache {
    shared: Arc<CacheShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BlockCache")
            .field("unit", &self.shared.unit)
            .field("resident", &state.buffers.len())
            .field("queued", &state.queue.len())
            .field("mode", &state.mode)
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    pub fn new(device: Arc<dyn ByteDevice>, unit: u32, mode: WritebackMode) -> Result<Self> {
        if unit == 0 || !unit.is_power_of_two() {
            return Err(JournalError::DeviceMismatch(format!(
                "cache unit {unit} must be a power of two"
            )));
        }
        let shared = Arc::new(CacheShared {
            device,
            unit,
            state: Mutex::new(CacheState {
                mode,
                ..CacheState::default()
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("rj-writeback".to_owned())
            .spawn(move || worker_shared.worker_loop())?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    #[must_use]
    pub fn unit(&self) -> u32 {
        self.shared.unit
    }

    /// Load `block` (`len` bytes) from the device unless already resident.
    pub fn load(&self, block: BlockNumber, len: u32) -> Result<()> {
        if self.shared.state.lock().buffers.contains_key(&block) {
            return Ok(());
        }
        self.check_len(len)?;
        let mut data = vec![0_u8; len as usize];
        self.shared
            .device
            .read_exact_at(self.shared.home_offset(block)?, &mut data)?;
        self.shared
            .state
            .lock()
            .buffers
            .entry(block)
            .or_insert(Buffer {
                data,
                ..Buffer::default()
            });
        Ok(())
    }

    /// Mutate a resident buffer in place.
    pub fn modify<R>(&self, block: BlockNumber, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut state = self.shared.state.lock();
        let buf = state
            .buffers
            .get_mut(&block)
            .ok_or_else(|| JournalError::invalid(format!("block {block} is not cached")))?;
        Ok(f(&mut buf.data))
    }

    /// Current contents of a resident buffer.
    pub fn read(&self, block: BlockNumber) -> Result<Vec<u8>> {
        self.modify(block, |data| data.to_vec())
    }

    /// Whether the buffer is currently pinned by a transaction.
    #[must_use]
    pub fn is_pinned(&self, block: BlockNumber) -> bool {
        self.shared
            .state
            .lock()
            .buffers
            .get(&block)
            .is_some_and(|buf| buf.pinned_by.is_some())
    }

    /// Number of home writes queued but not yet started.
    #[must_use]
    pub fn queued_writes(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Park queued writes from now on.
    pub fn hold_writes(&self) {
        self.shared.state.lock().mode = WritebackMode::Held;
    }

    /// Let the worker drain the queue.
    pub fn release_writes(&self) {
        self.shared.state.lock().mode = WritebackMode::Immediate;
        self.shared.work.notify_all();
    }

    /// Block until no write is queued or in progress. Only meaningful in
    /// [`WritebackMode::Immediate`].
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.mode == WritebackMode::Immediate
            && (!state.queue.is_empty() || state.in_progress > 0)
        {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Flush hook suitable for handing to the journal: wakes the worker.
    #[must_use]
    pub fn flush_hook(&self) -> Arc<dyn Fn() + Send + Sync> {
        let shared = Arc::clone(&self.shared);
        Arc::new(move || {
            shared.work.notify_all();
        })
    }

    fn check_len(&self, len: u32) -> Result<()> {
        if len == 0 || len % self.shared.unit != 0 {
            return Err(JournalError::invalid(format!(
                "buffer length {len} is not a multiple of {}",
                self.shared.unit
            )));
        }
        Ok(())
    }
}

impl BufferCache for BlockCache {
    fn buffer_len(&self, block: BlockNumber) -> Result<u32> {
        let state = self.shared.state.lock();
        let buf = state
            .buffers
            .get(&block)
            .ok_or_else(|| JournalError::invalid(format!("block {block} is not cached")))?;
        u32::try_from(buf.data.len())
            .map_err(|_| JournalError::invalid(format!("block {block} buffer exceeds u32")))
    }

    fn pin(&self, block: BlockNumber, owner: TxnId) -> Result<PinOutcome> {
        let mut state = self.shared.state.lock();
        let buf = state
            .buffers
            .get_mut(&block)
            .ok_or_else(|| JournalError::invalid(format!("block {block} is not cached")))?;
        match (buf.pinned_by, buf.dirty_under) {
            (Some(other), _) if other != owner => Err(JournalError::invalid(format!(
                "block {block} is pinned by {other}"
            ))),
            (None, Some(other)) if other != owner => Ok(PinOutcome::DirtyUnder(other)),
            _ => {
                buf.pinned_by = Some(owner);
                buf.dirty_under = Some(owner);
                Ok(PinOutcome::Pinned)
            }
        }
    }

    fn unpin(&self, block: BlockNumber, owner: TxnId) {
        let mut state = self.shared.state.lock();
        let Some(buf) = state.buffers.get_mut(&block) else {
            warn!(%block, %owner, "unpin of uncached block");
            return;
        };
        if buf.pinned_by == Some(owner) {
            buf.pinned_by = None;
            if buf.pending_writes == 0 && buf.dirty_under == Some(owner) {
                buf.dirty_under = None;
            }
        }
    }

    fn copy_out(&self, block: BlockNumber, dst: &mut [u8]) -> Result<()> {
        let state = self.shared.state.lock();
        let buf = state
            .buffers
            .get(&block)
            .ok_or_else(|| JournalError::invalid(format!("block {block} is not cached")))?;
        if buf.data.len() != dst.len() {
            return Err(JournalError::invalid(format!(
                "copy_out size mismatch for block {block}: buffer={} dst={}",
                buf.data.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&buf.data);
        Ok(())
    }

    fn sync_block(&self, block: BlockNumber) -> Result<()> {
        let data = {
            let state = self.shared.state.lock();
            let buf = state
                .buffers
                .get(&block)
                .ok_or_else(|| JournalError::invalid(format!("block {block} is not cached")))?;
            buf.data.clone()
        };
        let physical = self.physical_block(block)?;
        self.shared
            .device
            .write_all_at(self.shared.home_offset(physical)?, &data)?;
        self.shared.device.sync()?;
        if let Some(buf) = self.shared.state.lock().buffers.get_mut(&block)
            && buf.pinned_by.is_none()
        {
            buf.dirty_under = None;
        }
        debug!(%block, "forced durable write of prior version");
        Ok(())
    }

    fn write_home(
        &self,
        block: BlockNumber,
        physical: BlockNumber,
        owner: TxnId,
        done: WriteCompletion,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(JournalError::invalid("write-back worker has shut down"));
        }
        let buf = state
            .buffers
            .get_mut(&block)
            .ok_or_else(|| JournalError::invalid(format!("block {block} is not cached")))?;
        let data = buf.data.clone();
        buf.pending_writes += 1;
        if buf.pinned_by == Some(owner) {
            buf.pinned_by = None;
        }
        state.queue.push_back(WriteJob {
            block,
            physical,
            owner,
            data,
            done,
        });
        drop(state);
        self.shared.work.notify_one();
        Ok(())
    }

    fn write_home_sync(&self, physical: BlockNumber, data: &[u8]) -> Result<()> {
        self.shared
            .device
            .write_all_at(self.shared.home_offset(physical)?, data)?;
        let mut state = self.shared.state.lock();
        if let Some(buf) = state.buffers.get_mut(&physical)
            && buf.pinned_by.is_none()
            && buf.data.len() == data.len()
        {
            buf.data.copy_from_slice(data);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.shared.device.sync()
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.queue).len()
        };
        if dropped > 0 {
            debug!(dropped, "discarding queued home writes");
        }
        self.shared.work.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}
