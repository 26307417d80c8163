#![allow(dead_code)]
//! Shared rig: a log device, a filesystem device and a block cache over it.

use rj_block::{BlockCache, MemByteDevice, WritebackMode};
use rj_error::Result;
use rj_journal::{Journal, JournalDevices, JournalOptions, TransactionHandle};
use rj_types::{BlockNumber, OwnerId};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const UNIT: u32 = 512;
pub const LOG_SIZE: u64 = 64 * 1024;
pub const SMALL_LOG: u64 = 16 * 1024;
pub const FS_SIZE: usize = 512 * 256;

/// Small descriptors, no group commit, generous retry ceilings.
pub fn options() -> JournalOptions {
    JournalOptions {
        batch_header_size: 512,
        group_commit: false,
        free_space_retries: 5_000,
        ring_retries: 5_000,
        close_retries: 5_000,
        ..JournalOptions::default()
    }
}

pub struct Rig {
    pub log: Arc<MemByteDevice>,
    pub fs: Arc<MemByteDevice>,
    pub cache: Arc<BlockCache>,
}

impl Rig {
    pub fn new(log_size: u64, mode: WritebackMode) -> Self {
        let log = Arc::new(MemByteDevice::new(
            usize::try_from(log_size).expect("log size"),
        ));
        let fs = Arc::new(MemByteDevice::new(FS_SIZE));
        Self::from_devices(log, fs, mode)
    }

    pub fn from_devices(log: Arc<MemByteDevice>, fs: Arc<MemByteDevice>, mode: WritebackMode) -> Self {
        let cache = Arc::new(BlockCache::new(fs.clone(), UNIT, mode).expect("cache"));
        Self { log, fs, cache }
    }

    pub fn devices(&self) -> JournalDevices {
        JournalDevices::new(self.log.clone(), self.cache.clone())
            .with_flush_hook(self.cache.flush_hook())
    }

    pub fn create(&self, log_size: u64, options: &JournalOptions) -> Journal {
        Journal::create(self.devices(), log_size, UNIT, options).expect("create journal")
    }

    pub fn open(&self, log_size: u64, options: &JournalOptions) -> Result<Journal> {
        Journal::open(self.devices(), log_size, UNIT, options)
    }

    /// Power cut: both media exactly as they are now, behind a fresh cache.
    pub fn crash(&self) -> Self {
        Self::from_devices(
            Arc::new(self.log.snapshot()),
            Arc::new(self.fs.snapshot()),
            WritebackMode::Immediate,
        )
    }

    /// Home contents of `len` bytes at `block`.
    pub fn home(&self, block: u64, len: usize) -> Vec<u8> {
        self.fs
            .read_vec(block * u64::from(UNIT), len)
            .expect("read home")
    }
}

/// Stage `block` (`len` bytes) with every byte set to `fill`.
pub fn write_block(txn: &TransactionHandle<'_>, cache: &BlockCache, block: u64, len: u32, fill: u8) {
    let block = BlockNumber(block);
    cache.load(block, len).expect("load");
    let pin = txn.stage_block_start(block).expect("pin");
    cache.modify(block, |data| data.fill(fill)).expect("modify");
    txn.stage_block_end(pin).expect("stage");
}

/// One transaction of `(block, len, fill)` writes.
pub fn commit_blocks(journal: &Journal, cache: &BlockCache, owner: u64, blocks: &[(u64, u32, u8)]) {
    let txn = journal.begin(OwnerId(owner)).expect("begin");
    for &(block, len, fill) in blocks {
        write_block(&txn, cache, block, len, fill);
    }
    txn.end().expect("end");
}

/// Poll `cond` for up to five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
