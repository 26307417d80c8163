#![forbid(unsafe_code)]
//! The facade alone is enough to format, use and reopen a journal.

use ringjournal::{
    BlockCache, BlockNumber, Journal, JournalDevices, JournalOptions, MemByteDevice, OwnerId,
    WritebackMode,
};
use std::sync::Arc;

#[test]
fn journal_round_trip_through_the_facade() {
    let log = Arc::new(MemByteDevice::new(64 * 1024));
    let fs = Arc::new(MemByteDevice::new(64 * 1024));
    let cache = Arc::new(BlockCache::new(fs.clone(), 512, WritebackMode::Immediate).expect("cache"));
    let options = JournalOptions::from_json(r#"{"batch_header_size": 512, "group_commit": false}"#)
        .expect("options");

    let devices = JournalDevices::new(log.clone(), cache.clone()).with_flush_hook(cache.flush_hook());
    let journal = Journal::create(devices, 64 * 1024, 512, &options).expect("create");
    let block = BlockNumber(8);
    cache.load(block, 512).expect("load");
    let txn = journal.begin(OwnerId(1)).expect("begin");
    let pin = txn.stage_block_start(block).expect("pin");
    cache.modify(block, |data| data.fill(0x5A)).expect("modify");
    txn.stage_block_end(pin).expect("stage");
    txn.end().expect("end");
    journal.close().expect("close");
    assert_eq!(fs.read_vec(8 * 512, 512).expect("home"), vec![0x5A; 512]);

    let devices = JournalDevices::new(log, cache);
    let journal = Journal::open(devices, 64 * 1024, 512, &options).expect("open");
    assert_eq!(journal.replay_report().map(|r| r.batches), Some(0));
}
