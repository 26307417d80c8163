#![forbid(unsafe_code)]
//! Crash-and-replay scenarios.
//!
//! Home writes are held in the cache so that a snapshot of the media taken
//! after `end` looks exactly like a power cut between the log write and the
//! home writes. The snapshot is reopened behind a fresh cache and the home
//! blocks are checked against what was committed.
//!
//! Scenarios:
//! 1. A committed multi-block transaction is replayed; a second open is a no-op.
//! 2. The newest logged copy of a block wins.
//! 3. Partially overlapping blocks of different sizes resolve unit by unit.
//! 4. A log written in big-endian order replays and is rewritten little-endian.
//! 5. The legacy magic is accepted and upgraded on the next header write.
//! 6. Batches that wrap around the end of the region replay intact.
//! 7. A corrupt descriptor fails the open without touching anything;
//!    `force_reset` discards the log.
//! 8. Geometry mismatches on open: log size, block-size adoption.
//! 9. A file-backed log survives a reopen.

mod common;

use common::{LOG_SIZE, Rig, SMALL_LOG, UNIT, commit_blocks, options};
use rj_block::{ByteDevice, FileByteDevice, MemByteDevice, WritebackMode};
use rj_error::JournalError;
use rj_journal::{
    BatchDescriptor, HEADER_ENCODED_LEN, Journal, JournalHeader, JournalOptions, LEGACY_MAGIC,
    SlotDescriptor, checksum_with_zeroed, max_slots,
};
use rj_types::{BlockNumber, ByteOrder};
use std::collections::BTreeMap;
use std::sync::Arc;

fn on_disk_header(log: &MemByteDevice) -> JournalHeader {
    let raw = log.read_vec(0, HEADER_ENCODED_LEN).expect("read header");
    JournalHeader::decode(&raw).expect("decode header")
}

// ---------------------------------------------------------------------------
// Basic replay
// ---------------------------------------------------------------------------

#[test]
fn committed_transaction_is_replayed_after_crash() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Held);
    let journal = rig.create(LOG_SIZE, &options());
    commit_blocks(
        &journal,
        &rig.cache,
        1,
        &[(10, 512, 0xA1), (11, 512, 0xB2), (12, 512, 0xC3)],
    );
    assert_eq!(rig.home(10, 512), vec![0; 512], "home writes are held");
    assert!(!journal.header().is_empty());
    assert!(!on_disk_header(&rig.log).is_empty(), "header end persisted");

    let after = rig.crash();
    drop(journal);

    let reopened = after.open(LOG_SIZE, &options()).expect("open");
    let report = reopened.replay_report().expect("replayed");
    assert_eq!(report.batches, 1);
    assert_eq!(report.entries, 3);
    assert_eq!(report.killed, 0);
    assert_eq!(report.buckets, 3);
    assert_eq!(report.bytes, 3 * 512);
    assert_eq!(after.home(10, 512), vec![0xA1; 512]);
    assert_eq!(after.home(11, 512), vec![0xB2; 512]);
    assert_eq!(after.home(12, 512), vec![0xC3; 512]);
    assert!(reopened.header().is_empty());
    assert!(on_disk_header(&after.log).is_empty(), "replay empties the log");
    reopened.close().expect("close");

    // Nothing left to do the second time around.
    let again = after.crash();
    let reopened = again.open(LOG_SIZE, &options()).expect("reopen");
    assert_eq!(reopened.replay_report().expect("replayed").batches, 0);
    assert_eq!(again.home(11, 512), vec![0xB2; 512]);
}

#[test]
fn newest_copy_of_a_block_wins() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Held);
    let journal = rig.create(LOG_SIZE, &options());
    commit_blocks(&journal, &rig.cache, 1, &[(20, 512, 1), (21, 512, 7)]);
    // Block 20 is still queued under the first transaction, so pinning it
    // again writes that version home before the second one is staged.
    commit_blocks(&journal, &rig.cache, 2, &[(20, 512, 2)]);
    assert_eq!(rig.home(20, 512), vec![1; 512], "prior version forced home");

    let txn = journal.begin(rj_types::OwnerId(3)).expect("begin");
    common::write_block(&txn, &rig.cache, 22, 512, 5);
    common::write_block(&txn, &rig.cache, 22, 512, 6);
    txn.end().expect("end");

    let after = rig.crash();
    drop(journal);
    let reopened = after.open(LOG_SIZE, &options()).expect("open");
    let report = reopened.replay_report().expect("replayed");
    assert_eq!(report.batches, 3);
    assert_eq!(report.entries, 4, "in-transaction restage overwrote in place");
    assert_eq!(after.home(20, 512), vec![2; 512]);
    assert_eq!(after.home(21, 512), vec![7; 512]);
    assert_eq!(after.home(22, 512), vec![6; 512]);
}

// ---------------------------------------------------------------------------
// Overlapping multi-unit blocks
// ---------------------------------------------------------------------------

#[test]
fn partial_overlaps_resolve_per_unit() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Held);
    let journal = rig.create(LOG_SIZE, &options());
    commit_blocks(&journal, &rig.cache, 1, &[(10, 2048, 1)]); // units 10..14
    commit_blocks(&journal, &rig.cache, 1, &[(11, 512, 2)]); // unit 11
    commit_blocks(&journal, &rig.cache, 1, &[(8, 1536, 3)]); // units 8..11

    let after = rig.crash();
    drop(journal);
    let reopened = after.open(LOG_SIZE, &options()).expect("open");
    assert_eq!(reopened.replay_report().expect("replayed").entries, 3);

    let unit = UNIT as usize;
    let mut expected = Vec::new();
    for fill in [3_u8, 3, 3, 2, 1, 1] {
        expected.extend(std::iter::repeat_n(fill, unit));
    }
    assert_eq!(after.home(8, 6 * unit), expected);
    assert_eq!(after.home(14, unit), vec![0; unit], "past the last block");
}

#[test]
fn larger_write_replaces_smaller_ones() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Held);
    let journal = rig.create(LOG_SIZE, &options());
    commit_blocks(
        &journal,
        &rig.cache,
        1,
        &[(30, 512, 1), (31, 512, 2), (33, 1024, 3), (40, 512, 5)],
    );
    commit_blocks(&journal, &rig.cache, 1, &[(29, 4096, 9)]); // units 29..37

    let after = rig.crash();
    drop(journal);
    let reopened = after.open(LOG_SIZE, &options()).expect("open");
    let report = reopened.replay_report().expect("replayed");
    assert_eq!(report.entries, 5);
    assert_eq!(report.buckets, 2, "one run for 29..37, one for block 40");
    assert_eq!(after.home(29, 4096), vec![9; 4096]);
    assert_eq!(after.home(40, 512), vec![5; 512]);
}

// ---------------------------------------------------------------------------
// On-disk format variants
// ---------------------------------------------------------------------------

#[test]
fn big_endian_log_is_replayed_and_rewritten_little_endian() {
    let log = Arc::new(MemByteDevice::new(SMALL_LOG as usize));
    let fs = Arc::new(MemByteDevice::new(common::FS_SIZE));

    // One batch holding block 4 (1024 bytes) and a killed 512-byte slot.
    let bhs = 512_u32;
    let desc = BatchDescriptor {
        max_count: max_slots(bhs),
        bytes_used: bhs + 1024 + 512,
        slots: vec![
            SlotDescriptor {
                block: Some(BlockNumber(4)),
                size: 1024,
            },
            SlotDescriptor {
                block: None,
                size: 512,
            },
        ],
    };
    let mut record = desc.encode(bhs, ByteOrder::Big);
    record.extend(std::iter::repeat_n(0x4B_u8, 1024));
    record.extend(std::iter::repeat_n(0xEE_u8, 512));
    log.write_all_at(512, &record).expect("write batch");

    let mut header = JournalHeader::new(SMALL_LOG, bhs, UNIT);
    header.end = header.start + record.len() as u64;
    log.write_all_at(0, &header.encode_in(ByteOrder::Big))
        .expect("write header");
    assert_eq!(on_disk_header(&log).order, ByteOrder::Big);

    let rig = Rig::from_devices(log, fs, WritebackMode::Immediate);
    let journal = rig.open(SMALL_LOG, &options()).expect("open");
    let report = journal.replay_report().expect("replayed");
    assert_eq!(report.entries, 1);
    assert_eq!(report.killed, 1);
    assert_eq!(rig.home(4, 1024), vec![0x4B; 1024]);
    assert_eq!(rig.home(6, 512), vec![0; 512], "killed slot is skipped");

    let rewritten = on_disk_header(&rig.log);
    assert_eq!(rewritten.order, ByteOrder::Little);
    assert!(rewritten.is_empty());
}

#[test]
fn legacy_magic_is_upgraded_by_the_next_header_write() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Immediate);
    rig.create(LOG_SIZE, &options()).close().expect("close");

    let mut raw = rig.log.read_vec(0, HEADER_ENCODED_LEN).expect("read");
    raw[0..4].copy_from_slice(&LEGACY_MAGIC.to_le_bytes());
    let crc = checksum_with_zeroed(&raw, 40..44);
    raw[40..44].copy_from_slice(&crc.to_le_bytes());
    rig.log.write_all_at(0, &raw).expect("patch header");
    assert!(on_disk_header(&rig.log).legacy_magic);

    let journal = rig.open(LOG_SIZE, &options()).expect("open legacy");
    assert!(journal.header().legacy_magic);
    commit_blocks(&journal, &rig.cache, 1, &[(3, 512, 0x33)]);
    assert!(!on_disk_header(&rig.log).legacy_magic);
    journal.close().expect("close");
    assert_eq!(rig.home(3, 512), vec![0x33; 512]);
}

// ---------------------------------------------------------------------------
// Wraparound
// ---------------------------------------------------------------------------

#[test]
fn batches_wrapping_the_region_end_replay_intact() {
    let rig = Rig::new(SMALL_LOG, WritebackMode::Immediate);
    let journal = rig.create(SMALL_LOG, &options());
    let capacity = journal.capacity();
    assert_eq!(capacity, SMALL_LOG - 512);

    let mut model = BTreeMap::new();
    // Ten 1536-byte commits leave the write cursor one descriptor short of
    // the region end.
    for i in 0..10_u8 {
        let a = u64::from(i % 5);
        let b = 50 + u64::from(i % 3);
        commit_blocks(&journal, &rig.cache, 1, &[(a, 512, i + 1), (b, 512, i + 101)]);
        model.insert(a, i + 1);
        model.insert(b, i + 101);
    }
    rig.cache.wait_idle();
    journal
        .check_free_space(capacity - u64::from(UNIT))
        .expect("log drains");
    assert_eq!(journal.header().end, SMALL_LOG - 512);

    rig.cache.hold_writes();
    commit_blocks(&journal, &rig.cache, 1, &[(60, 512, 0xD1), (2, 512, 0xD2)]);
    commit_blocks(&journal, &rig.cache, 1, &[(61, 512, 0xD3), (51, 512, 0xD4)]);
    model.insert(60, 0xD1);
    model.insert(2, 0xD2);
    model.insert(61, 0xD3);
    model.insert(51, 0xD4);
    let header = journal.header();
    assert!(header.end < header.start, "log wrapped: {header:?}");
    assert_eq!(header.end, 512 + 1024 + 1536);

    let after = rig.crash();
    drop(journal);
    let reopened = after.open(SMALL_LOG, &options()).expect("open");
    assert_eq!(reopened.replay_report().expect("replayed").batches, 2);
    for (&block, &fill) in &model {
        assert_eq!(after.home(block, 512), vec![fill; 512], "block {block}");
    }
}

// ---------------------------------------------------------------------------
// Corruption and reset
// ---------------------------------------------------------------------------

#[test]
fn corrupt_descriptor_fails_open_and_force_reset_discards() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Held);
    let journal = rig.create(LOG_SIZE, &options());
    commit_blocks(&journal, &rig.cache, 1, &[(7, 512, 0x77)]);
    let after = rig.crash();
    drop(journal);

    // Flip a bit in the first slot's block number (inside the checksummed prefix).
    let mut byte = after.log.read_vec(512 + 16, 1).expect("read");
    byte[0] ^= 0x01;
    after.log.write_all_at(512 + 16, &byte).expect("corrupt");
    let log_before = after.log.read_vec(0, LOG_SIZE as usize).expect("log");

    let err = after.open(LOG_SIZE, &options()).expect_err("corrupt log");
    assert!(
        matches!(err, JournalError::Corrupt { offset: 512, .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(after.log.read_vec(0, LOG_SIZE as usize).expect("log"), log_before);
    assert_eq!(after.home(7, 512), vec![0; 512]);

    let reset = JournalOptions {
        force_reset: true,
        ..options()
    };
    let journal = after.open(LOG_SIZE, &reset).expect("force reset");
    assert!(journal.replay_report().is_none());
    assert!(journal.header().is_empty());
    assert!(on_disk_header(&after.log).is_empty());
    assert_eq!(after.home(7, 512), vec![0; 512], "discarded, not replayed");
}

#[test]
fn corrupt_header_is_reported_at_offset_zero() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Immediate);
    rig.create(LOG_SIZE, &options()).close().expect("close");
    rig.log.write_all_at(10, &[0xFF]).expect("corrupt");
    let err = rig.open(LOG_SIZE, &options()).expect_err("bad header");
    assert!(matches!(err, JournalError::Corrupt { offset: 0, .. }), "{err:?}");
}

// ---------------------------------------------------------------------------
// Geometry on open
// ---------------------------------------------------------------------------

#[test]
fn log_size_mismatch_is_rejected() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Immediate);
    rig.create(LOG_SIZE, &options()).close().expect("close");
    let err = rig.open(LOG_SIZE - 4096, &options()).expect_err("size");
    assert!(matches!(err, JournalError::DeviceMismatch(_)), "{err:?}");
}

#[test]
fn recorded_block_size_is_adopted_when_the_device_allows() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Immediate);
    Journal::create(rig.devices(), LOG_SIZE, 1024, &options())
        .expect("create")
        .close()
        .expect("close");

    let journal = rig.open(LOG_SIZE, &options()).expect("adopt");
    assert_eq!(journal.device_block_size(), 1024);
    assert_eq!(journal.batch_header_size(), 1024, "rounded up on create");
    journal.close().expect("close");

    // A device with 4 KiB sectors cannot address 1 KiB log blocks.
    let bytes = rig.log.read_vec(0, LOG_SIZE as usize).expect("image");
    let big_sectors = Arc::new(MemByteDevice::from_bytes(bytes, 4096));
    let rig = Rig::from_devices(big_sectors, rig.fs.clone(), WritebackMode::Immediate);
    let err = rig.open(LOG_SIZE, &options()).expect_err("mismatch");
    assert!(matches!(err, JournalError::DeviceMismatch(_)), "{err:?}");
}

#[test]
fn create_rejects_logs_too_small_for_two_staging_buffers() {
    let rig = Rig::new(LOG_SIZE, WritebackMode::Immediate);
    let err = Journal::create(rig.devices(), 1024, UNIT, &options()).expect_err("tiny");
    assert!(matches!(err, JournalError::DeviceMismatch(_)), "{err:?}");
    let err = Journal::create(rig.devices(), LOG_SIZE * 2, UNIT, &options()).expect_err("big");
    assert!(matches!(err, JournalError::DeviceMismatch(_)), "{err:?}");
}

// ---------------------------------------------------------------------------
// File-backed log
// ---------------------------------------------------------------------------

#[test]
fn file_backed_log_replays_after_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("journal.log");
    let fs = Arc::new(MemByteDevice::new(common::FS_SIZE));
    let cache = Arc::new(
        rj_block::BlockCache::new(fs.clone(), UNIT, WritebackMode::Held).expect("cache"),
    );

    {
        let log = Arc::new(FileByteDevice::create(&path, LOG_SIZE).expect("create file"));
        let devices = rj_journal::JournalDevices::new(log, cache.clone());
        let journal = Journal::create(devices, LOG_SIZE, UNIT, &options()).expect("create");
        commit_blocks(&journal, &cache, 1, &[(5, 1024, 0x55)]);
    }
    let home = Arc::new(fs.snapshot());
    drop(cache);

    let log = Arc::new(FileByteDevice::open(&path).expect("open file"));
    let cache = Arc::new(
        rj_block::BlockCache::new(home.clone(), UNIT, WritebackMode::Immediate).expect("cache"),
    );
    let devices = rj_journal::JournalDevices::new(log, cache);
    let journal = Journal::open(devices, LOG_SIZE, UNIT, &options()).expect("open");
    assert_eq!(journal.replay_report().expect("replayed").entries, 1);
    assert_eq!(home.read_vec(5 * 512, 1024).expect("home"), vec![0x55; 1024]);
    journal.close().expect("close");
}
