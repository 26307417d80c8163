//! Crash recovery.
//!
//! Everything between `start` and `end` was committed but may not have
//! reached its home location. Replay walks the batches in log order and
//! records, per device block, where the newest copy lives. The table is a
//! sorted, non-overlapping `Vec` of buckets: a new entry replaces the
//! buckets it covers and trims or splits the ones it partially overlaps, so
//! only the latest bytes of every block survive. The buckets are then
//! written home in ascending block order and the log is marked empty.
//!
//! A descriptor that fails its checksum or sanity checks stops replay before
//! anything is written; the log is left as found.

use crate::batch::{BatchDescriptor, max_slots};
use crate::corrupt_at;
use crate::header::JournalHeader;
use crate::region::LogRegion;
use rj_block::{BufferCache, ByteDevice};
use rj_error::{JournalError, Result};
use rj_types::BlockNumber;
use serde::Serialize;
use tracing::{debug, info};

/// What a replay found and applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Batch descriptors scanned.
    pub batches: u64,
    /// Live block entries seen.
    pub entries: u64,
    /// Killed entries skipped.
    pub killed: u64,
    /// Coalesced ranges written home.
    pub buckets: u64,
    pub bytes: u64,
}

/// Newest logged copy of `[block, block + blocks)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bucket {
    block: u64,
    blocks: u64,
    log_offset: u64,
}

impl Bucket {
    fn end(&self) -> u64 {
        self.block + self.blocks
    }
}

#[derive(Debug)]
struct BucketTable {
    buckets: Vec<Bucket>,
    region: LogRegion,
    unit: u64,
}

impl BucketTable {
    fn new(region: LogRegion, unit: u64) -> Self {
        Self {
            buckets: Vec::new(),
            region,
            unit,
        }
    }

    /// Record `[block, block + blocks)` as living at `log_offset`, newer than
    /// everything inserted so far.
    fn insert(&mut self, block: u64, blocks: u64, log_offset: u64) {
        let end = block + blocks;
        let lo = self.buckets.partition_point(|b| b.end() <= block);
        let hi = self.buckets.partition_point(|b| b.block < end);

        let mut replacement = Vec::with_capacity(3);
        if lo < hi {
            let first = self.buckets[lo];
            if first.block < block {
                replacement.push(Bucket {
                    block: first.block,
                    blocks: block - first.block,
                    log_offset: first.log_offset,
                });
            }
        }
        replacement.push(Bucket {
            block,
            blocks,
            log_offset,
        });
        if lo < hi {
            let last = self.buckets[hi - 1];
            if last.end() > end {
                replacement.push(Bucket {
                    block: end,
                    blocks: last.end() - end,
                    log_offset: self
                        .region
                        .advance(last.log_offset, (end - last.block) * self.unit),
                });
            }
        }
        self.buckets.splice(lo..hi, replacement);
    }
}

fn check_descriptor(
    desc: &BatchDescriptor,
    expected_slots: u16,
    batch_header_size: u32,
    unit: u64,
    remaining: u64,
) -> std::result::Result<(), String> {
    if desc.max_count != expected_slots {
        return Err(format!(
            "max_count {} does not match the geometry ({expected_slots})",
            desc.max_count
        ));
    }
    for slot in &desc.slots {
        let size = u64::from(slot.size);
        if size == 0 || size % unit != 0 {
            return Err(format!("slot size {size} is not a multiple of {unit}"));
        }
        if let Some(block) = slot.block
            && block.0.checked_add(size / unit).is_none()
        {
            return Err(format!("block range at {block} overflows"));
        }
    }
    let expected = u64::from(batch_header_size) + desc.data_bytes();
    if u64::from(desc.bytes_used) != expected {
        return Err(format!(
            "bytes_used {} does not match the slots ({expected})",
            desc.bytes_used
        ));
    }
    if expected > remaining {
        return Err(format!(
            "batch of {expected} bytes runs past the end of the log ({remaining} left)"
        ));
    }
    Ok(())
}

/// Replay the live part of the log into the home blocks and empty it.
pub(crate) fn replay(
    log: &dyn ByteDevice,
    cache: &dyn BufferCache,
    header: &mut JournalHeader,
) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();
    if header.is_empty() {
        debug!(target: "rj::replay", start = header.start, "log_empty");
        return Ok(report);
    }

    let region = LogRegion::new(header.device_block_size, header.size);
    let unit = u64::from(header.device_block_size);
    let bhs = header.batch_header_size;
    let expected_slots = max_slots(bhs);
    let mut table = BucketTable::new(region, unit);
    let mut descriptor = vec![0_u8; bhs as usize];

    let mut cursor = header.start;
    while cursor != header.end {
        let remaining = region.distance(cursor, header.end);
        if remaining < u64::from(bhs) {
            return Err(JournalError::corrupt(cursor, "truncated batch descriptor"));
        }
        region.read(log, cursor, &mut descriptor)?;
        let desc = BatchDescriptor::decode(&descriptor, header.order)
            .map_err(|err| corrupt_at(cursor, &err))?;
        check_descriptor(&desc, expected_slots, bhs, unit, remaining)
            .map_err(|detail| JournalError::corrupt(cursor, detail))?;

        let mut data_offset = region.advance(cursor, u64::from(bhs));
        for slot in &desc.slots {
            match slot.block {
                Some(block) => {
                    table.insert(block.0, u64::from(slot.size) / unit, data_offset);
                    report.entries += 1;
                }
                None => report.killed += 1,
            }
            data_offset = region.advance(data_offset, u64::from(slot.size));
        }
        report.batches += 1;
        cursor = region.advance(cursor, u64::from(desc.bytes_used));
    }

    let mut data = Vec::new();
    for bucket in &table.buckets {
        let len = bucket.blocks * unit;
        let len_bytes = rj_types::u64_to_usize(len, "bucket length")
            .map_err(|err| corrupt_at(bucket.log_offset, &err))?;
        data.resize(len_bytes, 0);
        region.read(log, bucket.log_offset, &mut data)?;
        cache.write_home_sync(BlockNumber(bucket.block), &data)?;
        report.buckets += 1;
        report.bytes += len;
    }
    cache.sync()?;

    header.start = header.end;
    header.persist(log)?;
    info!(
        target: "rj::replay",
        batches = report.batches,
        entries = report.entries,
        killed = report.killed,
        buckets = report.buckets,
        bytes = report.bytes,
        "replay_complete"
    );
    Ok(report)
}
