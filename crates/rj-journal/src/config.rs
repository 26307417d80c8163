//! Journal tunables.

use rj_error::{JournalError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard upper bound on one staging buffer.
pub const MAX_STAGING_BYTES: u64 = 1024 * 1024;

/// A transaction with this many batches is always committed immediately.
pub const GROUP_COMMIT_MAX_BATCHES: usize = 3;

/// Options for [`Journal::create`](crate::Journal::create) and
/// [`Journal::open`](crate::Journal::open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalOptions {
    /// Discard the log on open instead of replaying it.
    pub force_reset: bool,
    /// Bytes reserved for each batch descriptor; rounded up to the device
    /// block size on create. Ignored on open (the header is authoritative).
    pub batch_header_size: u32,
    /// Memory the journal may spend on staging; the staging buffer is 1/64
    /// of it, clamped.
    pub memory_budget: u64,
    /// Slots in the ring of in-flight commits.
    pub ring_capacity: usize,
    /// Allow small transactions to be buffered and merged with the next one.
    pub group_commit: bool,
    /// Rounds `check_free_space` waits before giving up with `NoSpace`.
    pub free_space_retries: u32,
    /// Rounds a commit waits for a free in-flight ring slot.
    pub ring_retries: u32,
    /// Rounds `close` waits for the log to drain.
    pub close_retries: u32,
    /// Sleep between retry rounds.
    pub poll_interval_ms: u64,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            force_reset: false,
            batch_header_size: 4096,
            memory_budget: 16 * 1024 * 1024,
            ring_capacity: 16,
            group_commit: true,
            free_space_retries: 10_000,
            ring_retries: 10_000,
            close_retries: 10_000,
            poll_interval_ms: 1,
        }
    }
}

impl JournalOptions {
    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| JournalError::invalid(format!("journal options: {err}")))
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            return Err(JournalError::invalid("ring_capacity must be at least 1"));
        }
        if self.batch_header_size == 0 {
            return Err(JournalError::invalid("batch_header_size must be non-zero"));
        }
        Ok(())
    }
}

/// Staging buffer size for the given geometry.
///
/// 1/64 of the memory budget, at least two descriptors' worth, at most
/// [`MAX_STAGING_BYTES`] and a quarter of the circular capacity.
pub(crate) fn staging_bytes(
    memory_budget: u64,
    device_block_size: u32,
    batch_header_size: u32,
    capacity: u64,
) -> u64 {
    let dbs = u64::from(device_block_size);
    let floor = 2 * u64::from(batch_header_size);
    let ceiling = MAX_STAGING_BYTES.min(capacity / 4).max(floor);
    let wanted = (memory_budget / 64) / dbs * dbs;
    wanted.clamp(floor, ceiling) / dbs * dbs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_in_defaults() {
        let opts = JournalOptions::from_json(r#"{"ring_capacity": 4, "group_commit": false}"#)
            .expect("parse");
        assert_eq!(opts.ring_capacity, 4);
        assert!(!opts.group_commit);
        assert_eq!(opts.batch_header_size, 4096);
        assert!(JournalOptions::from_json("{not json").is_err());
    }

    #[test]
    fn validation_rejects_empty_ring() {
        let opts = JournalOptions {
            ring_capacity: 0,
            ..JournalOptions::default()
        };
        assert!(opts.validate().is_err());
        JournalOptions::default().validate().expect("defaults are valid");
    }

    #[test]
    fn staging_is_clamped() {
        // Plenty of memory and log: capped at the hard maximum.
        assert_eq!(
            staging_bytes(1 << 30, 512, 4096, 64 << 20),
            MAX_STAGING_BYTES
        );
        // Tiny budget: floor of two descriptors.
        assert_eq!(staging_bytes(0, 512, 1024, 64 << 20), 2048);
        // Small log: a quarter of the capacity.
        assert_eq!(staging_bytes(1 << 30, 512, 512, 64 * 1024), 16 * 1024);
        // Budget in between, rounded to the block size.
        assert_eq!(staging_bytes(64 * 10_000, 512, 512, 64 << 20), 9728);
    }
}
