#![forbid(unsafe_code)]
//! Circular write-ahead journal for filesystem metadata blocks.
//!
//! A filesystem groups block modifications into a transaction
//! ([`Journal::begin`]), stages each block ([`TransactionHandle`]), and ends
//! the transaction. The journal writes the staged copies to a circular log,
//! advances the on-disk header, and only then lets the buffer cache write the
//! blocks to their home locations. Once every home write of a commit has
//! landed, the log space is reclaimed. [`Journal::open`] replays whatever the
//! log still holds after a crash.
//!
//! ```text
//! log device:  | header | batch | batch | ... free ... | batch |
//!                         ^start                        ^end (wraps)
//! batch:       | descriptor (batch_header_size) | block data ... |
//! ```

mod batch;
mod checksum;
mod config;
mod header;
mod journal;
mod reclaim;
mod region;
mod replay;
mod transaction;

pub use batch::{
    BATCH_PREFIX_LEN, BatchDescriptor, CHECKSUM_SPAN, KILLED_BLOCK, SLOT_LEN, SlotDescriptor,
    max_slots,
};
pub use checksum::{checksum, checksum_with_zeroed};
pub use config::{GROUP_COMMIT_MAX_BATCHES, JournalOptions, MAX_STAGING_BYTES};
pub use header::{ENDIAN_TAG, HEADER_ENCODED_LEN, JOURNAL_MAGIC, JournalHeader, LEGACY_MAGIC};
pub use journal::{FlushHook, Journal, JournalDevices, JournalStats};
pub use replay::ReplayReport;
pub use transaction::{PinnedBlock, TransactionHandle};

use rj_error::JournalError;
use rj_types::ParseError;

/// Report a decode failure of the structure at log `offset`.
pub(crate) fn corrupt_at(offset: u64, err: &ParseError) -> JournalError {
    JournalError::corrupt(offset, err.to_string())
}
