#![forbid(unsafe_code)]
//! ringjournal public API facade.
//!
//! Re-exports the journal together with the error type, the identifier
//! newtypes and the device/cache collaborators it runs on, so a filesystem
//! needs a single dependency.

pub use rj_block::{
    BlockCache, BufferCache, ByteDevice, FileByteDevice, MemByteDevice, PinOutcome,
    WriteCompletion, WritebackMode,
};
pub use rj_error::{JournalError, Result};
pub use rj_journal::*;
pub use rj_types::{BlockNumber, ByteOffset, ByteOrder, CommitSeq, OwnerId, ParseError, TxnId};
