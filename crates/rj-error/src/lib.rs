#![forbid(unsafe_code)]
//! Error type for ringjournal.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `rj-types` | Byte-level format violations while decoding headers and descriptors |
//! | Runtime | `JournalError` | `rj-error` (this crate) | Errors returned to the filesystem driver |
//!
//! `rj-error` does not depend on `rj-types`. The `ParseError -> JournalError`
//! conversion lives in `rj-journal`, which knows the log offset being decoded
//! and reports it as [`JournalError::Corrupt`].
//!
//! ## Invalid journals
//!
//! An I/O failure while committing leaves the log in a state that can only be
//! repaired by replay on the next open. The journal records this and every
//! later call returns [`JournalError::InvalidState`] until `close`.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corrupt` | `EIO` |
//! | `OutOfBounds` | `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `DeviceMismatch` | `EINVAL` |
//! | `InvalidState` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Operating system I/O error on the log or a home block.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The log could not make room: the free-space or in-flight ring wait hit
    /// its retry ceiling because outstanding home writes are not completing.
    #[error("no space left in journal")]
    NoSpace,

    /// Header or batch descriptor failed checksum or geometry validation.
    ///
    /// `offset` is the byte offset in the log of the structure being decoded.
    #[error("corrupt journal at log offset {offset}: {detail}")]
    Corrupt { offset: u64, detail: String },

    /// The device geometry is incompatible with the formatted log.
    #[error("device mismatch: {0}")]
    DeviceMismatch(String),

    /// The journal has been marked invalid, or the API was misused.
    #[error("invalid journal state: {0}")]
    InvalidState(String),

    /// A device access fell outside the device.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
}

impl JournalError {
    /// Shorthand for [`JournalError::Corrupt`].
    pub fn corrupt(offset: u64, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            offset,
            detail: detail.into(),
        }
    }

    /// Shorthand for [`JournalError::InvalidState`].
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidState(detail.into())
    }

    /// Convert this error into a POSIX errno for the filesystem driver.
    ///
    /// The mapping is exhaustive so a new variant is a compile error until its
    /// errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corrupt { .. } | Self::OutOfBounds(_) => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::DeviceMismatch(_) | Self::InvalidState(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `JournalError`.
pub type Result<T> = std::result::Result<T, JournalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(JournalError, libc::c_int)> = vec![
            (JournalError::Io(std::io::Error::other("test")), libc::EIO),
            (JournalError::NoSpace, libc::ENOSPC),
            (JournalError::corrupt(4096, "bad checksum"), libc::EIO),
            (
                JournalError::DeviceMismatch("block size".into()),
                libc::EINVAL,
            ),
            (JournalError::invalid("journal aborted"), libc::EINVAL),
            (JournalError::OutOfBounds("offset".into()), libc::EIO),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EROFS);
        assert_eq!(JournalError::Io(raw).to_errno(), libc::EROFS);
    }

    #[test]
    fn display_formatting() {
        let err = JournalError::corrupt(8192, "descriptor checksum mismatch");
        assert_eq!(
            err.to_string(),
            "corrupt journal at log offset 8192: descriptor checksum mismatch"
        );
        assert_eq!(JournalError::NoSpace.to_string(), "no space left in journal");
        assert!(
            JournalError::invalid("journal aborted")
                .to_string()
                .starts_with("invalid journal state:")
        );
    }
}
