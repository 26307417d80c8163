//! On-disk journal header (the log's superblock).
//!
//! ```text
//! offset  size  field
//!      0     4  magic
//!      4     4  endian tag (0x01020304 in the writer's byte order)
//!      8     8  start              circular read cursor (byte offset)
//!     16     8  end                circular write cursor (byte offset)
//!     24     8  size               log capacity in bytes, header block included
//!     32     4  batch_header_size  bytes reserved per batch descriptor
//!     36     4  device_block_size
//!     40     4  checksum           CRC32C of bytes 0..44 with this field zeroed
//!     44     -  zero padding up to device_block_size
//! ```
//!
//! The header occupies log block 0; the circular region is
//! `[device_block_size, size)`.

use crate::checksum::{checksum, checksum_with_zeroed};
use rj_block::ByteDevice;
use rj_error::Result;
use rj_types::{ByteOrder, ParseError};

/// Current header magic ("RJLG").
pub const JOURNAL_MAGIC: u32 = 0x524A_4C47;
/// Magic written by the first on-disk revision. Accepted on open and
/// rewritten as [`JOURNAL_MAGIC`] by the next header write.
pub const LEGACY_MAGIC: u32 = 0x4A4C_4F47;
/// Endian marker, stored in the writer's byte order.
pub const ENDIAN_TAG: u32 = 0x0102_0304;

/// Number of meaningful bytes at the front of the header block.
pub const HEADER_ENCODED_LEN: usize = 44;

const OFF_MAGIC: usize = 0;
const OFF_ENDIAN: usize = 4;
const OFF_START: usize = 8;
const OFF_END: usize = 16;
const OFF_SIZE: usize = 24;
const OFF_BATCH_HEADER_SIZE: usize = 32;
const OFF_DEVICE_BLOCK_SIZE: usize = 36;
const OFF_CHECKSUM: usize = 40;

/// In-memory copy of the on-disk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub batch_header_size: u32,
    pub device_block_size: u32,
    /// Byte order the header was found in. Not persisted as a field.
    pub order: ByteOrder,
    /// Whether the header carried [`LEGACY_MAGIC`].
    pub legacy_magic: bool,
}

impl JournalHeader {
    /// Header for a freshly formatted, empty log.
    #[must_use]
    pub fn new(size: u64, batch_header_size: u32, device_block_size: u32) -> Self {
        let first = u64::from(device_block_size);
        Self {
            start: first,
            end: first,
            size,
            batch_header_size,
            device_block_size,
            order: ByteOrder::Little,
            legacy_magic: false,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Encode into a full header block in little-endian order.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.encode_in(ByteOrder::Little)
    }

    /// Encode into a full header block in the given byte order, always with
    /// the current magic.
    #[must_use]
    pub fn encode_in(&self, order: ByteOrder) -> Vec<u8> {
        let len = (self.device_block_size as usize).max(HEADER_ENCODED_LEN);
        let mut buf = vec![0_u8; len];
        order.put_u32(&mut buf, OFF_MAGIC, JOURNAL_MAGIC);
        order.put_u32(&mut buf, OFF_ENDIAN, ENDIAN_TAG);
        order.put_u64(&mut buf, OFF_START, self.start);
        order.put_u64(&mut buf, OFF_END, self.end);
        order.put_u64(&mut buf, OFF_SIZE, self.size);
        order.put_u32(&mut buf, OFF_BATCH_HEADER_SIZE, self.batch_header_size);
        order.put_u32(&mut buf, OFF_DEVICE_BLOCK_SIZE, self.device_block_size);
        let crc = checksum(&buf[..HEADER_ENCODED_LEN]);
        order.put_u32(&mut buf, OFF_CHECKSUM, crc);
        buf
    }

    /// Decode and checksum-verify a header, detecting its byte order.
    ///
    /// Geometry is not validated here; see [`validate_geometry`](Self::validate_geometry).
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let tag = ByteOrder::Little.read_u32(bytes, OFF_ENDIAN)?;
        let order = if tag == ENDIAN_TAG {
            ByteOrder::Little
        } else if tag == ENDIAN_TAG.swap_bytes() {
            ByteOrder::Big
        } else {
            return Err(ParseError::InvalidField {
                field: "endian",
                reason: "unrecognized endian tag",
            });
        };

        let magic = order.read_u32(bytes, OFF_MAGIC)?;
        let legacy_magic = match magic {
            JOURNAL_MAGIC => false,
            LEGACY_MAGIC => true,
            other => {
                return Err(ParseError::InvalidMagic {
                    expected: u64::from(JOURNAL_MAGIC),
                    actual: u64::from(other),
                });
            }
        };

        let stored = order.read_u32(bytes, OFF_CHECKSUM)?;
        let computed = checksum_with_zeroed(
            &bytes[..HEADER_ENCODED_LEN],
            OFF_CHECKSUM..OFF_CHECKSUM + 4,
        );
        if stored != computed {
            return Err(ParseError::ChecksumMismatch {
                structure: "journal header",
                stored,
                computed,
            });
        }

        Ok(Self {
            start: order.read_u64(bytes, OFF_START)?,
            end: order.read_u64(bytes, OFF_END)?,
            size: order.read_u64(bytes, OFF_SIZE)?,
            batch_header_size: order.read_u32(bytes, OFF_BATCH_HEADER_SIZE)?,
            device_block_size: order.read_u32(bytes, OFF_DEVICE_BLOCK_SIZE)?,
            order,
            legacy_magic,
        })
    }

    /// Check the geometry invariants of a decoded header.
    pub fn validate_geometry(&self) -> std::result::Result<(), ParseError> {
        let dbs = u64::from(self.device_block_size);
        if dbs == 0 || !dbs.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "device_block_size",
                reason: "must be a non-zero power of two",
            });
        }
        let aligned = |value: u64| value % dbs == 0;
        if !aligned(self.size) || self.size < 2 * dbs {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "must be a block multiple holding the header and one block",
            });
        }
        let bhs = u64::from(self.batch_header_size);
        if !aligned(bhs) || bhs == 0 || bhs >= self.size - dbs {
            return Err(ParseError::InvalidField {
                field: "batch_header_size",
                reason: "must be a non-zero block multiple smaller than the log",
            });
        }
        for (field, cursor) in [("start", self.start), ("end", self.end)] {
            if cursor < dbs || cursor > self.size || !aligned(cursor) {
                return Err(ParseError::InvalidField {
                    field,
                    reason: "cursor outside the circular region",
                });
            }
        }
        Ok(())
    }

    /// Write the header block (little-endian, current magic) and sync the log.
    pub(crate) fn persist(&mut self, log: &dyn ByteDevice) -> Result<()> {
        self.order = ByteOrder::Little;
        self.legacy_magic = false;
        log.write_all_at(0, &self.encode())?;
        log.sync()
    }

    /// Fold a cursor sitting exactly at `size` back to the first data block.
    pub fn normalize(&mut self) {
        let first = u64::from(self.device_block_size);
        if self.start == self.size {
            self.start = first;
        }
        if self.end == self.size {
            self.end = first;
        }
    }
}
