//! Batch descriptors: the on-disk record of one commit's block list, and the
//! in-memory staging batch it is built from.
//!
//! ```text
//! offset  size  field
//!      0     2  max_count    slots reserved in this descriptor
//!      2     2  used_count
//!      4     4  bytes_used   batch_header_size + sum(slot sizes)
//!      8     4  checksum     CRC32C of bytes 0..28 with this field zeroed
//!     12     4  padding
//!     16  12*n  slots: block u64 (u64::MAX = killed), size u32
//!      -     -  zero padding up to batch_header_size
//! ```
//!
//! The descriptor is followed in the log by the data of every used slot, in
//! slot order. Only the fixed prefix (header plus first slot) is
//! checksummed.

use crate::checksum::checksum_with_zeroed;
use rj_types::{BlockNumber, ByteOrder, ParseError};

pub const BATCH_PREFIX_LEN: usize = 16;
pub const SLOT_LEN: usize = 12;
/// Block number recorded for a killed slot (`-1` as a signed value).
pub const KILLED_BLOCK: u64 = u64::MAX;
/// Bytes covered by the descriptor checksum.
pub const CHECKSUM_SPAN: usize = BATCH_PREFIX_LEN + SLOT_LEN;

const OFF_MAX: usize = 0;
const OFF_USED: usize = 2;
const OFF_BYTES_USED: usize = 4;
const OFF_CHECKSUM: usize = 8;

/// Number of slots a descriptor of `batch_header_size` bytes can hold.
#[must_use]
pub fn max_slots(batch_header_size: u32) -> u16 {
    let room = (batch_header_size as usize).saturating_sub(BATCH_PREFIX_LEN) / SLOT_LEN;
    u16::try_from(room).unwrap_or(u16::MAX)
}

/// One block descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDescriptor {
    /// Physical home block, `None` for a killed slot.
    pub block: Option<BlockNumber>,
    pub size: u32,
}

/// Decoded (or to-be-encoded) batch descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub max_count: u16,
    pub bytes_used: u32,
    pub slots: Vec<SlotDescriptor>,
}

impl BatchDescriptor {
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.slots.len()
    }

    /// Sum of the slot sizes (the data that follows the descriptor).
    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        self.slots.iter().map(|slot| u64::from(slot.size)).sum()
    }

    /// Encode into a `batch_header_size`-byte block with a fresh checksum.
    #[must_use]
    pub fn encode(&self, batch_header_size: u32, order: ByteOrder) -> Vec<u8> {
        debug_assert!(self.slots.len() <= usize::from(self.max_count));
        let len = (batch_header_size as usize)
            .max(BATCH_PREFIX_LEN + usize::from(self.max_count) * SLOT_LEN);
        let mut buf = vec![0_u8; len];
        order.put_u16(&mut buf, OFF_MAX, self.max_count);
        order.put_u16(
            &mut buf,
            OFF_USED,
            u16::try_from(self.slots.len()).unwrap_or(u16::MAX),
        );
        order.put_u32(&mut buf, OFF_BYTES_USED, self.bytes_used);
        for (idx, slot) in self.slots.iter().enumerate() {
            let at = BATCH_PREFIX_LEN + idx * SLOT_LEN;
            order.put_u64(&mut buf, at, slot.block.map_or(KILLED_BLOCK, |b| b.0));
            order.put_u32(&mut buf, at + 8, slot.size);
        }
        let crc = checksum_with_zeroed(&buf[..CHECKSUM_SPAN], OFF_CHECKSUM..OFF_CHECKSUM + 4);
        order.put_u32(&mut buf, OFF_CHECKSUM, crc);
        buf
    }

    /// Decode and checksum-verify a descriptor.
    pub fn decode(bytes: &[u8], order: ByteOrder) -> Result<Self, ParseError> {
        let prefix = rj_types::ensure_slice(bytes, 0, CHECKSUM_SPAN)?;
        let stored = order.read_u32(prefix, OFF_CHECKSUM)?;
        let computed = checksum_with_zeroed(prefix, OFF_CHECKSUM..OFF_CHECKSUM + 4);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch {
                structure: "batch descriptor",
                stored,
                computed,
            });
        }

        let max_count = order.read_u16(bytes, OFF_MAX)?;
        let used = order.read_u16(bytes, OFF_USED)?;
        if used > max_count {
            return Err(ParseError::InvalidField {
                field: "used_count",
                reason: "exceeds max_count",
            });
        }
        let bytes_used = order.read_u32(bytes, OFF_BYTES_USED)?;

        let mut slots = Vec::with_capacity(usize::from(used));
        for idx in 0..usize::from(used) {
            let at = BATCH_PREFIX_LEN + idx * SLOT_LEN;
            let raw = order.read_u64(bytes, at)?;
            let size = order.read_u32(bytes, at + 8)?;
            slots.push(SlotDescriptor {
                block: (raw != KILLED_BLOCK).then_some(BlockNumber(raw)),
                size,
            });
        }

        Ok(Self {
            max_count,
            bytes_used,
            slots,
        })
    }
}

/// A block copied into a staging batch.
#[derive(Debug, Clone)]
pub(crate) struct StagedBlock {
    /// Cache key of the source buffer.
    pub block: BlockNumber,
    /// Home location, filled in at commit time.
    pub physical: Option<BlockNumber>,
    pub size: u32,
    pub data_offset: usize,
    pub killed: bool,
}

/// In-memory staging batch: descriptor slots plus the copied block data.
#[derive(Debug)]
pub(crate) struct Batch {
    max_slots: u16,
    pub entries: Vec<StagedBlock>,
    pub data: Vec<u8>,
}

impl Batch {
    pub fn new(max_slots: u16) -> Self {
        Self {
            max_slots,
            entries: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn has_room(&self, size: u32, staging_bytes: u64) -> bool {
        self.entries.len() < usize::from(self.max_slots)
            && (self.data.len() as u64) + u64::from(size) <= staging_bytes
    }

    /// Append a slot for `block` and return its (zeroed) data region.
    pub fn push(&mut self, block: BlockNumber, size: u32) -> &mut [u8] {
        let data_offset = self.data.len();
        self.data.resize(data_offset + size as usize, 0);
        self.entries.push(StagedBlock {
            block,
            physical: None,
            size,
            data_offset,
            killed: false,
        });
        &mut self.data[data_offset..]
    }

    pub fn slot_data_mut(&mut self, idx: usize) -> &mut [u8] {
        let entry = &self.entries[idx];
        let range = entry.data_offset..entry.data_offset + entry.size as usize;
        &mut self.data[range]
    }

    pub fn find_live(&self, block: BlockNumber) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.block == block && !entry.killed)
    }

    /// Bytes this batch occupies in the log.
    pub fn log_bytes(&self, batch_header_size: u32) -> u64 {
        u64::from(batch_header_size) + self.data.len() as u64
    }

    /// On-disk descriptor for this batch. Live slots must have their physical
    /// block resolved.
    pub fn descriptor(&self, batch_header_size: u32) -> BatchDescriptor {
        BatchDescriptor {
            max_count: self.max_slots,
            bytes_used: u32::try_from(self.log_bytes(batch_header_size)).unwrap_or(u32::MAX),
            slots: self
                .entries
                .iter()
                .map(|entry| SlotDescriptor {
                    block: if entry.killed {
                        None
                    } else {
                        Some(entry.physical.unwrap_or(entry.block))
                    },
                    size: entry.size,
                })
                .collect(),
        }
    }
}
