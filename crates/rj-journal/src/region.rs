//! Log geometry and circular addressing of the area
//! `[device_block_size, size)`.

use crate::batch::max_slots;
use crate::config::staging_bytes;
use rj_block::ByteDevice;
use rj_error::{JournalError, Result};

/// Fixed geometry of an open log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub device_block_size: u32,
    pub batch_header_size: u32,
    pub size: u64,
    pub staging_bytes: u64,
    pub max_slots: u16,
}

impl Geometry {
    pub fn new(
        size: u64,
        device_block_size: u32,
        batch_header_size: u32,
        memory_budget: u64,
    ) -> Result<Self> {
        let dbs = u64::from(device_block_size);
        if size < 2 * dbs {
            return Err(JournalError::DeviceMismatch(format!(
                "log of {size} bytes cannot hold a header and a data block of {dbs}"
            )));
        }
        let max_slots = max_slots(batch_header_size);
        if max_slots == 0 {
            return Err(JournalError::DeviceMismatch(format!(
                "batch header size {batch_header_size} holds no block descriptors"
            )));
        }
        let capacity = size - dbs;
        let staging_bytes =
            staging_bytes(memory_budget, device_block_size, batch_header_size, capacity);
        let bhs = u64::from(batch_header_size);
        if capacity < 2 * (staging_bytes + bhs) {
            return Err(JournalError::DeviceMismatch(format!(
                "log capacity {capacity} cannot hold two staging buffers of {staging_bytes} \
                 with {bhs}-byte descriptors"
            )));
        }
        Ok(Self {
            device_block_size,
            batch_header_size,
            size,
            staging_bytes,
            max_slots,
        })
    }

    pub fn region(&self) -> LogRegion {
        LogRegion::new(self.device_block_size, self.size)
    }

    pub fn capacity(&self) -> u64 {
        self.size - self.dbs()
    }

    pub fn dbs(&self) -> u64 {
        u64::from(self.device_block_size)
    }

    pub fn bhs(&self) -> u64 {
        u64::from(self.batch_header_size)
    }
}

/// Geometry of the circular part of the log. Offsets handed to it lie in
/// `[first, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogRegion {
    first: u64,
    size: u64,
}

impl LogRegion {
    pub fn new(device_block_size: u32, size: u64) -> Self {
        Self {
            first: u64::from(device_block_size),
            size,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.size - self.first
    }

    /// `offset + len`, wrapping past the end back to the first data block.
    pub fn advance(&self, offset: u64, len: u64) -> u64 {
        let rel = (offset - self.first + len) % self.capacity();
        self.first + rel
    }

    /// Bytes from `from` forward to `to`.
    pub fn distance(&self, from: u64, to: u64) -> u64 {
        if to >= from {
            to - from
        } else {
            self.capacity() - (from - to)
        }
    }

    /// Write `bytes` at `offset`, splitting at the end of the region. Returns
    /// the offset just past the written data.
    pub fn write(&self, dev: &dyn ByteDevice, offset: u64, bytes: &[u8]) -> Result<u64> {
        let tail = (self.size - offset).min(bytes.len() as u64) as usize;
        dev.write_all_at(offset, &bytes[..tail])?;
        if tail < bytes.len() {
            dev.write_all_at(self.first, &bytes[tail..])?;
        }
        Ok(self.advance(offset, bytes.len() as u64))
    }

    /// Fill `buf` from `offset`, following the wrap.
    pub fn read(&self, dev: &dyn ByteDevice, offset: u64, buf: &mut [u8]) -> Result<()> {
        let tail = (self.size - offset).min(buf.len() as u64) as usize;
        let (head, rest) = buf.split_at_mut(tail);
        dev.read_exact_at(offset, head)?;
        if !rest.is_empty() {
            dev.read_exact_at(self.first, rest)?;
        }
        Ok(())
    }
}
