#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the [`ByteDevice`] trait the journal reads and writes its log
//! through, file-backed and in-memory devices, and the [`BufferCache`]
//! collaborator that owns metadata block contents and their pinned/dirty
//! state (with [`BlockCache`] as the reference implementation).

mod cache;

pub use cache::{BlockCache, BufferCache, PinOutcome, WriteCompletion, WritebackMode};

use parking_lot::Mutex;
use rj_error::{JournalError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Sector size assumed when a device does not report one.
pub const DEFAULT_PHYSICAL_BLOCK_SIZE: u32 = 512;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Smallest unit the device can write atomically.
    fn physical_block_size(&self) -> u32 {
        DEFAULT_PHYSICAL_BLOCK_SIZE
    }

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(op: &str, offset: u64, len: usize, dev_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| JournalError::OutOfBounds(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| JournalError::OutOfBounds(format!("{op} range overflows u64")))?;
    if end > dev_len {
        return Err(JournalError::OutOfBounds(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
    physical_block_size: u32,
}

impl FileByteDevice {
    /// Open an existing image, read-write if permitted, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
            physical_block_size: DEFAULT_PHYSICAL_BLOCK_SIZE,
        })
    }

    /// Create (or truncate) an image of exactly `len` zeroed bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
            physical_block_size: DEFAULT_PHYSICAL_BLOCK_SIZE,
        })
    }

    /// Override the reported physical block size (e.g. 4K-native media).
    #[must_use]
    pub fn with_physical_block_size(mut self, size: u32) -> Self {
        self.physical_block_size = size;
        self
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn physical_block_size(&self) -> u32 {
        self.physical_block_size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(JournalError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        check_range("write", offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Besides backing tests and tools, it supports the two things crash tests
/// need: taking a point-in-time [`snapshot`](Self::snapshot) of the media and
/// injecting write failures.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
    physical_block_size: u32,
    fail_writes: AtomicBool,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::with_physical_block_size(len, DEFAULT_PHYSICAL_BLOCK_SIZE)
    }

    #[must_use]
    pub fn with_physical_block_size(len: usize, physical_block_size: u32) -> Self {
        Self::from_bytes(vec![0_u8; len], physical_block_size)
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>, physical_block_size: u32) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            physical_block_size,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Copy of the current media contents as a new device (a "power cut").
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self::from_bytes(self.bytes.lock().clone(), self.physical_block_size)
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0_u8; len];
        self.read_exact_at(offset, &mut out)?;
        Ok(out)
    }

    /// Make every subsequent write (and sync) fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(JournalError::Io(std::io::Error::other(
                "injected write failure",
            )));
        }
        Ok(())
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn physical_block_size(&self) -> u32 {
        self.physical_block_size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range("read", offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(u64::MAX))?;
        let start = usize::try_from(offset)
            .map_err(|_| JournalError::OutOfBounds("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut bytes = self.bytes.lock();
        check_range("write", offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(u64::MAX))?;
        let start = usize::try_from(offset)
            .map_err(|_| JournalError::OutOfBounds("offset overflows usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_writable()
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn physical_block_size(&self) -> u32 {
        (**self).physical_block_size()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips_and_bounds_checks() {
        let dev = MemByteDevice::new(4096);
        dev.write_all_at(512, &[7_u8; 512]).expect("write");
        assert_eq!(dev.read_vec(512, 512).expect("read"), vec![7_u8; 512]);

        let err = dev.write_all_at(4000, &[0_u8; 200]).unwrap_err();
        assert!(matches!(err, JournalError::OutOfBounds(_)));
        let mut buf = [0_u8; 8];
        assert!(dev.read_exact_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn snapshot_is_independent_of_the_original() {
        let dev = MemByteDevice::new(1024);
        dev.write_all_at(0, &[1_u8; 16]).expect("write");
        let snap = dev.snapshot();
        dev.write_all_at(0, &[2_u8; 16]).expect("write");
        assert_eq!(snap.read_vec(0, 16).expect("read"), vec![1_u8; 16]);
        assert_eq!(dev.read_vec(0, 16).expect("read"), vec![2_u8; 16]);
    }

    #[test]
    fn injected_failures_hit_writes_and_sync_only() {
        let dev = MemByteDevice::new(1024);
        dev.set_fail_writes(true);
        assert!(matches!(
            dev.write_all_at(0, &[1_u8; 4]),
            Err(JournalError::Io(_))
        ));
        assert!(dev.sync().is_err());
        assert!(dev.read_vec(0, 4).is_ok());
        dev.set_fail_writes(false);
        assert!(dev.write_all_at(0, &[1_u8; 4]).is_ok());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.img");
        let dev = FileByteDevice::create(&path, 8192).expect("create");
        assert_eq!(dev.len_bytes(), 8192);
        dev.write_all_at(4096, &[9_u8; 4096]).expect("write");
        dev.sync().expect("sync");
        drop(dev);

        let reopened = FileByteDevice::open(&path)
            .expect("open")
            .with_physical_block_size(4096);
        assert_eq!(reopened.physical_block_size(), 4096);
        let mut buf = vec![0_u8; 4096];
        reopened.read_exact_at(4096, &mut buf).expect("read");
        assert_eq!(buf, vec![9_u8; 4096]);
        assert!(matches!(
            reopened.read_exact_at(8000, &mut buf),
            Err(JournalError::OutOfBounds(_))
        ));
    }
}
