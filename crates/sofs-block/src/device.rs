//! Byte-addressed devices: the contract the cache consumes.

use sofs_error::{Result, SofsError};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "I/O range overflows u64"))?;
    if end > device_len {
        return Err(SofsError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("I/O out of bounds: offset={offset} len={len} device_len={device_len}"),
        )));
    }
    Ok(())
}

/// File-backed byte device using positional I/O.
///
/// `std::os::unix::fs::FileExt` needs no shared seek position, so reads and
/// writes never interfere with each other.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open for read+write, falling back to read-only.
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
            file,
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SofsError::TargetDenied);
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device for tests.
#[derive(Debug)]
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    /// A zero-filled device of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Snapshot the full contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().expect("mem device poisoned").clone()
    }
}

impl ByteDevice for MemDevice {
    fn len_bytes(&self) -> u64 {
        self.data.lock().expect("mem device poisoned").len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().expect("mem device poisoned");
        check_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock().expect("mem device poisoned");
        check_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_device_round_trip() {
        let dev = MemDevice::zeroed(1024);
        dev.write_all_at(512, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0_u8; 4];
        dev.read_exact_at(512, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn mem_device_rejects_out_of_bounds() {
        let dev = MemDevice::zeroed(100);
        let mut buf = [0_u8; 8];
        assert!(dev.read_exact_at(96, &mut buf).is_err());
        assert!(dev.write_all_at(u64::MAX, &buf).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0_u8; 2048]).unwrap();
        tmp.flush().unwrap();

        let dev = FileByteDevice::open(tmp.path()).unwrap();
        assert!(dev.is_writable());
        assert_eq!(dev.len_bytes(), 2048);

        dev.write_all_at(1024, b"sofs").unwrap();
        let mut buf = [0_u8; 4];
        dev.read_exact_at(1024, &mut buf).unwrap();
        assert_eq!(&buf, b"sofs");
        dev.sync().unwrap();
    }

    #[test]
    fn file_device_rejects_out_of_bounds() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0_u8; 512]).unwrap();
        tmp.flush().unwrap();

        let dev = FileByteDevice::open(tmp.path()).unwrap();
        let mut buf = [0_u8; 8];
        assert!(dev.read_exact_at(510, &mut buf).is_err());
    }
}
