//! Device I/O clients
//!
//! Buffers are addressed by byte offset within a device, so every client
//! exposes positional `read`/`write`. RAM devices keep their bytes in memory;
//! file devices map the target onto one pre-sized file and use positioned
//! reads and writes so concurrent buffers never share a file cursor.

use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tierio_common::config::DeviceKind;
use tierio_common::{Error, Result};
use tracing::debug;

/// Memory-backed device
#[derive(Debug)]
pub struct RamDevice {
    data: RwLock<Vec<u8>>,
}

impl RamDevice {
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0; size as usize]),
        }
    }
}

/// File-backed device
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
}

impl FileDevice {
    /// Create (or truncate) the backing file and size it
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {}: {}", path.display(), e)))?;
        file.set_len(size).map_err(|e| {
            Error::Storage(format!("failed to set size for {}: {}", path.display(), e))
        })?;

        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// I/O client for one device
#[derive(Debug)]
pub enum IoClient {
    Ram(RamDevice),
    File(FileDevice),
}

impl IoClient {
    /// Initialize the device behind a target
    ///
    /// File devices live at `<mount_point>/<file_name>`.
    pub fn init(kind: DeviceKind, mount_point: Option<&Path>, file_name: &str, size: u64) -> Result<Self> {
        match kind {
            DeviceKind::Ram => Ok(Self::Ram(RamDevice::new(size))),
            DeviceKind::File => {
                let mount_point = mount_point.ok_or_else(|| {
                    Error::configuration(format!("file device {file_name} has no mount point"))
                })?;
                let path = mount_point.join(file_name);
                debug!("Creating device file {} ({} bytes)", path.display(), size);
                FileDevice::create(path, size).map(Self::File)
            }
        }
    }

    /// Size of the device in bytes
    pub fn size(&self) -> Result<u64> {
        match self {
            Self::Ram(ram) => Ok(ram.data.read().len() as u64),
            Self::File(dev) => dev
                .file
                .metadata()
                .map(|m| m.len())
                .map_err(|e| Error::Storage(format!("failed to stat {}: {}", dev.path.display(), e))),
        }
    }

    /// Write `data` at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Self::Ram(ram) => {
                let mut bytes = ram.data.write();
                let range = Self::range(bytes.len(), offset, data.len())?;
                bytes[range].copy_from_slice(data);
                Ok(())
            }
            Self::File(dev) => dev.file.write_all_at(data, offset).map_err(|e| {
                Error::Storage(format!("write failed on {}: {}", dev.path.display(), e))
            }),
        }
    }

    /// Fill `buf` from `offset`
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Ram(ram) => {
                let bytes = ram.data.read();
                let range = Self::range(bytes.len(), offset, buf.len())?;
                buf.copy_from_slice(&bytes[range]);
                Ok(())
            }
            Self::File(dev) => dev.file.read_exact_at(buf, offset).map_err(|e| {
                Error::Storage(format!("read failed on {}: {}", dev.path.display(), e))
            }),
        }
    }

    /// Flush file devices to stable storage
    pub fn sync(&self) -> Result<()> {
        match self {
            Self::Ram(_) => Ok(()),
            Self::File(dev) => dev.file.sync_data().map_err(|e| {
                Error::Storage(format!("sync failed on {}: {}", dev.path.display(), e))
            }),
        }
    }

    fn range(size: usize, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| Error::storage(format!("offset {offset} out of range")))?;
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(Error::storage(format!(
                "access of {len} bytes at {offset} exceeds device size {size}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_read_write() {
        let io = IoClient::init(DeviceKind::Ram, None, "ram", 64).unwrap();
        io.write(10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        io.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(io.size().unwrap(), 64);
    }

    #[test]
    fn test_ram_bounds() {
        let io = IoClient::init(DeviceKind::Ram, None, "ram", 16).unwrap();
        assert!(io.write(12, b"hello").is_err());
        let mut buf = [0u8; 4];
        assert!(io.read(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_file_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let io = IoClient::init(DeviceKind::File, Some(dir.path()), "nvme.dat", 8192).unwrap();
        assert_eq!(io.size().unwrap(), 8192);

        io.write(4096, b"test data pattern").unwrap();
        io.sync().unwrap();

        let mut buf = vec![0u8; 17];
        io.read(4096, &mut buf).unwrap();
        assert_eq!(buf, b"test data pattern");
        assert!(dir.path().join("nvme.dat").exists());
    }

    #[test]
    fn test_file_requires_mount_point() {
        let err = IoClient::init(DeviceKind::File, None, "nvme.dat", 8192).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
