// Block device / image file access for the exFAT engine
// Every transfer is fixed-size: callers never deal with partial reads or writes

use crate::error::{ExFatError, ExFatResult};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};

/// How the backing device should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Try read-write first, fall back to read-only if that fails.
    Any,
}

#[cfg(target_os = "linux")]
mod ioctl {
    // BLKROGET: _IO(0x12, 94)
    nix::ioctl_read_bad!(blkroget, nix::request_code_none!(0x12, 94), nix::libc::c_int);
}

/// An opened block device, partition or image file.
#[derive(Debug)]
pub struct Device {
    file: File,
    path: PathBuf,
    mode: OpenMode,
    size: u64,
}

impl Device {
    /// Open `spec` in the requested mode. With [`OpenMode::Any`] the
    /// returned device reports the mode that actually succeeded.
    pub fn open(spec: impl AsRef<Path>, mode: OpenMode) -> ExFatResult<Self> {
        let path = spec.as_ref().to_path_buf();

        let (file, mode) = match mode {
            OpenMode::ReadOnly => (Self::open_ro(&path).map_err(|e| {
                error!("failed to open `{}' in read-only mode", path.display());
                e
            })?, OpenMode::ReadOnly),
            OpenMode::ReadWrite => (Self::open_rw(&path).map_err(|e| {
                error!("failed to open `{}' in read-write mode", path.display());
                e
            })?, OpenMode::ReadWrite),
            OpenMode::Any => match Self::open_rw(&path) {
                Ok(file) => (file, OpenMode::ReadWrite),
                Err(_) => {
                    let file = Self::open_ro(&path).map_err(|e| {
                        error!("failed to open `{}'", path.display());
                        e
                    })?;
                    warn!("`{}' is write-protected, mounting read-only", path.display());
                    (file, OpenMode::ReadOnly)
                }
            },
        };

        let file_type = file.metadata()?.file_type();
        if !file_type.is_block_device() && !file_type.is_char_device() && !file_type.is_file() {
            return Err(ExFatError::InvalidArgument(format!(
                "`{}' is neither a device, nor a regular file",
                path.display()
            )));
        }

        let mut device = Self { file, path, mode, size: 0 };
        device.size = device.seek(SeekFrom::End(0))?;
        if device.size == 0 {
            return Err(ExFatError::InvalidArgument(format!(
                "failed to get size of `{}'",
                device.path.display()
            )));
        }
        device.seek(SeekFrom::Start(0))?;

        debug!("opened `{}' ({:?}, {} bytes)", device.path.display(), device.mode, device.size);
        Ok(device)
    }

    fn open_ro(path: &Path) -> ExFatResult<File> {
        Ok(OpenOptions::new().read(true).open(path)?)
    }

    fn open_rw(path: &Path) -> ExFatResult<File> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // After `blockdev --setro` the kernel still lets a block device be
        // opened read-write but fails the writes.
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;

            if file.metadata()?.file_type().is_block_device() {
                let mut ro: nix::libc::c_int = 0;
                let rc = unsafe { ioctl::blkroget(file.as_raw_fd(), &mut ro) };
                if rc.is_ok() && ro != 0 {
                    return Err(ExFatError::ReadOnly);
                }
            }
        }
        Ok(file)
    }

    /// The mode the device was actually opened in (never [`OpenMode::Any`]).
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seek(&mut self, pos: SeekFrom) -> ExFatResult<u64> {
        Ok(self.file.seek(pos)?)
    }

    /// Read exactly `buffer.len()` bytes at `offset`.
    ///
    /// A short or failed transfer means the device shrank or went away under
    /// us; that is treated as fatal.
    pub fn read_at(&self, buffer: &mut [u8], offset: u64) {
        if let Err(e) = self.file.read_exact_at(buffer, offset) {
            crate::bug!("failed to read {} bytes from file at {}: {}", buffer.len(), offset, e);
        }
    }

    /// Write exactly `buffer.len()` bytes at `offset`. Fatal on failure.
    pub fn write_at(&self, buffer: &[u8], offset: u64) {
        if let Err(e) = self.file.write_all_at(buffer, offset) {
            crate::bug!("failed to write {} bytes to file at {}: {}", buffer.len(), offset, e);
        }
    }

    pub fn fsync(&self) -> ExFatResult<()> {
        self.file.sync_all().map_err(|e| {
            error!("fsync failed");
            ExFatError::Io(e)
        })
    }

    pub fn close(self) -> ExFatResult<()> {
        // Dropping the handle closes it; flush first so close errors surface.
        if self.mode == OpenMode::ReadWrite {
            self.fsync()?;
        }
        debug!("closed `{}'", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn image(size: u64) -> NamedTempFile {
        let temp_file = NamedTempFile::new().unwrap();
        temp_file.as_file().set_len(size).unwrap();
        temp_file
    }

    #[test]
    fn test_open_and_transfer() {
        let temp_file = image(64 * 1024);
        let device = Device::open(temp_file.path(), OpenMode::ReadWrite).unwrap();
        assert_eq!(device.mode(), OpenMode::ReadWrite);
        assert_eq!(device.size(), 64 * 1024);

        device.write_at(b"exfat", 4096);
        let mut buffer = [0u8; 5];
        device.read_at(&mut buffer, 4096);
        assert_eq!(&buffer, b"exfat");
        device.close().unwrap();
    }

    #[test]
    fn test_empty_file_rejected() {
        let temp_file = image(0);
        assert!(Device::open(temp_file.path(), OpenMode::ReadOnly).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Device::open("/nonexistent/exfat.img", OpenMode::Any).unwrap_err();
        assert!(matches!(err, ExFatError::Io(_)));
    }

    #[test]
    #[should_panic(expected = "failed to read")]
    fn test_short_read_is_fatal() {
        let temp_file = image(1024);
        let device = Device::open(temp_file.path(), OpenMode::ReadOnly).unwrap();
        let mut buffer = [0u8; 512];
        device.read_at(&mut buffer, 800);
    }
}
