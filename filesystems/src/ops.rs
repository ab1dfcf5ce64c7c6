// Path-oriented filesystem operations
// This trait is the surface a FUSE or WinFsp binding drives: every call names
// its target by path and the implementation resolves, operates and releases.

use exfat_core::ExFatResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File attributes returned by stat operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub size: u64,
    pub is_directory: bool,
    /// POSIX mode including the file type bits.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// 512-byte blocks
    pub blocks: u64,
    pub accessed: i64,  // Unix timestamp
    pub modified: i64,  // Unix timestamp
    pub changed: i64,   // Unix timestamp
}

/// Directory entry returned by readdir operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub attributes: FileAttributes,
}

/// Filesystem information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub total_space: u64,
    pub free_space: u64,
    pub available_space: u64,
    /// exFAT has no inodes; clusters stand in for them.
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub block_size: u32,
    pub max_filename_length: u32,
    pub filesystem_type: String,
    pub volume_label: Option<String>,
    pub volume_serial: u32,
    pub is_readonly: bool,
}

/// Core filesystem operations trait
/// All operations are synchronous to match WinFsp/FUSE requirements
pub trait FilesystemOps: Send {
    /// Get filesystem information
    fn statfs(&self) -> ExFatResult<FilesystemInfo>;

    /// Get file/directory attributes
    fn stat(&mut self, path: &Path) -> ExFatResult<FileAttributes>;

    /// List directory contents
    fn readdir(&mut self, path: &Path) -> ExFatResult<Vec<DirectoryEntry>>;

    /// Read up to `size` bytes at `offset`
    fn read(&mut self, path: &Path, offset: u64, size: u32) -> ExFatResult<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written
    fn write(&mut self, path: &Path, offset: u64, data: &[u8]) -> ExFatResult<u32>;

    /// Create an empty regular file
    fn create(&mut self, path: &Path) -> ExFatResult<()>;

    /// Create an empty directory
    fn mkdir(&mut self, path: &Path) -> ExFatResult<()>;

    /// Remove a file
    fn unlink(&mut self, path: &Path) -> ExFatResult<()>;

    /// Remove an empty directory
    fn rmdir(&mut self, path: &Path) -> ExFatResult<()>;

    /// Rename a file or directory
    fn rename(&mut self, from: &Path, to: &Path) -> ExFatResult<()>;

    /// Resize a file
    fn truncate(&mut self, path: &Path, size: u64) -> ExFatResult<()>;

    /// Set access and modification times (Unix seconds)
    fn utimens(&mut self, path: &Path, atime: i64, mtime: i64) -> ExFatResult<()>;

    /// Flush any pending writes
    fn sync(&mut self) -> ExFatResult<()>;

    /// Check if filesystem rejects writes
    fn is_readonly(&self) -> bool;

    /// Get filesystem type name
    fn filesystem_type(&self) -> &str;
}

/// Filesystem detector trait - identifies filesystem type from a boot sector
pub trait FilesystemDetector: Send + Sync {
    /// Returns the filesystem type name if detected, None otherwise
    fn detect(&self, boot_sector: &[u8]) -> Option<String>;

    /// Get priority for this detector (higher = checked first)
    fn priority(&self) -> i32 {
        0
    }
}
