// exFAT FilesystemOps implementation for mounting
// Each call resolves its path, runs the engine operation and releases the
// node again, the sequence a FUSE or WinFsp callback performs.

use super::file_operations::NodeStat;
use super::mount::ExFat;
use super::structures::EXFAT_NAME_MAX;
use crate::ops::{DirectoryEntry, FileAttributes, FilesystemInfo, FilesystemOps};
use exfat_core::{ExFatError, ExFatResult, MountOptions};
use std::path::Path;

/// exFAT filesystem operations wrapper
pub struct ExFatOps {
    fs: ExFat,
}

fn path_str(path: &Path) -> ExFatResult<&str> {
    path.to_str()
        .ok_or_else(|| ExFatError::InvalidName(format!("{} is not UTF-8", path.display())))
}

fn attributes(st: NodeStat) -> FileAttributes {
    FileAttributes {
        size: st.size,
        is_directory: st.mode & 0o170000 == 0o040000,
        mode: st.mode,
        nlink: st.nlink,
        uid: st.uid,
        gid: st.gid,
        blocks: st.blocks,
        accessed: st.atime,
        modified: st.mtime,
        changed: st.ctime,
    }
}

impl ExFatOps {
    pub fn new(fs: ExFat) -> Self {
        Self { fs }
    }

    pub fn mount(spec: impl AsRef<Path>, options: MountOptions) -> ExFatResult<Self> {
        Ok(Self::new(ExFat::mount(spec, options)?))
    }

    pub fn filesystem(&self) -> &ExFat {
        &self.fs
    }

    pub fn unmount(self) -> ExFatResult<()> {
        self.fs.unmount()
    }
}

impl FilesystemOps for ExFatOps {
    fn statfs(&self) -> ExFatResult<FilesystemInfo> {
        let sb = self.fs.super_block();
        let cluster_size = sb.cluster_size();
        let free = self.fs.count_free_clusters() as u64;
        let label = self.fs.get_label();
        Ok(FilesystemInfo {
            total_space: sb.cluster_count as u64 * cluster_size,
            free_space: free * cluster_size,
            available_space: free * cluster_size,
            total_inodes: sb.cluster_count as u64,
            free_inodes: free,
            block_size: cluster_size as u32,
            max_filename_length: EXFAT_NAME_MAX as u32,
            filesystem_type: self.filesystem_type().to_string(),
            volume_label: if label.is_empty() { None } else { Some(label) },
            volume_serial: sb.volume_serial,
            is_readonly: self.fs.is_read_only(),
        })
    }

    fn stat(&mut self, path: &Path) -> ExFatResult<FileAttributes> {
        let node = self.fs.lookup(path_str(path)?)?;
        Ok(attributes(self.fs.stat(&node)))
    }

    fn readdir(&mut self, path: &Path) -> ExFatResult<Vec<DirectoryEntry>> {
        let dir = self.fs.lookup(path_str(path)?)?;
        let entries = self
            .fs
            .opendir(&dir)?
            .map(|node| DirectoryEntry {
                name: node.name(),
                attributes: attributes(self.fs.stat(&node)),
            })
            .collect();
        Ok(entries)
    }

    fn read(&mut self, path: &Path, offset: u64, size: u32) -> ExFatResult<Vec<u8>> {
        let node = self.fs.lookup(path_str(path)?)?;
        if node.is_dir() {
            return Err(ExFatError::IsADirectory);
        }
        let mut buffer = vec![0u8; size as usize];
        let read = self.fs.pread(&node, &mut buffer, offset)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn write(&mut self, path: &Path, offset: u64, data: &[u8]) -> ExFatResult<u32> {
        let node = self.fs.lookup(path_str(path)?)?;
        if node.is_dir() {
            return Err(ExFatError::IsADirectory);
        }
        let written = self.fs.pwrite(&node, data, offset)?;
        Ok(written as u32)
    }

    fn create(&mut self, path: &Path) -> ExFatResult<()> {
        self.fs.mknod(path_str(path)?)
    }

    fn mkdir(&mut self, path: &Path) -> ExFatResult<()> {
        self.fs.mkdir(path_str(path)?)
    }

    fn unlink(&mut self, path: &Path) -> ExFatResult<()> {
        let node = self.fs.lookup(path_str(path)?)?;
        self.fs.unlink(&node)
    }

    fn rmdir(&mut self, path: &Path) -> ExFatResult<()> {
        let node = self.fs.lookup(path_str(path)?)?;
        self.fs.rmdir(&node)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> ExFatResult<()> {
        self.fs.rename(path_str(from)?, path_str(to)?)
    }

    fn truncate(&mut self, path: &Path, size: u64) -> ExFatResult<()> {
        let node = self.fs.lookup(path_str(path)?)?;
        if node.is_dir() {
            return Err(ExFatError::IsADirectory);
        }
        self.fs.truncate(&node, size)
    }

    fn utimens(&mut self, path: &Path, atime: i64, mtime: i64) -> ExFatResult<()> {
        let node = self.fs.lookup(path_str(path)?)?;
        self.fs.utimes(&node, atime, mtime)
    }

    fn sync(&mut self) -> ExFatResult<()> {
        self.fs.sync()
    }

    fn is_readonly(&self) -> bool {
        self.fs.is_read_only()
    }

    fn filesystem_type(&self) -> &str {
        "exfat"
    }
}
