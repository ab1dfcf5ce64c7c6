// File data access: positional read/write through the cluster chain,
// resizing, timestamps and stat.

use super::mount::{ExFat, Volume};
use super::node::{Node, NodeFlags, NodeId};
use super::structures::cluster_invalid;
use exfat_core::{ExFatError, ExFatResult};
use log::trace;
use serde::{Deserialize, Serialize};

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// POSIX-style attributes of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// 512-byte blocks, whole clusters.
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    /// exFAT has no change time; this mirrors `mtime`.
    pub ctime: i64,
}

impl Volume {
    fn invalid_cluster(&self, cluster: u32, what: &str) -> ExFatError {
        self.fail(ExFatError::Corrupted(format!(
            "invalid cluster {:#x} while {}",
            cluster, what
        )))
    }

    pub(crate) fn pread(&mut self, id: NodeId, buffer: &mut [u8], offset: u64) -> ExFatResult<usize> {
        let node_size = self.nodes[id].size;
        if buffer.is_empty() || offset >= node_size {
            return Ok(0);
        }

        let cluster_size = self.cluster_size();
        let mut cluster = self.advance_cluster(id, (offset / cluster_size) as u32);
        if cluster_invalid(cluster) {
            return Err(self.invalid_cluster(cluster, "reading"));
        }

        let total = (buffer.len() as u64).min(node_size - offset) as usize;
        let mut loffset = offset % cluster_size;
        let mut done = 0;
        while done < total {
            if cluster_invalid(cluster) {
                return Err(self.invalid_cluster(cluster, "reading"));
            }
            let lsize = ((cluster_size - loffset) as usize).min(total - done);
            self.dev
                .read_at(&mut buffer[done..done + lsize], self.c2o(cluster) + loffset);
            done += lsize;
            loffset = 0;
            if done < total {
                cluster = self.next_cluster(id, cluster);
            }
        }

        if self.ro.is_none() && !self.options.noatime {
            self.update_atime(id);
        }
        trace!("read {} bytes at {} from `{}'", done, offset, self.nodes[id].display_name());
        Ok(done)
    }

    pub(crate) fn pwrite(&mut self, id: NodeId, buffer: &[u8], offset: u64) -> ExFatResult<usize> {
        let end = offset.checked_add(buffer.len() as u64).ok_or_else(|| {
            ExFatError::InvalidArgument(format!("write of {} bytes at {}", buffer.len(), offset))
        })?;
        if end > self.nodes[id].size {
            self.truncate(id, end)?;
        }
        if buffer.is_empty() {
            return Ok(0);
        }

        let cluster_size = self.cluster_size();
        let mut cluster = self.advance_cluster(id, (offset / cluster_size) as u32);
        if cluster_invalid(cluster) {
            return Err(self.invalid_cluster(cluster, "writing"));
        }

        let mut loffset = offset % cluster_size;
        let mut done = 0;
        while done < buffer.len() {
            if cluster_invalid(cluster) {
                return Err(self.invalid_cluster(cluster, "writing"));
            }
            let lsize = ((cluster_size - loffset) as usize).min(buffer.len() - done);
            self.dev
                .write_at(&buffer[done..done + lsize], self.c2o(cluster) + loffset);
            done += lsize;
            loffset = 0;
            if done < buffer.len() {
                cluster = self.next_cluster(id, cluster);
            }
        }

        self.update_mtime(id);
        trace!("wrote {} bytes at {} to `{}'", done, offset, self.nodes[id].display_name());
        Ok(done)
    }

    pub(crate) fn stat(&self, id: NodeId) -> NodeStat {
        let node = &self.nodes[id];
        let mode = if node.is_dir() {
            S_IFDIR | (0o777 & !self.options.dmask)
        } else {
            S_IFREG | (0o777 & !self.options.fmask)
        };
        let cluster_size = self.cluster_size();
        NodeStat {
            mode,
            nlink: 1,
            uid: self.options.uid,
            gid: self.options.gid,
            size: node.size,
            blocks: node.size.div_ceil(cluster_size) * cluster_size / 512,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.mtime,
        }
    }
}

impl ExFat {
    /// Read up to `buffer.len()` bytes at `offset`. Returns 0 at or past the
    /// end of the file.
    pub fn pread(&self, node: &Node<'_>, buffer: &mut [u8], offset: u64) -> ExFatResult<usize> {
        self.volume_mut().pread(node.id(), buffer, offset)
    }

    /// Write `buffer` at `offset`, extending the file first if needed.
    pub fn pwrite(&self, node: &Node<'_>, buffer: &[u8], offset: u64) -> ExFatResult<usize> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        volume.pwrite(node.id(), buffer, offset)
    }

    /// Resize to `size` bytes. New space reads back as zeros.
    pub fn truncate(&self, node: &Node<'_>, size: u64) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        volume.truncate(node.id(), size)
    }

    pub fn utimes(&self, node: &Node<'_>, atime: i64, mtime: i64) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        let data = &mut volume.nodes[node.id()];
        data.atime = atime;
        data.mtime = mtime;
        data.flags |= NodeFlags::DIRTY;
        Ok(())
    }

    pub fn stat(&self, node: &Node<'_>) -> NodeStat {
        self.volume().stat(node.id())
    }

    /// Write the node's metadata records now instead of on the last release.
    pub fn flush_node(&self, node: &Node<'_>) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        if volume.nodes[node.id()].flags.contains(NodeFlags::DIRTY) {
            volume.flush_node(node.id());
        }
        Ok(())
    }
}
