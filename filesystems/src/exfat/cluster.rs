// Cluster allocator: address arithmetic, FAT chain walking, allocation and
// file resizing (grow, shrink, zero-fill).

use super::mount::Volume;
use super::node::{NodeFlags, NodeId};
use super::structures::{
    cluster_invalid, EXFAT_CLUSTER_END, EXFAT_CLUSTER_FREE, EXFAT_FIRST_DATA_CLUSTER,
};
use byteorder::{ByteOrder, LittleEndian};
use exfat_core::{bug, ExFatError, ExFatResult};
use log::debug;

impl Volume {
    pub(crate) fn cluster_size(&self) -> u64 {
        self.sb.cluster_size()
    }

    /// Sector to absolute offset.
    fn s2o(&self, sector: u64) -> u64 {
        sector << self.sb.sector_bits
    }

    /// Cluster to sector.
    fn c2s(&self, cluster: u32) -> u64 {
        if cluster < EXFAT_FIRST_DATA_CLUSTER {
            bug!("invalid cluster number {}", cluster);
        }
        self.sb.cluster_sector_start as u64
            + (((cluster - EXFAT_FIRST_DATA_CLUSTER) as u64) << self.sb.spc_bits)
    }

    /// Sector to cluster.
    fn s2c(&self, sector: u64) -> u32 {
        ((sector.saturating_sub(self.sb.cluster_sector_start as u64) >> self.sb.spc_bits) as u32)
            + EXFAT_FIRST_DATA_CLUSTER
    }

    /// Cluster to absolute offset.
    pub(crate) fn c2o(&self, cluster: u32) -> u64 {
        self.s2o(self.c2s(cluster))
    }

    /// Cluster + offset from the beginning of the directory to absolute offset.
    pub(crate) fn co2o(&self, cluster: u32, offset: u64) -> u64 {
        self.c2o(cluster) + offset % self.cluster_size()
    }

    /// Size in bytes to size in clusters, rounded up.
    pub(crate) fn bytes_to_clusters(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.cluster_size())
    }

    fn fat_offset(&self, cluster: u32) -> u64 {
        self.s2o(self.sb.fat_sector_start as u64) + cluster as u64 * 4
    }

    /// Raw FAT entry of `cluster`.
    pub(crate) fn read_fat(&self, cluster: u32) -> u32 {
        let mut next = [0u8; 4];
        self.dev.read_at(&mut next, self.fat_offset(cluster));
        LittleEndian::read_u32(&next)
    }

    pub(crate) fn next_cluster(&self, id: NodeId, cluster: u32) -> u32 {
        if cluster < EXFAT_FIRST_DATA_CLUSTER {
            bug!("bad cluster {:#x}", cluster);
        }
        if self.nodes[id].is_contiguous() {
            return cluster + 1;
        }
        self.read_fat(cluster)
    }

    /// Cluster number `count` of the node's chain.
    ///
    /// Walks forward from the cached cursor, or from the start of the chain
    /// when `count` lies behind it. An invalid result is returned as is; the
    /// caller reports it.
    pub(crate) fn advance_cluster(&mut self, id: NodeId, count: u32) -> u32 {
        let node = &self.nodes[id];
        let (mut index, mut cluster) = if node.fptr_index > count {
            (0, node.start_cluster)
        } else {
            (node.fptr_index, node.fptr_cluster)
        };

        while index < count {
            cluster = self.next_cluster(id, cluster);
            index += 1;
            if cluster_invalid(cluster) {
                break;
            }
        }

        let node = &mut self.nodes[id];
        node.fptr_index = count;
        node.fptr_cluster = cluster;
        cluster
    }

    fn set_next_cluster(&self, contiguous: bool, current: u32, next: u32) {
        if contiguous {
            return;
        }
        let mut next_le = [0u8; 4];
        LittleEndian::write_u32(&mut next_le, next);
        self.dev.write_at(&next_le, self.fat_offset(current));
    }

    fn allocate_cluster(&mut self, hint: u32) -> ExFatResult<u32> {
        match self.cmap.allocate(hint) {
            Some(cluster) => Ok(cluster),
            None => Err(self.fail(ExFatError::NoSpace)),
        }
    }

    fn free_cluster(&mut self, cluster: u32) {
        if cluster_invalid(cluster) {
            bug!("freeing invalid cluster {:#x}", cluster);
        }
        if cluster - EXFAT_FIRST_DATA_CLUSTER >= self.cmap.size() {
            bug!(
                "freeing non-existing cluster {:#x} ({:#x})",
                cluster,
                self.cmap.size()
            );
        }
        self.cmap.free(cluster);
    }

    /// Write explicit FAT links for the sequential run `first..=last`.
    fn make_noncontiguous(&self, first: u32, last: u32) {
        for c in first..last {
            self.set_next_cluster(false, c, c + 1);
        }
    }

    fn grow_file(&mut self, id: NodeId, current: u32, difference: u32) -> ExFatResult<()> {
        if difference == 0 {
            bug!("zero clusters count passed");
        }

        let mut allocated = 0;
        let mut previous;
        if self.nodes[id].start_cluster != EXFAT_CLUSTER_FREE {
            previous = self.advance_cluster(id, current - 1);
            if cluster_invalid(previous) {
                return Err(self.fail(ExFatError::Corrupted(format!(
                    "invalid cluster {:#x} while growing",
                    previous
                ))));
            }
        } else {
            if self.nodes[id].fptr_index != 0 {
                bug!("non-zero pointer index ({})", self.nodes[id].fptr_index);
            }
            // An empty file gets its first cluster; a single cluster is contiguous.
            previous = self.allocate_cluster(0)?;
            let node = &mut self.nodes[id];
            node.start_cluster = previous;
            node.fptr_cluster = previous;
            node.flags |= NodeFlags::CONTIGUOUS;
            allocated = 1;
        }

        while allocated < difference {
            let next = match self.allocate_cluster(previous + 1) {
                Ok(next) => next,
                Err(e) => {
                    if allocated != 0 {
                        // Best effort: leave the node at its original size.
                        let _ = self.shrink_file(id, current + allocated, allocated);
                    }
                    return Err(e);
                }
            };
            if next != previous + 1 && self.nodes[id].is_contiguous() {
                // The chain can no longer be described by the start cluster alone.
                let start = self.nodes[id].start_cluster;
                self.make_noncontiguous(start, previous);
                let node = &mut self.nodes[id];
                node.flags.remove(NodeFlags::CONTIGUOUS);
                node.flags.insert(NodeFlags::DIRTY);
                debug!("`{}' is no longer contiguous", node.display_name());
            }
            self.set_next_cluster(self.nodes[id].is_contiguous(), previous, next);
            previous = next;
            allocated += 1;
        }

        self.set_next_cluster(self.nodes[id].is_contiguous(), previous, EXFAT_CLUSTER_END);
        Ok(())
    }

    fn shrink_file(&mut self, id: NodeId, current: u32, mut difference: u32) -> ExFatResult<()> {
        if difference == 0 {
            bug!("zero difference passed");
        }
        if self.nodes[id].start_cluster == EXFAT_CLUSTER_FREE {
            bug!("unable to shrink empty file ({} clusters)", current);
        }
        if current < difference {
            bug!("file underflow ({} < {})", current, difference);
        }

        let contiguous = self.nodes[id].is_contiguous();
        let mut previous;
        if current > difference {
            let last = self.advance_cluster(id, current - difference - 1);
            if cluster_invalid(last) {
                return Err(self.fail(ExFatError::Corrupted(format!(
                    "invalid cluster {:#x} while shrinking",
                    last
                ))));
            }
            previous = self.next_cluster(id, last);
            self.set_next_cluster(contiguous, last, EXFAT_CLUSTER_END);
        } else {
            let node = &mut self.nodes[id];
            previous = node.start_cluster;
            node.start_cluster = EXFAT_CLUSTER_FREE;
        }
        let node = &mut self.nodes[id];
        node.fptr_index = 0;
        node.fptr_cluster = node.start_cluster;

        while difference > 0 {
            difference -= 1;
            if cluster_invalid(previous) {
                return Err(self.fail(ExFatError::Corrupted(format!(
                    "invalid cluster {:#x} while freeing after shrink",
                    previous
                ))));
            }
            let next = if contiguous {
                previous + 1
            } else {
                self.read_fat(previous)
            };
            self.set_next_cluster(contiguous, previous, EXFAT_CLUSTER_FREE);
            self.free_cluster(previous);
            previous = next;
        }

        // Empty files are never contiguous.
        let node = &mut self.nodes[id];
        if node.start_cluster == EXFAT_CLUSTER_FREE {
            node.flags.remove(NodeFlags::CONTIGUOUS);
        }
        Ok(())
    }

    fn erase_raw(&self, size: u64, offset: u64) {
        self.dev.write_at(&self.zero_cluster[..size as usize], offset);
    }

    /// Zero the on-disk bytes `[begin, end)` of the node.
    fn erase_range(&mut self, id: NodeId, begin: u64, end: u64) -> ExFatResult<()> {
        if begin >= end {
            return Ok(());
        }

        let cluster_size = self.cluster_size();
        let mut cluster_boundary = (begin | (cluster_size - 1)) + 1;
        let mut cluster = self.advance_cluster(id, (begin / cluster_size) as u32);
        if cluster_invalid(cluster) {
            return Err(self.fail(ExFatError::Corrupted(format!(
                "invalid cluster {:#x} while erasing",
                cluster
            ))));
        }
        // From the beginning to the closest cluster boundary
        self.erase_raw(
            cluster_boundary.min(end) - begin,
            self.c2o(cluster) + begin % cluster_size,
        );
        // Whole clusters
        while cluster_boundary < end {
            cluster = self.next_cluster(id, cluster);
            if cluster_invalid(cluster) {
                bug!("invalid cluster {:#x} after allocation", cluster);
            }
            self.erase_raw(cluster_size, self.c2o(cluster));
            cluster_boundary += cluster_size;
        }
        Ok(())
    }

    /// Resize the node to `size` bytes, allocating or freeing clusters and
    /// zero-filling any newly exposed range.
    pub(crate) fn truncate(&mut self, id: NodeId, size: u64) -> ExFatResult<()> {
        let node = &self.nodes[id];
        if node.references == 0 && node.parent.is_some() {
            bug!("no references, node changes can be lost");
        }
        if node.size == size {
            return Ok(());
        }

        let old_size = node.size;
        debug!(
            "truncating `{}' from {} to {} bytes",
            node.display_name(),
            old_size,
            size
        );
        // No chain can be longer than the cluster heap.
        if self.bytes_to_clusters(size) > self.cmap.size() as u64 {
            debug!("{} bytes do not fit into the volume", size);
            return Err(ExFatError::NoSpace);
        }
        let c1 = self.bytes_to_clusters(old_size) as u32;
        let c2 = self.bytes_to_clusters(size) as u32;

        if c1 < c2 {
            self.grow_file(id, c1, c2 - c1)?;
        } else if c1 > c2 {
            self.shrink_file(id, c1, c1 - c2)?;
        }

        self.erase_range(id, old_size, size)?;

        self.update_mtime(id);
        let node = &mut self.nodes[id];
        node.size = size;
        node.flags |= NodeFlags::DIRTY;
        Ok(())
    }

    pub(crate) fn flush_cmap(&mut self) {
        let offset = self.c2o(self.cmap.start_cluster);
        let chunk = self.cmap.take_dirty();
        self.dev.write_at(chunk, offset);
    }

    pub(crate) fn count_free_clusters(&self) -> u32 {
        self.cmap.count_free()
    }

    /// Next run of used sectors after `previous`.
    ///
    /// Start with `None`; the first run begins at sector 0 so that the boot
    /// region, the FAT and the leading used clusters are reported together.
    pub(crate) fn find_used_sectors(&self, previous: Option<(u64, u64)>) -> Option<(u64, u64)> {
        let after = match previous {
            None => EXFAT_FIRST_DATA_CLUSTER - 1,
            Some((_, b)) => self.s2c(b),
        };
        let end = self.sb.cluster_count + EXFAT_FIRST_DATA_CLUSTER;
        let (ca, cb) = self.cmap.find_used_clusters(after, end)?;

        let a = match previous {
            None => 0,
            Some(_) => self.c2s(ca),
        };
        let b = self.c2s(cb) + (self.cluster_size() - 1) / self.sb.sector_size();
        Some((a, b))
    }
}

#[cfg(test)]
mod tests {
    use crate::exfat::structures::EXFAT_CLUSTER_END;
    use crate::test_helpers::{read_fat_entry, ImageBuilder};

    #[test]
    fn test_address_arithmetic() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        let volume = fs.volume();
        let layout = image.layout();

        assert_eq!(volume.cluster_size(), 4096);
        assert_eq!(volume.c2o(2), layout.cluster_sector_start as u64 * 512);
        assert_eq!(volume.c2o(3), volume.c2o(2) + 4096);
        assert_eq!(volume.co2o(3, 4096 + 64), volume.c2o(3) + 64);
        assert_eq!(volume.bytes_to_clusters(0), 0);
        assert_eq!(volume.bytes_to_clusters(1), 1);
        assert_eq!(volume.bytes_to_clusters(4096), 1);
        assert_eq!(volume.bytes_to_clusters(10000), 3);
    }

    #[test]
    fn test_truncate_grow_and_shrink() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mknod("/data.bin").unwrap();
        let node = fs.lookup("/data.bin").unwrap();
        let free_before = fs.count_free_clusters();

        fs.truncate(&node, 5 * 4096).unwrap();
        assert_eq!(fs.count_free_clusters(), free_before - 5);
        assert!(node.is_contiguous());

        fs.truncate(&node, 4096 + 1).unwrap();
        assert_eq!(fs.count_free_clusters(), free_before - 2);
        assert_eq!(node.size(), 4097);

        fs.truncate(&node, 0).unwrap();
        assert_eq!(fs.count_free_clusters(), free_before);
        assert!(!node.is_contiguous());
        assert_eq!(node.start_cluster(), 0);
    }

    #[test]
    fn test_noncontiguous_chain_is_terminated() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mknod("/a").unwrap();
        fs.mknod("/b").unwrap();
        let a = fs.lookup("/a").unwrap();
        let b = fs.lookup("/b").unwrap();

        fs.truncate(&a, 4096).unwrap();
        fs.truncate(&b, 4096).unwrap();
        fs.truncate(&a, 2 * 4096).unwrap();
        assert!(!a.is_contiguous());

        let first = a.start_cluster();
        let second = read_fat_entry(&image, first);
        assert_eq!(second, b.start_cluster() + 1);
        assert_eq!(read_fat_entry(&image, second), EXFAT_CLUSTER_END);

        // Shrinking back to one cluster terminates the chain at the first one
        fs.truncate(&a, 100).unwrap();
        assert_eq!(read_fat_entry(&image, first), EXFAT_CLUSTER_END);
        assert_eq!(read_fat_entry(&image, second), 0);
    }

    #[test]
    fn test_find_used_sectors() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        let volume = fs.volume();

        // Bitmap, upcase table and root directory occupy the leading clusters
        let (a, b) = volume.find_used_sectors(None).unwrap();
        assert_eq!(a, 0);
        let layout = image.layout();
        let last_used = layout.rootdir_cluster;
        assert_eq!(b, volume.c2o(last_used) / 512 + 7);
        assert!(volume.find_used_sectors(Some((a, b))).is_none());
    }
}
