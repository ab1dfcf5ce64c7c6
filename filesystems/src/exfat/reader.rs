// On-disk directory iteration and entry-set decoding
// Reads a directory one cluster at a time and turns FILE + FILE_INFO +
// FILE_NAME runs into nodes; picks up BITMAP, UPCASE and LABEL on the way.

use super::bitmap::ClusterBitmap;
use super::checksum::{add_checksum, start_checksum};
use super::mount::Volume;
use super::node::{NodeData, NodeFlags, NodeId};
use super::structures::*;
use super::upcase::{UpcaseTable, UPCASE_MAX_CHARS};
use crate::fat_common::timestamps::exfat_to_unix;
use exfat_core::{bug, ExFatError, ExFatResult};
use log::warn;

/// The one file allowed to have `real_size` different from `size`: Windows
/// leaves `real_size` at 0 for its page file.
const PAGEFILE_NAME: &str = "pagefile.sys";

/// Position inside a directory plus the cluster it lives in.
pub(crate) struct DirCursor {
    pub cluster: u32,
    pub offset: u64,
    chunk: Vec<u8>,
}

impl DirCursor {
    fn entry(&self) -> RawEntry {
        let start = (self.offset % self.chunk.len() as u64) as usize;
        let mut raw = [0u8; ENTRY_SIZE];
        raw.copy_from_slice(&self.chunk[start..start + ENTRY_SIZE]);
        raw
    }

    pub fn entry_type(&self) -> u8 {
        let start = (self.offset % self.chunk.len() as u64) as usize;
        self.chunk[start]
    }
}

/// Partially decoded entry set.
struct PendingNode {
    node: NodeData,
    continuations: u8,
    reference_checksum: u16,
    actual_checksum: u16,
    real_size: u64,
}

fn init_node_meta1(node: &mut NodeData, meta1: &FileEntry) {
    node.flags = NodeFlags::from_attrib(meta1.attrib());
    node.mtime = exfat_to_unix(meta1.mdate(), meta1.mtime(), meta1.mtime_cs());
    // There is no centiseconds field for atime.
    node.atime = exfat_to_unix(meta1.adate(), meta1.atime(), 0);
}

fn init_node_meta2(node: &mut NodeData, meta2: &FileInfoEntry) {
    node.size = meta2.size();
    node.start_cluster = meta2.start_cluster();
    node.name_hash = meta2.name_hash();
    node.fptr_cluster = node.start_cluster;
    if meta2.flags() & EXFAT_FLAG_CONTIGUOUS != 0 {
        node.flags |= NodeFlags::CONTIGUOUS;
    }
}

pub(crate) fn entry_node(meta1: &FileEntry, meta2: &FileInfoEntry) -> NodeData {
    let mut node = NodeData::new();
    init_node_meta1(&mut node, meta1);
    init_node_meta2(&mut node, meta2);
    node
}

fn is_pagefile(name: &[u16]) -> bool {
    String::from_utf16_lossy(name).eq_ignore_ascii_case(PAGEFILE_NAME)
}

impl Volume {
    pub(crate) fn opendir_raw(&self, dir: NodeId) -> ExFatResult<DirCursor> {
        let node = &self.nodes[dir];
        if !node.is_dir() {
            bug!("`{}' is not a directory", node.display_name());
        }
        if cluster_invalid(node.start_cluster) {
            return Err(self.fail(ExFatError::Corrupted(format!(
                "directory `{}' starts at invalid cluster {:#x}",
                node.display_name(),
                node.start_cluster
            ))));
        }
        let mut chunk = vec![0u8; self.cluster_size() as usize];
        self.dev.read_at(&mut chunk, self.c2o(node.start_cluster));
        Ok(DirCursor {
            cluster: node.start_cluster,
            offset: 0,
            chunk,
        })
    }

    /// Move the cursor to the next entry, reading the next cluster when a
    /// boundary is crossed. Reaching the end of the directory is not an
    /// error; callers compare the offset with the directory size.
    pub(crate) fn fetch_next_entry(&self, dir: NodeId, it: &mut DirCursor) -> ExFatResult<()> {
        it.offset += ENTRY_SIZE as u64;
        if it.offset % self.cluster_size() != 0 {
            return Ok(());
        }
        if it.offset >= self.nodes[dir].size {
            return Ok(());
        }
        it.cluster = self.next_cluster(dir, it.cluster);
        if cluster_invalid(it.cluster) {
            return Err(self.fail(ExFatError::Corrupted(format!(
                "invalid cluster {:#x} while reading directory",
                it.cluster
            ))));
        }
        self.dev.read_at(&mut it.chunk, self.c2o(it.cluster));
        Ok(())
    }

    /// Advance an on-disk position by one entry. The caller guarantees the
    /// run fits in the directory, so the next cluster cannot be invalid.
    pub(crate) fn next_entry(&self, parent: NodeId, cluster: &mut u32, offset: &mut u64) {
        *offset += ENTRY_SIZE as u64;
        if *offset % self.cluster_size() == 0 {
            *cluster = self.next_cluster(parent, *cluster);
        }
    }

    pub(crate) fn read_entry(&self, cluster: u32, offset: u64) -> RawEntry {
        let mut raw = [0u8; ENTRY_SIZE];
        self.dev.read_at(&mut raw, self.co2o(cluster, offset));
        raw
    }

    pub(crate) fn write_raw_entry(&self, raw: &RawEntry, cluster: u32, offset: u64) {
        self.dev.write_at(raw, self.co2o(cluster, offset));
    }

    fn corrupted(&self, message: String) -> ExFatError {
        self.fail(ExFatError::Corrupted(message))
    }

    /// Decode entries until one complete file or directory is read.
    ///
    /// Returns `Ok(None)` at the end of the directory. Special entries met
    /// along the way update the volume.
    pub(crate) fn readdir_entry(
        &mut self,
        parent: NodeId,
        it: &mut DirCursor,
    ) -> ExFatResult<Option<NodeData>> {
        let mut pending: Option<PendingNode> = None;

        loop {
            if it.offset >= self.nodes[parent].size {
                if let Some(p) = pending {
                    return Err(self.corrupted(format!(
                        "expected {} continuations",
                        p.continuations
                    )));
                }
                return Ok(None);
            }

            let raw = it.entry();
            match raw[0] {
                EXFAT_ENTRY_FILE => {
                    if let Some(p) = &pending {
                        return Err(self.corrupted(format!(
                            "expected {} continuations before new entry",
                            p.continuations
                        )));
                    }
                    let meta1 = FileEntry::from_raw(raw);
                    let continuations = meta1.continuations();
                    // Each file needs at least FILE_INFO and one FILE_NAME.
                    if continuations < 2 {
                        return Err(
                            self.corrupted(format!("too few continuations ({})", continuations))
                        );
                    }
                    let mut node = NodeData::new();
                    node.entry_cluster = it.cluster;
                    node.entry_offset = it.offset;
                    init_node_meta1(&mut node, &meta1);
                    pending = Some(PendingNode {
                        node,
                        continuations,
                        reference_checksum: meta1.checksum(),
                        actual_checksum: start_checksum(&meta1),
                        real_size: 0,
                    });
                }

                EXFAT_ENTRY_FILE_INFO => {
                    let left = pending.as_ref().map_or(0, |p| p.continuations);
                    let p = match pending.as_mut() {
                        Some(p) if left >= 2 => p,
                        _ => return Err(self.corrupted(format!("unexpected continuation ({})", left))),
                    };
                    let meta2 = FileInfoEntry::from_raw(raw);
                    if meta2.flags() & !(EXFAT_FLAG_ALWAYS1 | EXFAT_FLAG_CONTIGUOUS) != 0 {
                        let flags = meta2.flags();
                        return Err(self.corrupted(format!("unknown flags in meta2 ({:#x})", flags)));
                    }
                    if meta2.flags() & EXFAT_FLAG_ALWAYS1 == 0 {
                        // Some formatters leave the bit clear; the entry is still usable.
                        warn!("`always 1' flag is missing in meta2 ({:#x})", meta2.flags());
                    }
                    init_node_meta2(&mut p.node, &meta2);
                    p.actual_checksum = add_checksum(&raw, p.actual_checksum);
                    p.real_size = meta2.real_size();
                    p.continuations -= 1;

                    let (size, is_dir) = (p.node.size, p.node.is_dir());
                    if size == 0 && meta2.flags() & EXFAT_FLAG_CONTIGUOUS != 0 {
                        let flags = meta2.flags();
                        return Err(self.corrupted(format!(
                            "empty file marked as contiguous ({:#x})",
                            flags
                        )));
                    }
                    if is_dir && size % self.cluster_size() != 0 {
                        return Err(
                            self.corrupted(format!("directory has invalid size {} bytes", size))
                        );
                    }
                }

                EXFAT_ENTRY_FILE_NAME => {
                    let left = pending.as_ref().map_or(0, |p| p.continuations);
                    let p = match pending.as_mut() {
                        Some(p) if left > 0 => p,
                        _ => return Err(self.corrupted("unexpected continuation".to_string())),
                    };
                    p.actual_checksum = add_checksum(&raw, p.actual_checksum);
                    let room = EXFAT_NAME_MAX.saturating_sub(p.node.name.len());
                    let chunk = FileNameEntry::from_raw(raw).name();
                    p.node.name.extend(chunk.iter().take(room));
                    p.continuations -= 1;

                    if p.continuations == 0 {
                        let mut p = match pending.take() {
                            Some(p) => p,
                            None => bug!("lost pending entry"),
                        };
                        if let Some(end) = p.node.name.iter().position(|&c| c == 0) {
                            p.node.name.truncate(end);
                        }
                        let name = p.node.display_name();
                        if p.real_size != p.node.size
                            && !(p.real_size == 0 && is_pagefile(&p.node.name))
                        {
                            return Err(self.corrupted(format!(
                                "`{}' real size does not equal to size ({} != {})",
                                name, p.real_size, p.node.size
                            )));
                        }
                        if p.actual_checksum != p.reference_checksum {
                            return Err(self.corrupted(format!(
                                "`{}' has invalid checksum ({:#x} != {:#x})",
                                name, p.actual_checksum, p.reference_checksum
                            )));
                        }
                        self.fetch_next_entry(parent, it)?;
                        return Ok(Some(p.node));
                    }
                }

                EXFAT_ENTRY_UPCASE => {
                    // Only the first table counts.
                    if self.upcase.is_empty() {
                        self.load_upcase(&UpcaseEntry::from_raw(raw))?;
                    }
                }

                EXFAT_ENTRY_BITMAP => self.load_bitmap(&BitmapEntry::from_raw(raw))?,

                EXFAT_ENTRY_LABEL => {
                    let entry = LabelEntry::from_raw(raw);
                    if entry.length() as usize > EXFAT_ENAME_MAX {
                        return Err(
                            self.corrupted(format!("too long label ({} chars)", entry.length()))
                        );
                    }
                    self.label = String::from_utf16(&entry.name())
                        .map_err(|_| self.corrupted("label is not valid UTF-16".to_string()))?;
                }

                entry_type => {
                    if entry_type & EXFAT_ENTRY_VALID != 0 {
                        return Err(
                            self.corrupted(format!("unknown entry type {:#x}", entry_type))
                        );
                    }
                }
            }

            self.fetch_next_entry(parent, it)?;
        }
    }

    fn load_upcase(&mut self, entry: &UpcaseEntry) -> ExFatResult<()> {
        let start = entry.start_cluster();
        if cluster_invalid(start) {
            return Err(self.corrupted(format!("invalid cluster {:#x} in upcase table", start)));
        }
        let size = entry.size();
        if size == 0 || size > (UPCASE_MAX_CHARS * 2) as u64 || size % 2 != 0 {
            return Err(self.corrupted(format!("bad upcase table size ({} bytes)", size)));
        }
        let mut raw = vec![0u8; size as usize];
        self.dev.read_at(&mut raw, self.c2o(start));
        self.upcase = UpcaseTable::from_bytes(&raw);
        Ok(())
    }

    fn load_bitmap(&mut self, entry: &BitmapEntry) -> ExFatResult<()> {
        let start = entry.start_cluster();
        if cluster_invalid(start) {
            return Err(self.corrupted(format!("invalid cluster {:#x} in clusters bitmap", start)));
        }
        let bits = self.sb.cluster_count.saturating_sub(EXFAT_FIRST_DATA_CLUSTER);
        let size = entry.size();
        if size < ((bits as u64) + 7) / 8 {
            return Err(self.corrupted(format!(
                "invalid clusters bitmap size: {} (expected at least {})",
                size,
                (bits + 7) / 8
            )));
        }
        let mut chunk = vec![0u8; size as usize];
        self.dev.read_at(&mut chunk, self.c2o(start));
        self.cmap = ClusterBitmap::from_bytes(start, bits, chunk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exfat::mount::ExFat;
    use crate::test_helpers::{ImageBuilder, TestImage};

    fn entry_set_offset(fs: &ExFat, path: &str) -> u64 {
        let node = fs.lookup(path).unwrap();
        let volume = fs.volume();
        volume.co2o(node.entry_cluster(), node.entry_offset())
    }

    /// Apply `edit` to the FILE and FILE_INFO records of a short-named entry
    /// set and store it back with a matching checksum.
    fn rewrite_entry_set(
        image: &TestImage,
        offset: u64,
        edit: impl FnOnce(&mut FileEntry, &mut FileInfoEntry),
    ) {
        let raw = image.read(offset, 3 * ENTRY_SIZE);
        let mut records = [[0u8; ENTRY_SIZE]; 3];
        for (i, record) in records.iter_mut().enumerate() {
            record.copy_from_slice(&raw[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
        }
        let mut meta1 = FileEntry::from_raw(records[0]);
        let mut meta2 = FileInfoEntry::from_raw(records[1]);
        edit(&mut meta1, &mut meta2);
        let checksum = add_checksum(
            &records[2],
            add_checksum(meta2.as_bytes(), start_checksum(&meta1)),
        );
        meta1.set_checksum(checksum);
        image.patch(offset, meta1.as_bytes());
        image.patch(offset + ENTRY_SIZE as u64, meta2.as_bytes());
    }

    /// Build `/dir/<name>`, damage its entry set and check that looking it
    /// up reports corruption once.
    fn assert_rejected(
        name: &str,
        directory: bool,
        edit: impl FnOnce(&mut FileEntry, &mut FileInfoEntry),
    ) {
        let image = ImageBuilder::new().build();
        let path = format!("/dir/{}", name);
        let fs = image.mount();
        fs.mkdir("/dir").unwrap();
        if directory {
            fs.mkdir(&path).unwrap();
        } else {
            fs.mknod(&path).unwrap();
        }
        let offset = entry_set_offset(&fs, &path);
        fs.unmount().unwrap();

        rewrite_entry_set(&image, offset, edit);
        let fs = image.mount();
        assert!(matches!(fs.lookup(&path), Err(ExFatError::Corrupted(_))));
        assert_eq!(fs.error_count(), 1);
    }

    #[test]
    fn test_pagefile_match() {
        let name: Vec<u16> = "PageFile.SYS".encode_utf16().collect();
        assert!(is_pagefile(&name));
        let name: Vec<u16> = "pagefile.sys2".encode_utf16().collect();
        assert!(!is_pagefile(&name));
    }

    #[test]
    fn test_walk_root_entries() {
        let image = ImageBuilder::new().label("WALK").build();
        let fs = image.mount();
        fs.mknod("/one").unwrap();
        fs.mknod("/two").unwrap();

        let mut volume = fs.volume_mut();
        let root = volume.root;
        let mut it = volume.opendir_raw(root).unwrap();
        let mut names = Vec::new();
        while let Some(node) = volume.readdir_entry(root, &mut it).unwrap() {
            names.push(node.display_name());
        }
        assert_eq!(names, vec!["one", "two"]);
        assert_eq!(volume.label, "WALK");
    }

    #[test]
    fn test_bad_checksum_is_reported() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mkdir("/dir").unwrap();
        fs.mknod("/dir/victim").unwrap();
        let offset = {
            let node = fs.lookup("/dir/victim").unwrap();
            let volume = fs.volume();
            volume.co2o(node.entry_cluster(), node.entry_offset())
        };
        drop(fs);

        // Flip a byte of the FILE_NAME record.
        image.patch(offset + 2 * ENTRY_SIZE as u64 + 2, b"X");
        let fs = image.mount();
        let before = fs.error_count();
        assert!(matches!(fs.lookup("/dir/victim"), Err(ExFatError::Corrupted(_))));
        assert_eq!(fs.error_count(), before + 1);
    }

    #[test]
    fn test_too_few_continuations() {
        assert_rejected("victim", false, |meta1, _| meta1.set_continuations(1));
    }

    #[test]
    fn test_unknown_file_info_flags() {
        assert_rejected("victim", false, |_, meta2| {
            meta2.set_flags(meta2.flags() | 0x04);
        });
    }

    #[test]
    fn test_empty_contiguous_file() {
        assert_rejected("victim", false, |_, meta2| {
            meta2.set_flags(meta2.flags() | EXFAT_FLAG_CONTIGUOUS);
        });
    }

    #[test]
    fn test_directory_size_not_cluster_multiple() {
        assert_rejected("subdir", true, |_, meta2| {
            meta2.set_size(100);
            meta2.set_real_size(100);
        });
    }

    #[test]
    fn test_real_size_mismatch() {
        assert_rejected("victim", false, |_, meta2| {
            meta2.set_size(10);
            meta2.set_real_size(20);
        });
    }

    #[test]
    fn test_pagefile_without_real_size_is_accepted() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mkdir("/dir").unwrap();
        fs.mknod("/dir/pagefile.sys").unwrap();
        {
            let node = fs.lookup("/dir/pagefile.sys").unwrap();
            fs.pwrite(&node, b"swapped out", 0).unwrap();
        }
        let offset = entry_set_offset(&fs, "/dir/pagefile.sys");
        fs.unmount().unwrap();

        rewrite_entry_set(&image, offset, |_, meta2| meta2.set_real_size(0));
        let fs = image.mount();
        let node = fs.lookup("/dir/pagefile.sys").unwrap();
        assert_eq!(node.size(), 11);
        assert_eq!(fs.error_count(), 0);
    }
}
