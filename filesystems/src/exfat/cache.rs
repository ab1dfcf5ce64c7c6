// Node cache: reference counting, lazy directory loading and write-back of
// dirty nodes.

use super::checksum::calc_checksum;
use super::mount::Volume;
use super::node::{NodeFlags, NodeId};
use super::structures::{
    FileEntry, FileInfoEntry, EXFAT_ENTRY_FILE, EXFAT_ENTRY_FILE_INFO, EXFAT_FLAG_ALWAYS1,
    EXFAT_FLAG_CONTIGUOUS,
};
use crate::fat_common::timestamps::unix_to_exfat;
use exfat_core::{bug, ExFatError, ExFatResult};
use log::{debug, warn};

impl Volume {
    pub(crate) fn get_node(&mut self, id: NodeId) {
        self.nodes[id].references += 1;
    }

    /// Drop one reference. The last one writes back a dirty node and
    /// releases an unlinked one together with its clusters.
    pub(crate) fn put_node(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.references -= 1;
        if node.references < 0 {
            bug!(
                "reference counter of `{}' is below zero",
                node.display_name()
            );
        }
        if node.references > 0 {
            return;
        }

        if self.nodes[id].flags.contains(NodeFlags::DIRTY) {
            self.flush_node(id);
        }
        if self.nodes[id].flags.contains(NodeFlags::UNLINKED) {
            // The entry is gone already; a failure here only leaks clusters.
            let _ = self.truncate(id, 0);
            self.nodes.remove(id);
        }
        if self.cmap.is_dirty() {
            self.flush_cmap();
        }
    }

    /// Read the children of `dir` from disk unless they are already cached.
    /// Nothing is attached when decoding fails part way.
    pub(crate) fn cache_directory(&mut self, dir: NodeId) -> ExFatResult<()> {
        if self.nodes[dir].flags.contains(NodeFlags::CACHED) {
            return Ok(());
        }

        let mut it = self.opendir_raw(dir)?;
        let mut loaded = Vec::new();
        loop {
            match self.readdir_entry(dir, &mut it) {
                Ok(Some(mut node)) => {
                    node.parent = Some(dir);
                    loaded.push(self.nodes.insert(node));
                }
                Ok(None) => break,
                Err(e) => {
                    for id in loaded {
                        self.nodes.remove(id);
                    }
                    return Err(e);
                }
            }
        }

        debug!(
            "cached {} entries of `{}'",
            loaded.len(),
            self.nodes[dir].display_name()
        );
        for id in loaded {
            let offset = self.nodes[id].entry_offset;
            self.nodes[dir].children.insert(offset, id);
        }
        self.nodes[dir].flags |= NodeFlags::CACHED;
        Ok(())
    }

    /// Load the root directory at mount time and check that the mandatory
    /// special entries were found.
    pub(crate) fn discover(&mut self, root: NodeId) -> ExFatResult<()> {
        self.cache_directory(root)?;
        if self.upcase.is_empty() {
            return Err(self.fail(ExFatError::InvalidVolume(
                "upcase table is not found".to_string(),
            )));
        }
        if !self.cmap.is_loaded() {
            return Err(self.fail(ExFatError::InvalidVolume(
                "clusters bitmap is not found".to_string(),
            )));
        }
        Ok(())
    }

    fn reset_node(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.nodes[id].children);
        for child in children.into_values() {
            self.reset_node(child);
            self.nodes.remove(child);
        }

        let references = self.nodes[id].references;
        if references != 0 {
            warn!(
                "non-zero reference counter ({}) for `{}'",
                references,
                self.nodes[id].display_name()
            );
        }
        while self.nodes[id].references > 0 {
            self.put_node(id);
        }
        self.nodes[id].flags.remove(NodeFlags::CACHED);
    }

    /// Drop every cached node below the root.
    pub(crate) fn reset_cache(&mut self) {
        let root = self.root;
        self.reset_node(root);
    }

    /// Rewrite the FILE and FILE_INFO records of `id` from the in-core node.
    pub(crate) fn flush_node(&mut self, id: NodeId) {
        if self.ro.is_some() {
            bug!("unable to flush node to read-only FS");
        }
        let parent = match self.nodes[id].parent {
            Some(parent) => parent,
            // Unlinked nodes and the root have no entry to rewrite.
            None => return,
        };

        let (mut cluster, mut offset) = {
            let node = &self.nodes[id];
            (node.entry_cluster, node.entry_offset)
        };
        let meta1_position = (cluster, offset);
        self.next_entry(parent, &mut cluster, &mut offset);
        let meta2_position = (cluster, offset);

        let node = &self.nodes[id];
        let mut meta1 = FileEntry::from_raw(self.read_entry(meta1_position.0, meta1_position.1));
        if meta1.entry_type() != EXFAT_ENTRY_FILE {
            bug!("invalid type of meta1: {:#x}", meta1.entry_type());
        }
        meta1.set_attrib(node.flags.attrib());
        let mtime = unix_to_exfat(node.mtime);
        meta1.set_mdate(mtime.date);
        meta1.set_mtime(mtime.time);
        meta1.set_mtime_cs(mtime.centiseconds);
        let atime = unix_to_exfat(node.atime);
        meta1.set_adate(atime.date);
        meta1.set_atime(atime.time);

        let mut meta2 =
            FileInfoEntry::from_raw(self.read_entry(meta2_position.0, meta2_position.1));
        if meta2.entry_type() != EXFAT_ENTRY_FILE_INFO {
            bug!("invalid type of meta2: {:#x}", meta2.entry_type());
        }
        meta2.set_size(node.size);
        meta2.set_real_size(node.size);
        meta2.set_start_cluster(node.start_cluster);
        let mut flags = EXFAT_FLAG_ALWAYS1;
        // Empty files must not be marked as contiguous.
        if node.size != 0 && node.is_contiguous() {
            flags |= EXFAT_FLAG_CONTIGUOUS;
        }
        meta2.set_flags(flags);
        // The name hash does not depend on anything flushed here.

        meta1.set_checksum(calc_checksum(&meta1, &meta2, &node.name));

        self.write_raw_entry(meta1.as_bytes(), meta1_position.0, meta1_position.1);
        self.write_raw_entry(meta2.as_bytes(), meta2_position.0, meta2_position.1);

        self.nodes[id].flags.remove(NodeFlags::DIRTY);
    }

    pub(crate) fn tree_attach(&mut self, dir: NodeId, id: NodeId) {
        let offset = self.nodes[id].entry_offset;
        self.nodes[id].parent = Some(dir);
        if let Some(previous) = self.nodes[dir].children.insert(offset, id) {
            if previous != id {
                bug!("two nodes at offset {} of one directory", offset);
            }
        }
    }

    pub(crate) fn tree_detach(&mut self, id: NodeId) {
        let parent = match self.nodes[id].parent.take() {
            Some(parent) => parent,
            None => bug!("detaching a node without parent"),
        };
        let offset = self.nodes[id].entry_offset;
        if self.nodes[parent].children.remove(&offset) != Some(id) {
            bug!("node is missing from its parent at offset {}", offset);
        }
    }
}
