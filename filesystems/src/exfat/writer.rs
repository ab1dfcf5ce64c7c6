// exFAT Writer Module
// Creates, deletes and renames directory entries, finds free slots and
// maintains the volume label.

use super::directory_entries::{EntrySet, EntrySetBuilder};
use super::mount::{ExFat, Volume};
use super::node::{Node, NodeFlags, NodeId};
use super::reader::entry_node;
use super::structures::*;
use crate::fat_common::timestamps::now;
use exfat_core::{bug, ExFatError, ExFatResult};
use log::{debug, info};

impl Volume {
    pub(crate) fn update_mtime(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.mtime = now();
        node.flags |= NodeFlags::DIRTY;
    }

    pub(crate) fn update_atime(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.atime = now();
        node.flags |= NodeFlags::DIRTY;
    }

    /// Write `records` as a run starting at (`cluster`, `offset`) of `dir`.
    fn write_records(&self, dir: NodeId, records: &[RawEntry], mut cluster: u32, mut offset: u64) {
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                self.next_entry(dir, &mut cluster, &mut offset);
            }
            self.write_raw_entry(record, cluster, offset);
        }
    }

    /// Clear the valid bit of every record of the node's run.
    fn erase_entry(&self, id: NodeId) {
        let node = &self.nodes[id];
        let parent = match node.parent {
            Some(parent) => parent,
            None => bug!("erasing entry of a detached node"),
        };
        let mut cluster = node.entry_cluster;
        let mut offset = node.entry_offset;
        let types = [EXFAT_ENTRY_FILE, EXFAT_ENTRY_FILE_INFO]
            .into_iter()
            .chain(std::iter::repeat(EXFAT_ENTRY_FILE_NAME).take(name_entries(node.name.len())));

        for (i, entry_type) in types.enumerate() {
            if i > 0 {
                self.next_entry(parent, &mut cluster, &mut offset);
            }
            self.dev
                .write_at(&[entry_type & !EXFAT_ENTRY_VALID], self.co2o(cluster, offset));
        }
    }

    /// Give back trailing clusters of `dir` after the entry at
    /// `deleted_offset` went away, if it was the last one in use.
    fn shrink_directory(&mut self, dir: NodeId, deleted_offset: u64) -> ExFatResult<()> {
        let node = &self.nodes[dir];
        if !node.is_dir() {
            bug!("attempted to shrink a file");
        }
        if !node.flags.contains(NodeFlags::CACHED) {
            bug!("attempted to shrink uncached directory");
        }

        let mut entries = 0;
        if let Some((&last_offset, &last)) = node.children.last_key_value() {
            if deleted_offset < last_offset {
                // Other entries follow the removed one.
                return Ok(());
            }
            entries = last_offset / ENTRY_SIZE as u64
                + 2
                + name_entries(self.nodes[last].name.len()) as u64;
        }

        let cluster_size = self.cluster_size();
        let mut new_size = (entries * ENTRY_SIZE as u64).div_ceil(cluster_size) * cluster_size;
        // A directory always has at least one cluster.
        if new_size == 0 {
            new_size = cluster_size;
        }
        if new_size == self.nodes[dir].size {
            return Ok(());
        }
        debug!(
            "shrinking `{}' to {} bytes",
            self.nodes[dir].display_name(),
            new_size
        );
        self.truncate(dir, new_size)
    }

    fn delete(&mut self, id: NodeId) -> ExFatResult<()> {
        let (parent, deleted_offset) = {
            let node = &self.nodes[id];
            match node.parent {
                Some(parent) => (parent, node.entry_offset),
                None => bug!("deleting a node without parent"),
            }
        };

        self.get_node(parent);
        self.erase_entry(id);
        self.update_mtime(parent);
        self.tree_detach(id);
        let result = self.shrink_directory(parent, deleted_offset);
        self.put_node(parent);
        // Clusters are freed when the last reference goes away.
        self.nodes[id].flags |= NodeFlags::UNLINKED;
        result
    }

    pub(crate) fn unlink(&mut self, id: NodeId) -> ExFatResult<()> {
        if self.nodes[id].is_dir() {
            return Err(ExFatError::IsADirectory);
        }
        self.delete(id)
    }

    pub(crate) fn rmdir(&mut self, id: NodeId) -> ExFatResult<()> {
        if !self.nodes[id].is_dir() {
            return Err(ExFatError::NotADirectory);
        }
        self.cache_directory(id)?;
        if !self.nodes[id].children.is_empty() {
            return Err(ExFatError::DirectoryNotEmpty);
        }
        self.delete(id)
    }

    fn grow_directory(&mut self, dir: NodeId, asize: u64, difference: u64) -> ExFatResult<()> {
        let cluster_size = self.cluster_size();
        self.truncate(dir, (asize + difference).div_ceil(cluster_size) * cluster_size)
    }

    /// Position of the first run of `subentries` unused records in `dir`,
    /// growing the directory when it has none.
    pub(crate) fn find_slot(&mut self, dir: NodeId, subentries: usize) -> ExFatResult<(u32, u64)> {
        let mut it = self.opendir_raw(dir)?;
        let mut contiguous = 0;
        let mut slot = (it.cluster, it.offset);

        loop {
            if contiguous == 0 {
                slot = (it.cluster, it.offset);
            }
            if it.entry_type() & EXFAT_ENTRY_VALID != 0 {
                contiguous = 0;
            } else {
                contiguous += 1;
            }
            if contiguous == subentries {
                break;
            }
            let size = self.nodes[dir].size;
            if it.offset + ENTRY_SIZE as u64 >= size {
                let missing = ((subentries - contiguous) * ENTRY_SIZE) as u64;
                self.grow_directory(dir, size, missing)?;
            }
            self.fetch_next_entry(dir, &mut it)?;
        }

        debug!(
            "found slot of {} entries at offset {} of `{}'",
            subentries,
            slot.1,
            self.nodes[dir].display_name()
        );
        Ok(slot)
    }

    fn write_entry(
        &mut self,
        dir: NodeId,
        name: &[u16],
        cluster: u32,
        offset: u64,
        attrib: u16,
    ) -> NodeId {
        let set = EntrySetBuilder::new_file(name)
            .attributes(attrib)
            .build(&self.upcase);
        self.write_records(dir, &set.records(), cluster, offset);

        let mut node = entry_node(&set.meta1, &set.meta2);
        node.entry_cluster = cluster;
        node.entry_offset = offset;
        node.name = name.to_vec();
        let id = self.nodes.insert(node);

        self.tree_attach(dir, id);
        self.update_mtime(dir);
        id
    }

    /// Create a new entry at `path`. The new node is returned unreferenced.
    fn create(&mut self, path: &str, attrib: u16) -> ExFatResult<NodeId> {
        let (dir, existing, name) = self.split_path(path)?;
        if let Some(existing) = existing {
            self.put_node(existing);
            self.put_node(dir);
            return Err(ExFatError::AlreadyExists);
        }

        let result = match self.find_slot(dir, 2 + name_entries(name.len())) {
            Ok((cluster, offset)) => Ok(self.write_entry(dir, &name, cluster, offset, attrib)),
            Err(e) => Err(e),
        };
        self.put_node(dir);
        result
    }

    pub(crate) fn mknod(&mut self, path: &str) -> ExFatResult<()> {
        debug!("mknod `{}'", path);
        self.create(path, EXFAT_ATTRIB_ARCH).map(|_| ())
    }

    pub(crate) fn mkdir(&mut self, path: &str) -> ExFatResult<()> {
        debug!("mkdir `{}'", path);
        let id = self.create(path, EXFAT_ATTRIB_ARCH | EXFAT_ATTRIB_DIR)?;
        self.get_node(id);
        // Directories always have at least one cluster.
        let cluster_size = self.cluster_size();
        let result = match self.truncate(id, cluster_size) {
            Ok(()) => {
                self.nodes[id].flags |= NodeFlags::CACHED;
                Ok(())
            }
            Err(e) => {
                let _ = self.delete(id);
                Err(e)
            }
        };
        self.put_node(id);
        result
    }

    fn rename_entry(&mut self, dir: NodeId, id: NodeId, name: &[u16], new_cluster: u32, new_offset: u64) {
        let (old_parent, mut cluster, mut offset) = {
            let node = &self.nodes[id];
            match node.parent {
                Some(parent) => (parent, node.entry_cluster, node.entry_offset),
                None => bug!("renaming a detached node"),
            }
        };
        let meta1 = FileEntry::from_raw(self.read_entry(cluster, offset));
        self.next_entry(old_parent, &mut cluster, &mut offset);
        let meta2 = FileInfoEntry::from_raw(self.read_entry(cluster, offset));

        let mut set = EntrySet {
            meta1,
            meta2,
            names: Vec::new(),
        };
        set.rename(&self.upcase, name);

        self.erase_entry(id);
        self.tree_detach(id);

        let node = &mut self.nodes[id];
        node.entry_cluster = new_cluster;
        node.entry_offset = new_offset;
        node.name = name.to_vec();
        node.name_hash = set.meta2.name_hash();
        self.write_records(dir, &set.records(), new_cluster, new_offset);
        self.tree_attach(dir, id);
    }

    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.nodes[id].parent {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    pub(crate) fn rename(&mut self, old_path: &str, new_path: &str) -> ExFatResult<()> {
        debug!("rename `{}' to `{}'", old_path, new_path);
        let node = self.lookup_path(old_path)?;
        let (dir, existing, name) = match self.split_path(new_path) {
            Ok(split) => split,
            Err(e) => {
                self.put_node(node);
                return Err(e);
            }
        };

        let mut result = Ok(());
        if node == self.root || (self.nodes[node].is_dir() && self.is_ancestor(node, dir)) {
            result = Err(ExFatError::InvalidArgument(format!(
                "cannot move `{}' into itself",
                old_path
            )));
        }
        if let Some(existing) = existing {
            // Remove the target unless it is the source itself.
            if result.is_ok() && existing != node {
                let source_is_dir = self.nodes[node].is_dir();
                result = if self.nodes[existing].is_dir() {
                    if source_is_dir {
                        self.rmdir(existing)
                    } else {
                        Err(ExFatError::NotADirectory)
                    }
                } else if !source_is_dir {
                    self.unlink(existing)
                } else {
                    Err(ExFatError::IsADirectory)
                };
            }
            self.put_node(existing);
        }

        if result.is_ok() {
            result = self
                .find_slot(dir, 2 + name_entries(name.len()))
                .map(|(cluster, offset)| self.rename_entry(dir, node, &name, cluster, offset));
        }
        self.put_node(dir);
        self.put_node(node);
        result
    }

    /// Position of the LABEL entry in the root directory.
    fn find_label(&self) -> ExFatResult<Option<(u32, u64)>> {
        let root = self.root;
        let mut it = self.opendir_raw(root)?;
        loop {
            if it.offset >= self.nodes[root].size {
                return Ok(None);
            }
            if it.entry_type() == EXFAT_ENTRY_LABEL {
                return Ok(Some((it.cluster, it.offset)));
            }
            self.fetch_next_entry(root, &mut it)?;
        }
    }

    pub(crate) fn set_label(&mut self, label: &str) -> ExFatResult<()> {
        let utf16: Vec<u16> = label.encode_utf16().collect();
        if utf16.len() > EXFAT_LABEL_MAX {
            return Err(ExFatError::NameTooLong);
        }

        let (cluster, offset) = match self.find_label()? {
            Some(position) => position,
            None => {
                let root = self.root;
                self.find_slot(root, 1)?
            }
        };

        let mut entry = LabelEntry::with_label(&utf16);
        if utf16.is_empty() {
            entry.set_entry_type(EXFAT_ENTRY_LABEL ^ EXFAT_ENTRY_VALID);
        }
        self.write_raw_entry(entry.as_bytes(), cluster, offset);
        self.label = label.to_string();
        info!("volume label set to `{}'", label);
        Ok(())
    }
}

impl ExFat {
    /// Create an empty regular file.
    pub fn mknod(&self, path: &str) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        volume.mknod(path)
    }

    /// Create an empty directory (one cluster).
    pub fn mkdir(&self, path: &str) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        volume.mkdir(path)
    }

    /// Remove a regular file. Its clusters are released with the last handle.
    pub fn unlink(&self, node: &Node<'_>) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        volume.unlink(node.id())
    }

    pub fn rmdir(&self, node: &Node<'_>) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        volume.rmdir(node.id())
    }

    /// Move `old_path` to `new_path`, replacing an existing node of the
    /// same kind.
    pub fn rename(&self, old_path: &str, new_path: &str) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        volume.rename(old_path, new_path)
    }

    pub fn get_label(&self) -> String {
        self.volume().label.clone()
    }

    pub fn set_label(&self, label: &str) -> ExFatResult<()> {
        let mut volume = self.volume_mut();
        volume.check_writable()?;
        volume.set_label(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ImageBuilder;

    #[test]
    fn test_create_writes_valid_entry_set() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mknod("/a file with a name longer than fifteen units").unwrap();
        let node = fs.lookup("/a file with a name longer than fifteen units").unwrap();
        assert_eq!(node.size(), 0);
        assert_eq!(node.start_cluster(), EXFAT_CLUSTER_FREE);
        assert!(node.flags().contains(NodeFlags::ARCH));

        let volume = fs.volume();
        let parent = volume.root;
        let mut records = Vec::new();
        let (mut cluster, mut offset) = (node.entry_cluster(), node.entry_offset());
        for i in 0..5 {
            if i > 0 {
                volume.next_entry(parent, &mut cluster, &mut offset);
            }
            records.push(volume.read_entry(cluster, offset));
        }
        let set = crate::exfat::directory_entries::validate_entry_set(&records).unwrap();
        assert_eq!(set.meta1.continuations(), 4);
    }

    #[test]
    fn test_create_existing_fails() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mknod("/x").unwrap();
        assert!(matches!(fs.mknod("/X"), Err(ExFatError::AlreadyExists)));
        assert!(matches!(fs.mkdir("/x"), Err(ExFatError::AlreadyExists)));
        assert!(matches!(fs.mknod("/bad|name"), Err(ExFatError::InvalidName(_))));
    }

    #[test]
    fn test_mkdir_allocates_one_cluster() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        let free = fs.count_free_clusters();
        fs.mkdir("/dir").unwrap();
        assert_eq!(fs.count_free_clusters(), free - 1);

        let dir = fs.lookup("/dir").unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.size(), 4096);
        assert_eq!(fs.list("/dir").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_unlink_and_rmdir_kinds() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mkdir("/dir").unwrap();
        fs.mknod("/dir/file").unwrap();
        let dir = fs.lookup("/dir").unwrap();
        let file = fs.lookup("/dir/file").unwrap();

        assert!(matches!(fs.unlink(&dir), Err(ExFatError::IsADirectory)));
        assert!(matches!(fs.rmdir(&file), Err(ExFatError::NotADirectory)));
        assert!(matches!(fs.rmdir(&dir), Err(ExFatError::DirectoryNotEmpty)));

        fs.unlink(&file).unwrap();
        assert!(file.flags().contains(NodeFlags::UNLINKED));
        drop(file);
        fs.rmdir(&dir).unwrap();
        drop(dir);
        assert!(matches!(fs.lookup("/dir"), Err(ExFatError::NotFound)));
    }

    #[test]
    fn test_unlinked_clusters_freed_on_last_put() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mknod("/f").unwrap();
        let free = fs.count_free_clusters();
        let node = fs.lookup("/f").unwrap();
        fs.truncate(&node, 3 * 4096).unwrap();
        assert_eq!(fs.count_free_clusters(), free - 3);

        fs.unlink(&node).unwrap();
        // Still open, the data stays.
        assert_eq!(fs.count_free_clusters(), free - 3);
        drop(node);
        assert_eq!(fs.count_free_clusters(), free);
    }

    #[test]
    fn test_find_slot_grows_directory() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mkdir("/d").unwrap();
        // 4096 / 32 = 128 records, 3 per short name
        for i in 0..43 {
            fs.mknod(&format!("/d/f{:02}", i)).unwrap();
        }
        let dir = fs.lookup("/d").unwrap();
        assert_eq!(dir.size(), 2 * 4096);
        assert_eq!(fs.list("/d").unwrap().len(), 43);
    }

    #[test]
    fn test_rename_into_itself_is_rejected() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        assert!(matches!(
            fs.rename("/a", "/a/b/c"),
            Err(ExFatError::InvalidArgument(_))
        ));
        assert!(fs.lookup("/a/b").is_ok());
    }

    #[test]
    fn test_rename_kind_mismatch() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        fs.mkdir("/dir").unwrap();
        fs.mknod("/file").unwrap();
        assert!(matches!(fs.rename("/file", "/dir"), Err(ExFatError::NotADirectory)));
        assert!(matches!(fs.rename("/dir", "/file"), Err(ExFatError::IsADirectory)));
        assert!(fs.lookup("/dir").is_ok());
        assert!(fs.lookup("/file").is_ok());
    }

    #[test]
    fn test_set_label() {
        let image = ImageBuilder::new().build();
        let fs = image.mount();
        assert_eq!(fs.get_label(), "");
        fs.set_label("BACKUP").unwrap();
        assert_eq!(fs.get_label(), "BACKUP");
        assert!(matches!(fs.set_label("TWELVE CHARS"), Err(ExFatError::NameTooLong)));
        fs.unmount().unwrap();

        let fs = image.mount();
        assert_eq!(fs.get_label(), "BACKUP");
        fs.set_label("").unwrap();
        fs.unmount().unwrap();

        let fs = image.mount();
        assert_eq!(fs.get_label(), "");
        fs.unmount().unwrap();
    }
}
