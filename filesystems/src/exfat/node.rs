// In-core nodes: the arena that owns them and the reference-counted handle
// handed out to callers.
//
// A directory owns its cached children through `children`, keyed by the byte
// offset of each child's FILE record. `parent` is a plain back-reference.

use super::mount::ExFat;
use super::structures::EXFAT_CLUSTER_FREE;
use bitflags::bitflags;
use log::error;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Index, IndexMut};

bitflags! {
    /// On-disk attribute bits (low 16 bits) plus in-core state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u32 {
        const RO = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME = 0x08;
        const DIR = 0x10;
        const ARCH = 0x20;
        /// Clusters are sequential, the FAT is not consulted.
        const CONTIGUOUS = 0x10000;
        /// Children have been read from disk.
        const CACHED = 0x20000;
        /// Entry records need to be rewritten.
        const DIRTY = 0x40000;
        /// Entry erased; clusters are released with the last reference.
        const UNLINKED = 0x80000;
    }
}

impl NodeFlags {
    pub fn from_attrib(attrib: u16) -> Self {
        Self::from_bits_retain(attrib as u32)
    }

    /// Attribute word as stored in the FILE record.
    pub fn attrib(self) -> u16 {
        (self.bits() & 0xFFFF) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub(crate) struct NodeData {
    pub parent: Option<NodeId>,
    pub children: BTreeMap<u64, NodeId>,
    pub references: i32,
    /// Traversal cursor: `fptr_cluster` is cluster number `fptr_index` of the chain.
    pub fptr_index: u32,
    pub fptr_cluster: u32,
    pub entry_cluster: u32,
    pub entry_offset: u64,
    pub start_cluster: u32,
    pub flags: NodeFlags,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub name: Vec<u16>,
    /// Hash of the upper-cased name as stored in FILE_INFO.
    pub name_hash: u16,
}

impl NodeData {
    pub fn new() -> Self {
        Self {
            parent: None,
            children: BTreeMap::new(),
            references: 0,
            fptr_index: 0,
            fptr_cluster: EXFAT_CLUSTER_FREE,
            entry_cluster: EXFAT_CLUSTER_FREE,
            entry_offset: 0,
            start_cluster: EXFAT_CLUSTER_FREE,
            flags: NodeFlags::empty(),
            size: 0,
            mtime: 0,
            atime: 0,
            name: Vec::new(),
            name_hash: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.flags.contains(NodeFlags::DIR)
    }

    pub fn is_contiguous(&self) -> bool {
        self.flags.contains(NodeFlags::CONTIGUOUS)
    }

    pub fn display_name(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }
}

/// Slot storage for nodes. Ids stay valid until the node is removed.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    slots: Vec<Option<NodeData>>,
    vacant: Vec<usize>,
}

impl NodeArena {
    pub fn insert(&mut self, node: NodeData) -> NodeId {
        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Option<NodeData> {
        let node = self.slots.get_mut(id.0)?.take()?;
        self.vacant.push(id.0);
        Some(node)
    }

    #[cfg(test)]
    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.slots.get(id.0), Some(Some(_)))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }
}

impl Index<NodeId> for NodeArena {
    type Output = NodeData;

    fn index(&self, id: NodeId) -> &NodeData {
        match self.slots.get(id.0) {
            Some(Some(node)) => node,
            _ => exfat_core::bug!("access to destroyed node {:?}", id),
        }
    }
}

impl IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut NodeData {
        match self.slots.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => exfat_core::bug!("access to destroyed node {:?}", id),
        }
    }
}

/// A referenced file or directory.
///
/// Holding a `Node` keeps the underlying node alive: cloning takes another
/// reference, dropping releases one. When the last reference goes away a
/// dirty node is written back and an unlinked node gives up its clusters.
pub struct Node<'fs> {
    fs: &'fs ExFat,
    id: NodeId,
}

impl<'fs> Node<'fs> {
    /// Wrap a reference the caller has already taken.
    pub(crate) fn from_referenced(fs: &'fs ExFat, id: NodeId) -> Self {
        Self { fs, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn with<T>(&self, f: impl FnOnce(&NodeData) -> T) -> T {
        f(&self.fs.volume().nodes[self.id])
    }

    pub fn name(&self) -> String {
        self.with(|node| node.display_name())
    }

    pub fn name_utf16(&self) -> Vec<u16> {
        self.with(|node| node.name.clone())
    }

    pub fn size(&self) -> u64 {
        self.with(|node| node.size)
    }

    pub fn flags(&self) -> NodeFlags {
        self.with(|node| node.flags)
    }

    pub fn is_dir(&self) -> bool {
        self.with(|node| node.is_dir())
    }

    pub fn is_contiguous(&self) -> bool {
        self.with(|node| node.is_contiguous())
    }

    pub fn start_cluster(&self) -> u32 {
        self.with(|node| node.start_cluster)
    }

    /// Cluster holding this node's FILE record.
    pub fn entry_cluster(&self) -> u32 {
        self.with(|node| node.entry_cluster)
    }

    /// Byte offset of this node's FILE record inside its parent directory.
    pub fn entry_offset(&self) -> u64 {
        self.with(|node| node.entry_offset)
    }

    pub fn mtime(&self) -> i64 {
        self.with(|node| node.mtime)
    }

    pub fn atime(&self) -> i64 {
        self.with(|node| node.atime)
    }

    pub fn references(&self) -> i32 {
        self.with(|node| node.references)
    }
}

impl Clone for Node<'_> {
    fn clone(&self) -> Self {
        self.fs.volume_mut().get_node(self.id);
        Self { fs: self.fs, id: self.id }
    }
}

impl Drop for Node<'_> {
    fn drop(&mut self) {
        match self.fs.try_volume_mut() {
            Some(mut volume) => volume.put_node(self.id),
            None => error!("node {:?} released while the volume is busy", self.id),
        }
    }
}

impl PartialEq for Node<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.fs, other.fs) && self.id == other.id
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_from_attrib() {
        let flags = NodeFlags::from_attrib(0x0030);
        assert!(flags.contains(NodeFlags::DIR));
        assert!(flags.contains(NodeFlags::ARCH));
        assert!(!flags.contains(NodeFlags::CONTIGUOUS));

        let flags = flags | NodeFlags::DIRTY | NodeFlags::CONTIGUOUS;
        assert_eq!(flags.attrib(), 0x0030);
    }

    #[test]
    fn test_unknown_attrib_bits_survive() {
        let flags = NodeFlags::from_attrib(0x0120);
        assert_eq!(flags.attrib(), 0x0120);
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = NodeArena::default();
        let a = arena.insert(NodeData::new());
        let b = arena.insert(NodeData::new());
        assert_eq!(arena.len(), 2);

        arena[a].size = 42;
        assert_eq!(arena[a].size, 42);

        assert!(arena.remove(a).is_some());
        assert!(!arena.contains(a));
        assert!(arena.remove(a).is_none());

        let c = arena.insert(NodeData::new());
        assert_eq!(c, a);
        assert_eq!(arena[c].size, 0);
        assert!(arena.contains(b));
    }

    #[test]
    #[should_panic(expected = "destroyed node")]
    fn test_arena_stale_id() {
        let mut arena = NodeArena::default();
        let id = arena.insert(NodeData::new());
        arena.remove(id);
        let _ = arena[id].size;
    }
}
