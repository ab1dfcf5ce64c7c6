// Path resolution and in-core directory iteration

use super::checksum::calc_name_hash;
use super::mount::{ExFat, Volume};
use super::node::{Node, NodeId};
use super::structures::EXFAT_NAME_MAX;
use exfat_core::{ExFatError, ExFatResult};
use log::debug;

/// Characters Windows refuses in file names.
const FORBIDDEN_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

/// Check a name about to be written to disk and encode it.
pub fn validate_name(name: &str) -> ExFatResult<Vec<u16>> {
    if let Some(c) = name
        .chars()
        .find(|&c| c.is_control() || FORBIDDEN_CHARS.contains(&c))
    {
        return Err(ExFatError::InvalidName(format!(
            "`{}' contains {:?}",
            name, c
        )));
    }
    let utf16: Vec<u16> = name.encode_utf16().collect();
    if utf16.len() > EXFAT_NAME_MAX {
        return Err(ExFatError::NameTooLong);
    }
    Ok(utf16)
}

impl Volume {
    /// Find a child of `parent` by name, reading the directory if needed.
    /// No reference is taken on the result.
    pub(crate) fn lookup_name(&mut self, parent: NodeId, name: &[u16]) -> ExFatResult<Option<NodeId>> {
        if !self.nodes[parent].is_dir() {
            return Err(ExFatError::NotADirectory);
        }
        self.cache_directory(parent)?;
        let hash = calc_name_hash(&self.upcase, name);
        let found = self.nodes[parent]
            .children
            .values()
            .copied()
            .find(|&child| {
                let node = &self.nodes[child];
                node.name_hash == hash && self.upcase.names_equal(&node.name, name)
            });
        Ok(found)
    }

    /// Walk `names` starting at the root. The result carries a reference.
    fn walk<'a>(&mut self, names: impl Iterator<Item = &'a str>) -> ExFatResult<NodeId> {
        let mut node = self.root;
        self.get_node(node);
        for name in names {
            let utf16: Vec<u16> = name.encode_utf16().collect();
            let child = match self.lookup_name(node, &utf16) {
                Ok(Some(child)) => child,
                Ok(None) => {
                    self.put_node(node);
                    return Err(ExFatError::NotFound);
                }
                Err(e) => {
                    self.put_node(node);
                    return Err(e);
                }
            };
            self.get_node(child);
            self.put_node(node);
            node = child;
        }
        Ok(node)
    }

    pub(crate) fn lookup_path(&mut self, path: &str) -> ExFatResult<NodeId> {
        debug!("lookup `{}'", path);
        self.walk(components(path))
    }

    /// Resolve everything but the last component of `path`.
    ///
    /// Returns the referenced parent directory, the referenced node already
    /// using the final name (if any) and the final name itself.
    pub(crate) fn split_path(&mut self, path: &str) -> ExFatResult<(NodeId, Option<NodeId>, Vec<u16>)> {
        let names: Vec<&str> = components(path).collect();
        let (last, dirs) = match names.split_last() {
            Some(split) => split,
            None => return Err(ExFatError::InvalidName(format!("`{}' has no file name", path))),
        };
        let name = validate_name(last)?;

        let dir = self.walk(dirs.iter().copied())?;
        match self.lookup_name(dir, &name) {
            Ok(existing) => {
                if let Some(existing) = existing {
                    self.get_node(existing);
                }
                Ok((dir, existing, name))
            }
            Err(e) => {
                self.put_node(dir);
                Err(e)
            }
        }
    }
}

/// Result of [`ExFat::split`].
pub struct SplitPath<'fs> {
    pub dir: Node<'fs>,
    pub existing: Option<Node<'fs>>,
    pub name: Vec<u16>,
}

/// Iterator over the cached children of a directory, in on-disk order.
/// Every yielded node is referenced.
pub struct DirIter<'fs> {
    fs: &'fs ExFat,
    dir: Node<'fs>,
    cursor: u64,
}

impl<'fs> DirIter<'fs> {
    pub fn directory(&self) -> &Node<'fs> {
        &self.dir
    }
}

impl<'fs> Iterator for DirIter<'fs> {
    type Item = Node<'fs>;

    fn next(&mut self) -> Option<Node<'fs>> {
        let (offset, id) = {
            let volume = self.fs.volume();
            let (&offset, &id) = volume.nodes[self.dir.id()].children.range(self.cursor..).next()?;
            (offset, id)
        };
        self.cursor = offset + 1;
        Some(self.fs.handle(id))
    }
}

impl ExFat {
    /// Find the node at `path`.
    pub fn lookup(&self, path: &str) -> ExFatResult<Node<'_>> {
        let id = self.volume_mut().lookup_path(path)?;
        Ok(Node::from_referenced(self, id))
    }

    /// Split `path` into its parent directory and final name, as used by
    /// create and rename.
    pub fn split(&self, path: &str) -> ExFatResult<SplitPath<'_>> {
        let (dir, existing, name) = self.volume_mut().split_path(path)?;
        Ok(SplitPath {
            dir: Node::from_referenced(self, dir),
            existing: existing.map(|id| Node::from_referenced(self, id)),
            name,
        })
    }

    pub fn opendir<'fs>(&'fs self, dir: &Node<'fs>) -> ExFatResult<DirIter<'fs>> {
        self.volume_mut().cache_directory_checked(dir.id())?;
        Ok(DirIter {
            fs: self,
            dir: dir.clone(),
            cursor: 0,
        })
    }

    pub fn readdir<'fs>(&'fs self, it: &mut DirIter<'fs>) -> Option<Node<'fs>> {
        it.next()
    }

    pub fn closedir(&self, it: DirIter<'_>) {
        drop(it);
    }

    /// Names of the entries in the directory at `path`.
    pub fn list(&self, path: &str) -> ExFatResult<Vec<String>> {
        let dir = self.lookup(path)?;
        let names = self.opendir(&dir)?.map(|node| node.name()).collect();
        Ok(names)
    }
}

impl Volume {
    fn cache_directory_checked(&mut self, dir: NodeId) -> ExFatResult<()> {
        if !self.nodes[dir].is_dir() {
            return Err(ExFatError::NotADirectory);
        }
        self.cache_directory(dir)
    }
}
