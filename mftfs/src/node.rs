use std::borrow::Cow;

use crate::alloc::BlockId;
use crate::BLOCK_SIZE;

/// Identity of an inode, unique among all live inodes of a tree.
pub type InodeId = u32;

/// The id the root directory always carries.
pub const ROOT_ID: InodeId = 0;

/// What an inode holds. Directories own their children, files only reference
/// the storage blocks reserved for them.
#[derive(Debug, Clone, PartialEq)]
pub enum InodeKind {
    Directory {
        /// Owned children in insertion order.
        children: Vec<Inode>,
    },
    File {
        /// The size in bytes requested at creation.
        filesize: u32,
        /// One block per started 4KiB of `filesize`.
        blocks: Vec<BlockId>,
    },
}

/// A single file or directory node.
///
/// Dropping, cloning and comparing walk the subtree with an explicit stack, so
/// they work at any depth. `Debug` output still recurses and is meant for
/// small trees.
#[derive(Debug)]
pub struct Inode {
    id: InodeId,
    name: Vec<u8>,
    readonly: bool,
    kind: InodeKind,
}

/// Number of blocks needed to hold `size` bytes.
pub fn blocks_for_size(size: u32) -> usize {
    (size as usize + BLOCK_SIZE - 1) / BLOCK_SIZE
}

impl Inode {
    pub(crate) fn new_dir(id: InodeId, name: Vec<u8>, readonly: bool, children: Vec<Inode>) -> Self {
        Self {
            id,
            name,
            readonly,
            kind: InodeKind::Directory { children },
        }
    }

    pub(crate) fn new_file(
        id: InodeId,
        name: Vec<u8>,
        readonly: bool,
        filesize: u32,
        blocks: Vec<BlockId>,
    ) -> Self {
        Self {
            id,
            name,
            readonly,
            kind: InodeKind::File { filesize, blocks },
        }
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    /// The raw name bytes.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// The name for display purposes; invalid UTF-8 is replaced.
    pub fn display_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, InodeKind::Directory { .. })
    }

    pub fn kind(&self) -> &InodeKind {
        &self.kind
    }

    /// Size in bytes. Directories always report zero.
    pub fn filesize(&self) -> u32 {
        match &self.kind {
            InodeKind::File { filesize, .. } => *filesize,
            InodeKind::Directory { .. } => 0,
        }
    }

    /// Children of a directory; empty for files.
    pub fn children(&self) -> &[Inode] {
        match &self.kind {
            InodeKind::Directory { children } => children,
            InodeKind::File { .. } => &[],
        }
    }

    /// Blocks reserved for a file; empty for directories.
    pub fn blocks(&self) -> &[BlockId] {
        match &self.kind {
            InodeKind::File { blocks, .. } => blocks,
            InodeKind::Directory { .. } => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<Inode>> {
        match &mut self.kind {
            InodeKind::Directory { children } => Some(children),
            InodeKind::File { .. } => None,
        }
    }

    /// Direct child lookup by exact name.
    pub fn child_by_name(&self, name: &[u8]) -> Option<&Inode> {
        self.children().iter().find(|c| c.name == name)
    }

    /// Searches this subtree for `id`.
    pub fn find(&self, id: InodeId) -> Option<&Inode> {
        self.walk().map(|(_, node)| node).find(|node| node.id == id)
    }

    /// Searches this subtree for `id`, returning a mutable handle.
    pub(crate) fn find_mut(&mut self, id: InodeId) -> Option<&mut Inode> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.id == id {
                return Some(node);
            }
            if let InodeKind::Directory { children } = &mut node.kind {
                stack.extend(children.iter_mut().rev());
            }
        }
        None
    }

    /// Depth-first pre-order traversal of this subtree yielding each node with
    /// its depth below `self`. A directory is yielded before its descendants,
    /// and siblings in child order.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(0, self)],
        }
    }

    /// Number of inodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        self.walk().count()
    }
}

/// Iterator returned by [`Inode::walk`].
pub struct Walk<'a> {
    stack: Vec<(usize, &'a Inode)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, &'a Inode);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, node) = self.stack.pop()?;
        self.stack
            .extend(node.children().iter().rev().map(|c| (depth + 1, c)));
        Some((depth, node))
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let mut stack = match self.children_mut() {
            Some(children) if !children.is_empty() => std::mem::take(children),
            _ => return,
        };
        while let Some(mut node) = stack.pop() {
            if let Some(children) = node.children_mut() {
                stack.append(children);
            }
        }
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        // Rebuild bottom-up: in reverse pre-order every directory finds its
        // already copied children on top of `built`, first child topmost.
        let mut built: Vec<Inode> = Vec::new();
        let below: Vec<&Inode> = self.walk().skip(1).map(|(_, node)| node).collect();
        for node in below.into_iter().rev() {
            let copy = node.copy_with(&mut built);
            built.push(copy);
        }
        self.copy_with(&mut built)
    }
}

impl PartialEq for Inode {
    /// Two trees are equal when their pre-order sequences match node by node.
    /// Child counts are part of each node, which fixes the shape.
    fn eq(&self, other: &Self) -> bool {
        let mut left = self.walk();
        let mut right = other.walk();
        loop {
            match (left.next(), right.next()) {
                (None, None) => return true,
                (Some((_, a)), Some((_, b))) if a.same_node(b) => {}
                _ => return false,
            }
        }
    }
}

impl Inode {
    /// Copies this node, taking its children from the top of `built`.
    fn copy_with(&self, built: &mut Vec<Inode>) -> Inode {
        let kind = match &self.kind {
            InodeKind::File { filesize, blocks } => InodeKind::File {
                filesize: *filesize,
                blocks: blocks.clone(),
            },
            InodeKind::Directory { children } => {
                let at = built.len().saturating_sub(children.len());
                let mut copied = built.split_off(at);
                copied.reverse();
                InodeKind::Directory { children: copied }
            }
        };
        Inode {
            id: self.id,
            name: self.name.clone(),
            readonly: self.readonly,
            kind,
        }
    }

    /// Compares everything but the children themselves.
    fn same_node(&self, other: &Inode) -> bool {
        let same_kind = match (&self.kind, &other.kind) {
            (InodeKind::Directory { children: a }, InodeKind::Directory { children: b }) => {
                a.len() == b.len()
            }
            (
                InodeKind::File { filesize: a, blocks: x },
                InodeKind::File { filesize: b, blocks: y },
            ) => a == b && x == y,
            _ => false,
        };
        same_kind
            && self.id == other.id
            && self.name == other.name
            && self.readonly == other.readonly
    }
}

/// Frees every inode of a tree without returning any blocks to an allocator.
pub fn shutdown(root: Option<Inode>) {
    drop(root);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Inode {
        let hosts = Inode::new_file(3, b"hosts".to_vec(), false, 200, vec![9]);
        let etc = Inode::new_dir(2, b"etc".to_vec(), false, vec![hosts]);
        let kernel = Inode::new_file(1, b"kernel".to_vec(), true, 20000, vec![0, 1, 2, 3, 4]);
        Inode::new_dir(ROOT_ID, b"/".to_vec(), false, vec![kernel, etc])
    }

    #[test]
    fn block_count_rounds_up_to_whole_blocks() {
        assert_eq!(blocks_for_size(0), 0);
        assert_eq!(blocks_for_size(1), 1);
        assert_eq!(blocks_for_size(4096), 1);
        assert_eq!(blocks_for_size(4097), 2);
        assert_eq!(blocks_for_size(20000), 5);
    }

    #[test]
    fn walk_is_pre_order_with_depth() {
        let root = sample();
        let visited: Vec<(usize, InodeId)> = root.walk().map(|(d, n)| (d, n.id())).collect();
        assert_eq!(visited, vec![(0, 0), (1, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn find_searches_whole_subtree() {
        let mut root = sample();
        assert_eq!(root.find(3).unwrap().display_name(), "hosts");
        assert!(root.find(42).is_none());
        assert!(root.find_mut(2).unwrap().is_directory());
    }

    #[test]
    fn child_lookup_is_not_recursive() {
        let root = sample();
        assert!(root.child_by_name(b"etc").is_some());
        assert!(root.child_by_name(b"hosts").is_none());
    }

    #[test]
    fn files_report_no_children_and_directories_no_blocks() {
        let root = sample();
        let kernel = &root.children()[0];
        assert!(kernel.children().is_empty());
        assert_eq!(kernel.blocks().len(), 5);
        assert!(root.blocks().is_empty());
        assert_eq!(root.filesize(), 0);
    }

    fn chain(depth: InodeId) -> Inode {
        let mut node = Inode::new_file(depth, b"leaf".to_vec(), false, 1, vec![0]);
        for id in (1..depth).rev() {
            node = Inode::new_dir(id, b"d".to_vec(), false, vec![node]);
        }
        Inode::new_dir(ROOT_ID, b"/".to_vec(), false, vec![node])
    }

    #[test]
    fn shutdown_handles_deep_trees_and_empty_input() {
        shutdown(None);
        shutdown(Some(chain(100_000)));
    }

    #[test]
    fn deep_trees_drop_without_shutdown() {
        let root = chain(100_000);
        assert_eq!(root.subtree_len(), 100_001);
        drop(root);
    }

    #[test]
    fn deep_trees_clone_and_compare() {
        let root = chain(100_000);
        let copy = root.clone();
        assert!(copy == root);
        assert_eq!(copy.subtree_len(), root.subtree_len());

        let shorter = chain(99_999);
        assert!(shorter != root);
    }

    #[test]
    fn clone_keeps_child_order_and_equality_sees_differences() {
        let root = sample();
        let copy = root.clone();
        assert_eq!(copy, root);
        let order: Vec<InodeId> = copy.walk().map(|(_, n)| n.id()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);

        let mut renamed = root.clone();
        renamed.find_mut(3).unwrap().name = b"hostz".to_vec();
        assert_ne!(renamed, root);

        // Same pre-order ids, different shape.
        let hosts = Inode::new_file(3, b"hosts".to_vec(), false, 200, vec![9]);
        let etc = Inode::new_dir(2, b"etc".to_vec(), false, Vec::new());
        let kernel = Inode::new_file(1, b"kernel".to_vec(), true, 20000, vec![0, 1, 2, 3, 4]);
        let flat = Inode::new_dir(ROOT_ID, b"/".to_vec(), false, vec![kernel, etc, hosts]);
        assert_ne!(flat, root);
    }
}
