use std::convert::TryFrom;
use std::path::Path;

use log::{debug, warn};

use crate::alloc::{BlockAllocator, BlockId};
use crate::error::{FsError, Result};
use crate::mft;
use crate::node::{self, blocks_for_size, Inode, InodeId, ROOT_ID};

/// Hands out inode ids. Ids only ever grow; an id drawn for a creation that
/// later fails is not returned.
#[derive(Debug, Clone)]
pub struct IdCounter {
    next: u64,
}

impl IdCounter {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// The id the next creation will receive, or `None` once every id has
    /// been handed out.
    pub fn peek(&self) -> Option<InodeId> {
        InodeId::try_from(self.next).ok()
    }

    fn draw(&mut self) -> Result<InodeId> {
        if self.next > u64::from(InodeId::MAX) {
            return Err(FsError::AllocationFailure(
                "inode id space exhausted".to_string(),
            ));
        }
        let id = self.next as InodeId;
        self.next += 1;
        Ok(id)
    }

    /// Moves the counter past every id of a freshly loaded table. A counter
    /// that is already further ahead stays where it is.
    pub fn restore_after_load(&mut self, max_loaded: InodeId) {
        self.next = self.next.max(u64::from(max_loaded) + 1);
    }

    /// The root always takes id 0; later ids must not collide with it.
    fn reserve_root(&mut self) {
        self.next = self.next.max(u64::from(ROOT_ID) + 1);
    }
}

impl Default for IdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-memory inode tree backed by a block allocator.
///
/// Nodes are addressed by [`InodeId`]. There are no parent pointers, so every
/// delete names the parent the node should be detached from.
pub struct InodeTree<A: BlockAllocator> {
    root: Option<Inode>,
    ids: IdCounter,
    alloc: A,
}

impl<A: BlockAllocator> InodeTree<A> {
    /// An empty tree. Create the root with `create_dir(None, ..)`.
    pub fn new(alloc: A) -> Self {
        Self {
            root: None,
            ids: IdCounter::new(),
            alloc,
        }
    }

    /// Rebuilds a tree from a master file table. The allocator is not
    /// consulted; the blocks recorded in the table are assumed to be reserved
    /// already.
    pub fn load_mft<P: AsRef<Path>>(path: P, alloc: A) -> Result<Self> {
        let table = mft::load(path)?;
        let mut ids = IdCounter::new();
        ids.restore_after_load(table.max_id);
        debug!(
            "loaded {} inodes, next id {:?}",
            table.root.subtree_len(),
            ids.peek()
        );
        Ok(Self {
            root: Some(table.root),
            ids,
            alloc,
        })
    }

    /// Writes the whole tree to a master file table.
    pub fn save_mft<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| FsError::InvalidNode("tree has no root to save".to_string()))?;
        mft::save(path, root)
    }

    pub fn root(&self) -> Option<&Inode> {
        self.root.as_ref()
    }

    pub fn get(&self, id: InodeId) -> Option<&Inode> {
        self.root.as_ref().and_then(|root| root.find(id))
    }

    pub fn contains(&self, id: InodeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live inodes.
    pub fn len(&self) -> usize {
        self.root.as_ref().map_or(0, Inode::subtree_len)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The id the next successful or failed creation will draw. `None` once
    /// the id space is exhausted.
    pub fn next_id(&self) -> Option<InodeId> {
        self.ids.peek()
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.alloc
    }

    /// Creates a file of `size_in_bytes` under `parent`, reserving one block
    /// per started 4KiB.
    ///
    /// Either the file is attached with all of its blocks, or nothing changes
    /// apart from the id counter.
    pub fn create_file<N: AsRef<[u8]>>(
        &mut self,
        parent: InodeId,
        name: N,
        readonly: bool,
        size_in_bytes: u32,
    ) -> Result<InodeId> {
        let name = name.as_ref();
        debug!(
            "creating file {:?} in {} ({} bytes)",
            String::from_utf8_lossy(name),
            parent,
            size_in_bytes
        );

        let children = children_of(&mut self.root, parent)?;
        check_unique(children, name)?;

        let id = self.ids.draw()?;
        let blocks = reserve_blocks(&mut self.alloc, blocks_for_size(size_in_bytes))?;

        if children.try_reserve(1).is_err() {
            release_blocks(&mut self.alloc, &blocks);
            return Err(FsError::AllocationFailure(format!(
                "could not grow directory {}",
                parent
            )));
        }
        children.push(Inode::new_file(id, name.to_vec(), readonly, size_in_bytes, blocks));

        debug!("created file {} in {}", id, parent);
        Ok(id)
    }

    /// Creates a directory under `parent`. With no parent this creates the
    /// root, which is only allowed while the tree is empty.
    pub fn create_dir<N: AsRef<[u8]>>(&mut self, parent: Option<InodeId>, name: N) -> Result<InodeId> {
        let name = name.as_ref();

        let parent = match parent {
            Some(parent) => parent,
            None => {
                if self.root.is_some() {
                    return Err(FsError::InvalidNode(
                        "tree already has a root directory".to_string(),
                    ));
                }
                self.ids.reserve_root();
                self.root = Some(Inode::new_dir(ROOT_ID, name.to_vec(), false, Vec::new()));
                debug!("created root directory {:?}", String::from_utf8_lossy(name));
                return Ok(ROOT_ID);
            }
        };

        let children = children_of(&mut self.root, parent)?;
        check_unique(children, name)?;

        let id = self.ids.draw()?;
        if children.try_reserve(1).is_err() {
            return Err(FsError::AllocationFailure(format!(
                "could not grow directory {}",
                parent
            )));
        }
        children.push(Inode::new_dir(id, name.to_vec(), false, Vec::new()));

        debug!(
            "created directory {} {:?} in {}",
            id,
            String::from_utf8_lossy(name),
            parent
        );
        Ok(id)
    }

    /// Looks `name` up among the direct children of `parent`.
    pub fn find_inode_by_name<N: AsRef<[u8]>>(&self, parent: InodeId, name: N) -> Option<&Inode> {
        self.get(parent)?.child_by_name(name.as_ref())
    }

    /// Removes the file `node` from the directory `parent` and returns its
    /// blocks to the allocator.
    ///
    /// A block that cannot be released is logged and skipped; the file is
    /// removed regardless.
    pub fn delete_file(&mut self, parent: InodeId, node: InodeId) -> Result<()> {
        match self.get(node) {
            None => return Err(FsError::NotFound(format!("no inode with id {}", node))),
            Some(n) if n.is_directory() => {
                return Err(FsError::InvalidNode(format!(
                    "{} is a directory",
                    n.display_name()
                )))
            }
            Some(_) => {}
        }

        let children = children_of(&mut self.root, parent)?;
        let pos = children
            .iter()
            .position(|c| c.id() == node)
            .ok_or_else(|| {
                FsError::NotFound(format!("inode {} is not a child of {}", node, parent))
            })?;

        let file = children.remove(pos);
        let failed = release_blocks(&mut self.alloc, file.blocks());
        if failed > 0 {
            warn!(
                "deleted file {} with {} block(s) that could not be released",
                node, failed
            );
        }
        debug!("deleted file {} from {}", node, parent);
        Ok(())
    }

    /// Deletes the directory `node` and everything below it.
    ///
    /// With no parent, `node` must be the root and the whole tree is
    /// destroyed. Every file's blocks are returned to the allocator.
    pub fn delete_dir(&mut self, parent: Option<InodeId>, node: InodeId) -> Result<()> {
        match self.get(node) {
            None => return Err(FsError::NotFound(format!("no inode with id {}", node))),
            Some(n) if !n.is_directory() => {
                return Err(FsError::InvalidNode(format!(
                    "{} is not a directory",
                    n.display_name()
                )))
            }
            Some(_) => {}
        }

        let parent = match parent {
            Some(parent) => parent,
            None => {
                let is_root = self.root.as_ref().map_or(false, |r| r.id() == node);
                if !is_root {
                    return Err(FsError::InvalidNode(format!(
                        "directory {} has a parent but none was given",
                        node
                    )));
                }
                if let Some(mut root) = self.root.take() {
                    empty_dir(&mut self.alloc, &mut root);
                    node::shutdown(Some(root));
                }
                debug!("deleted root directory");
                return Ok(());
            }
        };

        let children = children_of(&mut self.root, parent)?;
        let pos = children
            .iter()
            .position(|c| c.id() == node)
            .ok_or_else(|| {
                FsError::NotFound(format!("inode {} is not a child of {}", node, parent))
            })?;

        empty_dir(&mut self.alloc, &mut children[pos]);
        children.remove(pos);
        debug!("deleted directory {} from {}", node, parent);
        Ok(())
    }

    /// Drops every inode without releasing any blocks. Used once the block
    /// assignments have been persisted or are no longer needed.
    pub fn shutdown(&mut self) {
        node::shutdown(self.root.take());
        debug!("inode tree shut down");
    }

    /// Shuts the tree down and hands back the allocator.
    pub fn into_allocator(mut self) -> A {
        self.shutdown();
        self.alloc
    }
}

/// Resolves `id` to the children list of a directory.
fn children_of(root: &mut Option<Inode>, id: InodeId) -> Result<&mut Vec<Inode>> {
    let node = root
        .as_mut()
        .and_then(|r| r.find_mut(id))
        .ok_or_else(|| FsError::InvalidNode(format!("no inode with id {}", id)))?;
    node.children_mut()
        .ok_or_else(|| FsError::InvalidNode(format!("inode {} is not a directory", id)))
}

fn check_unique(children: &[Inode], name: &[u8]) -> Result<()> {
    if children.iter().any(|c| c.name() == name) {
        return Err(FsError::NameConflict(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(())
}

/// Reserves `count` blocks one at a time. On failure every block already
/// taken is released before the error is returned.
fn reserve_blocks<A: BlockAllocator>(alloc: &mut A, count: usize) -> Result<Vec<BlockId>> {
    let mut blocks = Vec::new();
    if blocks.try_reserve_exact(count).is_err() {
        return Err(FsError::AllocationFailure(format!(
            "could not track {} blocks",
            count
        )));
    }

    for _ in 0..count {
        match alloc.allocate() {
            Ok(block) => blocks.push(block),
            Err(e) => {
                warn!(
                    "block reservation failed after {} of {} blocks: {}",
                    blocks.len(),
                    count,
                    e
                );
                release_blocks(alloc, &blocks);
                return Err(e);
            }
        }
    }
    Ok(blocks)
}

/// Returns blocks to the allocator, logging each one that cannot be released.
/// Returns the number of failures.
fn release_blocks<A: BlockAllocator>(alloc: &mut A, blocks: &[BlockId]) -> usize {
    let mut failed = 0;
    for &block in blocks {
        if let Err(e) = alloc.free(block) {
            warn!("failed to free block {}: {}", block, e);
            failed += 1;
        }
    }
    failed
}

/// Deletes every child of `dir` in child order, each directory only after
/// everything below it, releasing the blocks of every file on the way.
fn empty_dir<A: BlockAllocator>(alloc: &mut A, dir: &mut Inode) {
    // One frame per directory being emptied, its remaining children reversed.
    let mut frames: Vec<(Option<Inode>, Vec<Inode>)> = vec![(None, take_children(dir))];
    while let Some((_, remaining)) = frames.last_mut() {
        match remaining.pop() {
            Some(mut child) if child.is_directory() => {
                let below = take_children(&mut child);
                frames.push((Some(child), below));
            }
            Some(file) => {
                let failed = release_blocks(alloc, file.blocks());
                if failed > 0 {
                    warn!(
                        "deleted file {} with {} block(s) that could not be released",
                        file.id(),
                        failed
                    );
                }
                debug!("deleted {} ({})", file.display_name(), file.id());
            }
            None => {
                if let Some((Some(done), _)) = frames.pop() {
                    debug!("deleted {} ({})", done.display_name(), done.id());
                }
            }
        }
    }
}

fn take_children(dir: &mut Inode) -> Vec<Inode> {
    let mut children = dir.children_mut().map(std::mem::take).unwrap_or_default();
    children.reverse();
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{BlockAllocationTable, NUM_BLOCKS};

    fn tree_with_root() -> (InodeTree<BlockAllocationTable>, InodeId) {
        let mut fs = InodeTree::new(BlockAllocationTable::in_memory());
        let root = fs.create_dir(None, "/").unwrap();
        (fs, root)
    }

    #[test]
    fn root_takes_id_zero_and_is_unique() {
        let (mut fs, root) = tree_with_root();
        assert_eq!(root, ROOT_ID);
        assert_eq!(fs.len(), 1);
        assert!(matches!(fs.create_dir(None, "/"), Err(FsError::InvalidNode(_))));
        assert_eq!(fs.create_dir(Some(root), "etc").unwrap(), 1);
    }

    #[test]
    fn file_reserves_one_block_per_started_page() {
        let (mut fs, root) = tree_with_root();
        let kernel = fs.create_file(root, "kernel", true, 20000).unwrap();

        let node = fs.get(kernel).unwrap();
        assert_eq!(node.blocks(), &[0, 1, 2, 3, 4]);
        assert!(node.is_readonly());
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS - 5);
    }

    #[test]
    fn empty_file_reserves_no_blocks() {
        let (mut fs, root) = tree_with_root();
        let empty = fs.create_file(root, "empty", false, 0).unwrap();
        assert!(fs.get(empty).unwrap().blocks().is_empty());
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS);
    }

    #[test]
    fn creating_under_a_file_fails() {
        let (mut fs, root) = tree_with_root();
        let file = fs.create_file(root, "f", false, 10).unwrap();

        assert!(matches!(
            fs.create_file(file, "g", false, 10),
            Err(FsError::InvalidNode(_))
        ));
        assert!(matches!(
            fs.create_dir(Some(file), "d"),
            Err(FsError::InvalidNode(_))
        ));
        assert!(matches!(
            fs.create_dir(Some(99), "d"),
            Err(FsError::InvalidNode(_))
        ));
    }

    #[test]
    fn duplicate_names_conflict_across_kinds() {
        let (mut fs, root) = tree_with_root();
        fs.create_dir(Some(root), "a").unwrap();

        assert!(matches!(
            fs.create_file(root, "a", false, 4096),
            Err(FsError::NameConflict(_))
        ));
        assert_eq!(fs.root().unwrap().children().len(), 1);
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS);
    }

    #[test]
    fn failed_block_reservation_consumes_an_id_but_nothing_else() {
        let (mut fs, root) = tree_with_root();
        for _ in 0..NUM_BLOCKS - 2 {
            fs.allocator_mut().allocate().unwrap();
        }
        let before = fs.next_id().unwrap();

        let err = fs.create_file(root, "big", false, 3 * 4096).unwrap_err();
        assert!(matches!(err, FsError::AllocationFailure(_)));
        assert_eq!(fs.allocator().free_count(), 2);
        assert!(fs.root().unwrap().children().is_empty());
        assert_eq!(fs.next_id(), Some(before + 1));

        let small = fs.create_file(root, "small", false, 2 * 4096).unwrap();
        assert_eq!(small, before + 1);
    }

    #[test]
    fn find_only_looks_at_direct_children() {
        let (mut fs, root) = tree_with_root();
        let etc = fs.create_dir(Some(root), "etc").unwrap();
        let hosts = fs.create_file(etc, "hosts", false, 200).unwrap();

        assert_eq!(fs.find_inode_by_name(etc, "hosts").map(Inode::id), Some(hosts));
        assert!(fs.find_inode_by_name(root, "hosts").is_none());
        assert!(fs.find_inode_by_name(hosts, "x").is_none());
        assert!(fs.find_inode_by_name(42, "hosts").is_none());
    }

    #[test]
    fn delete_file_checks_kind_and_membership_first() {
        let (mut fs, root) = tree_with_root();
        let etc = fs.create_dir(Some(root), "etc").unwrap();
        let hosts = fs.create_file(etc, "hosts", false, 200).unwrap();

        assert!(matches!(fs.delete_file(root, etc), Err(FsError::InvalidNode(_))));
        assert!(matches!(fs.delete_file(hosts, hosts), Err(FsError::InvalidNode(_))));
        assert!(matches!(fs.delete_file(root, hosts), Err(FsError::NotFound(_))));
        assert!(matches!(fs.delete_file(etc, 77), Err(FsError::NotFound(_))));
        assert!(fs.contains(hosts));
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS - 1);

        fs.delete_file(etc, hosts).unwrap();
        assert!(!fs.contains(hosts));
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS);
    }

    #[test]
    fn delete_preserves_sibling_order() {
        let (mut fs, root) = tree_with_root();
        let ids: Vec<InodeId> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| fs.create_file(root, n, false, 1).unwrap())
            .collect();

        fs.delete_file(root, ids[1]).unwrap();

        let names: Vec<&[u8]> = fs.root().unwrap().children().iter().map(Inode::name).collect();
        assert_eq!(names, vec![&b"a"[..], &b"c"[..], &b"d"[..]]);
    }

    #[test]
    fn delete_file_tolerates_blocks_already_released() {
        let (mut fs, root) = tree_with_root();
        let f = fs.create_file(root, "f", false, 8192).unwrap();
        let stolen = fs.get(f).unwrap().blocks()[0];
        fs.allocator_mut().free(stolen).unwrap();

        fs.delete_file(root, f).unwrap();
        assert!(!fs.contains(f));
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS);
    }

    #[test]
    fn delete_dir_without_parent_requires_root() {
        let (mut fs, root) = tree_with_root();
        let etc = fs.create_dir(Some(root), "etc").unwrap();
        let hosts = fs.create_file(etc, "hosts", false, 200).unwrap();

        assert!(matches!(fs.delete_dir(None, etc), Err(FsError::InvalidNode(_))));
        assert!(matches!(fs.delete_dir(Some(root), hosts), Err(FsError::InvalidNode(_))));

        fs.delete_dir(None, root).unwrap();
        assert!(fs.is_empty());
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS);
        assert_eq!(fs.create_dir(None, "/").unwrap(), ROOT_ID);
    }

    #[test]
    fn delete_dir_from_wrong_parent_leaves_tree_unchanged() {
        let (mut fs, root) = tree_with_root();
        let usr = fs.create_dir(Some(root), "usr").unwrap();
        let bin = fs.create_dir(Some(usr), "bin").unwrap();
        fs.create_file(bin, "ls", true, 14322).unwrap();
        let snapshot = fs.root().cloned();

        assert!(matches!(fs.delete_dir(Some(root), bin), Err(FsError::NotFound(_))));
        assert_eq!(fs.root().cloned(), snapshot);
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS - 4);
    }

    #[test]
    fn shutdown_keeps_blocks_reserved() {
        let (mut fs, root) = tree_with_root();
        fs.create_file(root, "kernel", true, 20000).unwrap();

        let bat = fs.into_allocator();
        assert_eq!(bat.free_count(), NUM_BLOCKS - 5);
    }

    #[test]
    fn id_counter_refuses_to_wrap() {
        let mut ids = IdCounter::new();
        ids.restore_after_load(InodeId::MAX - 1);
        assert_eq!(ids.peek(), Some(InodeId::MAX));
        assert_eq!(ids.draw().unwrap(), InodeId::MAX);
        assert_eq!(ids.peek(), None);
        assert!(matches!(ids.draw(), Err(FsError::AllocationFailure(_))));
    }

    #[test]
    fn id_counter_never_moves_backwards() {
        let mut ids = IdCounter::new();
        ids.restore_after_load(40);
        assert_eq!(ids.peek(), Some(41));

        ids.restore_after_load(7);
        assert_eq!(ids.peek(), Some(41));
        assert_eq!(ids.draw().unwrap(), 41);
    }

    /// Hands out ascending blocks and records the order they come back in.
    #[derive(Default)]
    struct RecordingAllocator {
        next: BlockId,
        freed: Vec<BlockId>,
    }

    impl BlockAllocator for RecordingAllocator {
        fn allocate(&mut self) -> Result<BlockId> {
            self.next += 1;
            Ok(self.next - 1)
        }

        fn free(&mut self, block: BlockId) -> Result<()> {
            self.freed.push(block);
            Ok(())
        }

        fn free_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn delete_dir_releases_children_in_order_depth_first() {
        let mut fs = InodeTree::new(RecordingAllocator::default());
        let root = fs.create_dir(None, "/").unwrap();
        let top = fs.create_dir(Some(root), "top").unwrap();
        fs.create_file(top, "a", false, 1).unwrap();
        let sub = fs.create_dir(Some(top), "sub").unwrap();
        fs.create_file(sub, "b", false, 1).unwrap();
        fs.create_file(sub, "c", false, 1).unwrap();
        fs.create_file(top, "d", false, 1).unwrap();

        fs.delete_dir(Some(root), top).unwrap();
        assert_eq!(fs.allocator().freed, vec![0, 1, 2, 3]);
        assert!(fs.root().unwrap().children().is_empty());
    }

    #[test]
    fn deleting_a_deep_root_releases_every_block() {
        let mut fs = InodeTree::new(BlockAllocationTable::in_memory());
        let blocks = reserve_blocks(&mut fs.alloc, 2).unwrap();
        let mut node = Inode::new_file(100_000, b"f".to_vec(), false, 8192, blocks);
        for id in (1..100_000).rev() {
            node = Inode::new_dir(id, b"d".to_vec(), false, vec![node]);
        }
        fs.root = Some(Inode::new_dir(ROOT_ID, b"/".to_vec(), false, vec![node]));
        fs.ids.restore_after_load(100_000);
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS - 2);

        fs.delete_dir(None, ROOT_ID).unwrap();
        assert!(fs.is_empty());
        assert_eq!(fs.allocator().free_count(), NUM_BLOCKS);
    }
}
