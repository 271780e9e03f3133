//! Master file table codec.
//!
//! The table is a flat stream of variable-length records, one per inode, in
//! depth-first pre-order so that a directory always precedes its descendants.
//! Every integer is little endian.
//!
//! ```text
//! id            u32
//! name_length   u32
//! name          name_length bytes, no terminator
//! is_directory  u8
//! is_readonly   u8
//! filesize      u32   files only
//! num_entries   u32
//! entries       num_entries x u32
//! ```
//!
//! Directory entries are child ids in child order. File entries are the raw
//! block ids held by the file.
use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{debug, warn};

use crate::error::{FsError, Result};
use crate::node::{blocks_for_size, Inode, InodeId, InodeKind, ROOT_ID};

/// A tree rebuilt from a master file table.
#[derive(Debug)]
pub struct Mft {
    pub root: Inode,
    /// The largest id found in the table, including records that were not
    /// reachable from the root.
    pub max_id: InodeId,
}

/// Writes `root` and all of its descendants to `path`, replacing the file.
pub fn save<P: AsRef<Path>>(path: P, root: &Inode) -> Result<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    write_to(&mut out, root)?;
    out.flush()?;
    debug!(
        "saved {} inodes to {}",
        root.subtree_len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Reads a master file table from `path`.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Mft> {
    let buf = fs::read(path.as_ref())?;
    debug!("loading {} bytes from {}", buf.len(), path.as_ref().display());
    decode(&buf)
}

/// Encodes a tree into master file table bytes.
pub fn encode(root: &Inode) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_to(&mut buf, root)?;
    Ok(buf)
}

/// Writes one record per inode in pre-order.
pub fn write_to<W: Write>(out: &mut W, root: &Inode) -> Result<()> {
    for (_, node) in root.walk() {
        out.write_all(&node.id().to_le_bytes())?;
        out.write_all(&len_u32(node.name().len(), node)?.to_le_bytes())?;
        out.write_all(node.name())?;

        let readonly = node.is_readonly() as u8;
        match node.kind() {
            InodeKind::Directory { children } => {
                out.write_all(&[1, readonly])?;
                out.write_all(&len_u32(children.len(), node)?.to_le_bytes())?;
                for child in children {
                    out.write_all(&child.id().to_le_bytes())?;
                }
            }
            InodeKind::File { filesize, blocks } => {
                out.write_all(&[0, readonly])?;
                out.write_all(&filesize.to_le_bytes())?;
                out.write_all(&len_u32(blocks.len(), node)?.to_le_bytes())?;
                for block in blocks {
                    out.write_all(&block.to_le_bytes())?;
                }
            }
        }
    }
    Ok(())
}

fn len_u32(len: usize, node: &Inode) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        FsError::InvalidNode(format!(
            "inode {} has a field too long to encode",
            node.id()
        ))
    })
}

/// One decoded record whose directory entries are still ids.
struct RawRecord {
    offset: usize,
    id: InodeId,
    name: Vec<u8>,
    is_directory: bool,
    readonly: bool,
    filesize: u32,
    entries: Vec<u32>,
}

struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if len > self.remaining() {
            return None;
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads the next record. A stream that ends inside a fixed-width field
    /// is treated as the end of the table; a declared name or entry count the
    /// remaining bytes cannot hold is corruption.
    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        let offset = self.pos;
        let record = self.read_fields(offset)?;
        if record.is_none() {
            self.truncated(offset);
        }
        Ok(record)
    }

    fn read_fields(&mut self, offset: usize) -> Result<Option<RawRecord>> {
        let Some(id) = self.u32() else { return Ok(None) };
        let Some(name_length) = self.u32() else { return Ok(None) };
        let name_length = name_length as usize;
        let name = self
            .take(name_length)
            .ok_or_else(|| {
                FsError::corrupt(
                    offset,
                    format!(
                        "inode {} declares a {} byte name but only {} bytes remain",
                        id,
                        name_length,
                        self.remaining()
                    ),
                )
            })?
            .to_vec();
        let Some(is_directory) = self.u8() else { return Ok(None) };
        let Some(readonly) = self.u8() else { return Ok(None) };
        let is_directory = is_directory != 0;
        let filesize = if is_directory {
            0
        } else {
            let Some(size) = self.u32() else { return Ok(None) };
            size
        };
        let Some(num_entries) = self.u32() else { return Ok(None) };
        let num_entries = num_entries as usize;

        let entries = num_entries
            .checked_mul(4)
            .and_then(|len| self.take(len))
            .ok_or_else(|| {
                FsError::corrupt(
                    offset,
                    format!(
                        "inode {} declares {} entries but only {} bytes remain",
                        id,
                        num_entries,
                        self.remaining()
                    ),
                )
            })?
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Some(RawRecord {
            offset,
            id,
            name,
            is_directory,
            readonly: readonly != 0,
            filesize,
            entries,
        }))
    }

    fn truncated(&mut self, offset: usize) {
        if offset < self.buf.len() {
            debug!(
                "ignoring {} trailing bytes of a partial record",
                self.buf.len() - offset
            );
        }
        self.pos = self.buf.len();
    }
}

/// Decodes master file table bytes into an owned tree.
///
/// Records are first collected into an id-keyed table and every directory
/// entry is checked to name a distinct, existing inode with a single parent.
/// The directories reachable from the root are then filled deepest first, so
/// the order of records in the stream does not matter.
pub fn decode(buf: &[u8]) -> Result<Mft> {
    let mut reader = RecordReader::new(buf);
    let mut table: BTreeMap<InodeId, Inode> = BTreeMap::new();
    let mut directories: BTreeMap<InodeId, (usize, Vec<InodeId>)> = BTreeMap::new();
    let mut max_id: Option<InodeId> = None;

    while let Some(record) = reader.next_record()? {
        if table.contains_key(&record.id) {
            return Err(FsError::corrupt(
                record.offset,
                format!("inode {} appears more than once", record.id),
            ));
        }
        max_id = max_id.max(Some(record.id));

        let node = if record.is_directory {
            directories.insert(record.id, (record.offset, record.entries));
            Inode::new_dir(record.id, record.name, record.readonly, Vec::new())
        } else {
            let expected = blocks_for_size(record.filesize);
            if record.entries.len() != expected {
                return Err(FsError::corrupt(
                    record.offset,
                    format!(
                        "file {} of {} bytes lists {} blocks, expected {}",
                        record.id,
                        record.filesize,
                        record.entries.len(),
                        expected
                    ),
                ));
            }
            Inode::new_file(
                record.id,
                record.name,
                record.readonly,
                record.filesize,
                record.entries,
            )
        };
        table.insert(record.id, node);
    }

    let parents = link_parents(&table, &directories)?;
    match table.get(&ROOT_ID) {
        None => return Err(FsError::corrupt(buf.len(), "no root record with id 0")),
        Some(root) if !root.is_directory() => {
            return Err(FsError::corrupt(0, "root record is not a directory"))
        }
        Some(_) => {}
    }
    if let Some(parent) = parents.get(&ROOT_ID) {
        return Err(FsError::corrupt(
            directories.get(parent).map_or(0, |(offset, _)| *offset),
            format!("directory {} lists the root as a child", parent),
        ));
    }

    // Every inode has at most one parent and the root has none, so the walk
    // from the root cannot revisit a directory.
    let mut reachable = Vec::new();
    let mut stack = vec![ROOT_ID];
    while let Some(id) = stack.pop() {
        if let Some((_, entries)) = directories.get(&id) {
            reachable.push(id);
            stack.extend(entries.iter().rev());
        }
    }

    for dir_id in reachable.into_iter().rev() {
        let (offset, child_ids) = match directories.remove(&dir_id) {
            Some(entry) => entry,
            None => continue,
        };
        let mut children: Vec<Inode> = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            let child = table.remove(&child_id).ok_or_else(|| {
                FsError::corrupt(
                    offset,
                    format!("directory {} references missing inode {}", dir_id, child_id),
                )
            })?;
            if children.iter().any(|c| c.name() == child.name()) {
                return Err(FsError::corrupt(
                    offset,
                    format!(
                        "directory {} has two children named {}",
                        dir_id,
                        child.display_name()
                    ),
                ));
            }
            children.push(child);
        }
        if let Some(slot) = table.get_mut(&dir_id).and_then(Inode::children_mut) {
            *slot = children;
        }
    }

    let root = table
        .remove(&ROOT_ID)
        .ok_or_else(|| FsError::corrupt(buf.len(), "no root record with id 0"))?;
    check_orphans(&table, &directories, &parents)?;
    for (id, orphan) in table {
        warn!(
            "dropping inode {} ({}) which is not reachable from the root",
            id,
            orphan.display_name()
        );
    }

    Ok(Mft {
        root,
        max_id: max_id.unwrap_or(ROOT_ID),
    })
}

/// Maps every listed child to the directory listing it.
fn link_parents(
    table: &BTreeMap<InodeId, Inode>,
    directories: &BTreeMap<InodeId, (usize, Vec<InodeId>)>,
) -> Result<BTreeMap<InodeId, InodeId>> {
    let mut parents = BTreeMap::new();
    for (&dir_id, (offset, child_ids)) in directories {
        for &child_id in child_ids {
            if child_id == dir_id {
                return Err(FsError::corrupt(
                    *offset,
                    format!("directory {} lists itself as a child", dir_id),
                ));
            }
            if !table.contains_key(&child_id) {
                return Err(FsError::corrupt(
                    *offset,
                    format!("directory {} references missing inode {}", dir_id, child_id),
                ));
            }
            if let Some(first) = parents.insert(child_id, dir_id) {
                return Err(FsError::corrupt(
                    *offset,
                    format!(
                        "inode {} is listed by directory {} and again by directory {}",
                        child_id, first, dir_id
                    ),
                ));
            }
        }
    }
    Ok(parents)
}

/// The records left over after attaching must hang off parentless records.
/// Anything else sits on a directory cycle.
fn check_orphans(
    orphans: &BTreeMap<InodeId, Inode>,
    directories: &BTreeMap<InodeId, (usize, Vec<InodeId>)>,
    parents: &BTreeMap<InodeId, InodeId>,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<InodeId> = orphans
        .keys()
        .filter(|id| !parents.contains_key(*id))
        .copied()
        .collect();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            if let Some((_, entries)) = directories.get(&id) {
                stack.extend(entries);
            }
        }
    }

    match directories
        .iter()
        .find(|&(&id, _)| orphans.contains_key(&id) && !seen.contains(&id))
    {
        Some((id, (offset, _))) => Err(FsError::corrupt(
            *offset,
            format!("directory {} is part of a cycle", id),
        )),
        None => Ok(()),
    }
}
