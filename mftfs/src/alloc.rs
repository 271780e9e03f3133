use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{FsError, Result};

/// Number of blocks on the simulated disk.
pub const NUM_BLOCKS: usize = 250;

/// Identifier of one storage block, ranging from 0 to `NUM_BLOCKS - 1`.
pub type BlockId = u32;

const FREE: u8 = 0;
const USED: u8 = 1;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// Hands out and reclaims storage blocks. The inode tree only ever talks to
/// storage through this interface.
pub trait BlockAllocator {
    /// Reserves a single free block.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` when every block is in use.
    fn allocate(&mut self) -> Result<BlockId>;
    /// Returns a reserved block to the pool.
    ///
    /// # Errors
    ///
    /// Freeing a block that is out of range or not reserved is an error.
    fn free(&mut self, block: BlockId) -> Result<()>;
    /// The number of blocks currently available.
    fn free_count(&self) -> usize;
}

/// Flat occupancy record, one byte per block. This is also the exact on-disk
/// layout of the block allocation table file.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy)]
pub struct OccupancyTable {
    entries: [u8; NUM_BLOCKS],
}

impl OccupancyTable {
    pub fn new() -> Self {
        Self::new_zeroed()
    }

    /// Reads a table from a buffer of exactly `NUM_BLOCKS` bytes.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let table = Self::read_from(buf).ok_or_else(|| {
            FsError::corrupt(
                buf.len().min(NUM_BLOCKS),
                format!(
                    "block allocation table must be {} bytes, found {}",
                    NUM_BLOCKS,
                    buf.len()
                ),
            )
        })?;
        if let Some(pos) = table.entries.iter().position(|&e| e != FREE && e != USED) {
            return Err(FsError::corrupt(pos, "occupancy entry is neither 0 nor 1"));
        }
        Ok(table)
    }

    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn get(&self, blocknr: usize) -> Option<State> {
        self.entries.get(blocknr).map(|&e| match e {
            FREE => State::Free,
            _ => State::Used,
        })
    }

    fn set(&mut self, blocknr: usize, state: State) {
        self.entries[blocknr] = match state {
            State::Free => FREE,
            State::Used => USED,
        };
    }

    pub fn count_free(&self) -> usize {
        self.entries.iter().filter(|&&e| e == FREE).count()
    }

    /// Finds the first free block at or after `start`, wrapping around to the
    /// beginning of the table.
    fn find_free(&self, start: usize) -> Option<usize> {
        (start..NUM_BLOCKS)
            .chain(0..start)
            .find(|&i| self.entries[i] == FREE)
    }
}

impl Default for OccupancyTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Next-available allocation over an occupancy table. Each allocation starts
/// scanning where the previous one ended, so freed blocks are only reused
/// after the rest of the disk has been tried.
///
/// When the table is backed by a file every change is written through.
pub struct BlockAllocationTable {
    table: OccupancyTable,
    /// Keeps track of the next starting place for looking for available blocks.
    marker: usize,
    path: Option<PathBuf>,
}

impl BlockAllocationTable {
    /// A table that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            table: OccupancyTable::new(),
            marker: 0,
            path: None,
        }
    }

    /// Opens an existing table file without resetting it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        BlockAllocationTableBuilder::new()
            .with_path(path)
            .clear_medium(false)
            .build()
    }

    /// Marks every block free.
    pub fn format(&mut self) -> Result<()> {
        self.table = OccupancyTable::new();
        self.marker = 0;
        debug!("formatted block allocation table ({} blocks)", NUM_BLOCKS);
        self.sync()
    }

    /// Writes the table to its backing file, if it has one.
    pub fn sync(&self) -> Result<()> {
        if let Some(path) = &self.path {
            fs::write(path, self.table.serialize())?;
        }
        Ok(())
    }

    pub fn state(&self, block: BlockId) -> Option<State> {
        self.table.get(block as usize)
    }

    pub fn table(&self) -> &OccupancyTable {
        &self.table
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Renders the occupancy table, 20 blocks per row.
    pub fn render(&self) -> String {
        let used: Vec<bool> = (0..NUM_BLOCKS)
            .map(|i| self.table.get(i) == Some(State::Used))
            .collect();
        render_occupancy("Blocks in use on disk:", &used)
    }
}

impl BlockAllocator for BlockAllocationTable {
    fn allocate(&mut self) -> Result<BlockId> {
        let blocknr = self
            .table
            .find_free(self.marker)
            .ok_or_else(|| FsError::AllocationFailure("no free blocks on disk".to_string()))?;

        self.table.set(blocknr, State::Used);
        if let Err(e) = self.sync() {
            self.table.set(blocknr, State::Free);
            return Err(e);
        }
        self.marker = (blocknr + 1) % NUM_BLOCKS;
        debug!("allocated block {}", blocknr);
        Ok(blocknr as BlockId)
    }

    fn free(&mut self, block: BlockId) -> Result<()> {
        match self.table.get(block as usize) {
            None => {
                return Err(FsError::InvalidNode(format!(
                    "block {} is outside the disk",
                    block
                )))
            }
            Some(State::Free) => {
                warn!("attempted to free block {} which is not in use", block);
                return Err(FsError::NotFound(format!("block {} is not in use", block)));
            }
            Some(State::Used) => {}
        }

        self.table.set(block as usize, State::Free);
        if let Err(e) = self.sync() {
            self.table.set(block as usize, State::Used);
            return Err(e);
        }
        debug!("freed block {}", block);
        Ok(())
    }

    fn free_count(&self) -> usize {
        self.table.count_free()
    }
}

/// Configures where a block allocation table lives and whether an existing
/// table is reset.
pub struct BlockAllocationTableBuilder {
    path: Option<PathBuf>,
    clear_medium: bool,
}

impl Default for BlockAllocationTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAllocationTableBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            clear_medium: true,
        }
    }

    /// Backs the table with a file. Every allocation and free is written through.
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// When set (the default), the table is formatted on build, destroying any
    /// existing contents. Otherwise the existing file is read.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    pub fn build(self) -> Result<BlockAllocationTable> {
        let mut bat = BlockAllocationTable {
            table: OccupancyTable::new(),
            marker: 0,
            path: self.path,
        };

        match (&bat.path, self.clear_medium) {
            (Some(path), false) => {
                let buf = fs::read(path)?;
                bat.table = OccupancyTable::parse(&buf)?;
            }
            _ => bat.format()?,
        }
        Ok(bat)
    }
}

/// Renders a 0/1 occupancy row listing with a title line.
pub(crate) fn render_occupancy(title: &str, used: &[bool]) -> String {
    let mut out = String::from(title);
    for (i, &in_use) in used.iter().enumerate() {
        if i % 20 == 0 {
            out.push_str(&format!("\n{:03}: ", i));
        }
        out.push(if in_use { '1' } else { '0' });
    }
    out.push('\n');
    out
}
