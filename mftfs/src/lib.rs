//! An in-memory inode tree persisted to a binary master file table.
//!
//! Files reserve storage blocks from a [`BlockAllocator`]; the tree itself
//! only keeps the block ids. A finished tree is written out with
//! [`InodeTree::save_mft`] and rebuilt with [`InodeTree::load_mft`].
//!
//! ```no_run
//! use mftfs::{BlockAllocationTableBuilder, InodeTree};
//!
//! # fn main() -> mftfs::Result<()> {
//! let bat = BlockAllocationTableBuilder::new().with_path("bat").build()?;
//! let mut fs = InodeTree::new(bat);
//! let root = fs.create_dir(None, "/")?;
//! let etc = fs.create_dir(Some(root), "etc")?;
//! fs.create_file(etc, "hosts", false, 200)?;
//! fs.save_mft("mft")?;
//! fs.shutdown();
//! # Ok(())
//! # }
//! ```
pub mod alloc;
pub mod dump;
mod error;
mod fs;
pub mod mft;
mod node;

pub use crate::alloc::{
    BlockAllocationTable, BlockAllocationTableBuilder, BlockAllocator, BlockId, NUM_BLOCKS,
};
pub use crate::error::{FsError, Result};
pub use crate::fs::{IdCounter, InodeTree};
pub use crate::node::{blocks_for_size, shutdown, Inode, InodeId, InodeKind, Walk, ROOT_ID};

/// Size of one storage block in bytes.
pub const BLOCK_SIZE: usize = 4096;
