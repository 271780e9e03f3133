use thiserror::Error;

/// Errors returned by tree, allocator and master file table operations.
///
/// Every variant is recoverable; a failed call leaves the tree in the state it
/// had before the call, except for ids drawn during a failed creation.
#[derive(Error, Debug)]
pub enum FsError {
    /// A node of the wrong kind, or an absent node, was passed where a file or
    /// directory was required.
    #[error("invalid node: {0}")]
    InvalidNode(String),
    /// A sibling with the same name already exists.
    #[error("name already exists in directory: {0}")]
    NameConflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Block pool or memory exhausted while provisioning a node.
    #[error("allocation failed: {0}")]
    AllocationFailure(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A master file table record could not be decoded.
    #[error("corrupt master file table at byte {offset}: {detail}")]
    CorruptFormat { offset: usize, detail: String },
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub(crate) fn corrupt(offset: usize, detail: impl Into<String>) -> Self {
        FsError::CorruptFormat {
            offset,
            detail: detail.into(),
        }
    }
}
