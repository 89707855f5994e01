//! Errors surfaced by the repository contract
//!
//! The replication engine applies a different policy per variant, so each
//! failure mode has its own variant:
//!
//! | Variant | Agent / pool reaction |
//! |---------|-----------------------|
//! | `UnknownRepository`, `RepositoryClosed`, `UnreachableNode` | `try_start_agent` treats them as "not started yet" |
//! | `StagingInProgress` | the event is retried after a pause |
//! | `UnknownSession` | ignored while releasing a staging session |
//! | `AlreadyPresent` from `stage_content` | the bytes are there, the tree is merged |
//! | anything else | fatal: the agent enters the error state |

use crate::hash::ContentHash;
use crate::tree::TreeError;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Unknown repository: {0}")]
    UnknownRepository(String),

    #[error("Repository {0} is closed")]
    RepositoryClosed(String),

    #[error("Node hosting {0} is unreachable")]
    UnreachableNode(String),

    #[error("Unknown content: {0}")]
    UnknownContent(ContentHash),

    #[error("Content {0} is not present")]
    ContentNotPresent(ContentHash),

    #[error("Content {0} is already present")]
    AlreadyPresent(ContentHash),

    #[error("Content {0} is already being staged")]
    StagingInProgress(ContentHash),

    #[error("Staging session {session_id} not found for {content}")]
    UnknownSession {
        content: ContentHash,
        session_id: String,
    },

    #[error("Invalid range [{offset}, {offset}+{length}) for {content} ({available} bytes available)")]
    InvalidRange {
        content: ContentHash,
        offset: u64,
        length: u64,
        available: u64,
    },

    #[error("Invalid revision tree: {0}")]
    Tree(#[from] TreeError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    /// Check if the repository cannot be reached right now (as opposed to a
    /// failure of the operation itself)
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::UnknownRepository(_) | Self::RepositoryClosed(_) | Self::UnreachableNode(_)
        )
    }
}
