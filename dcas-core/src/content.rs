//! Content availability and staging sessions

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};

/// Physical state of a content's bytes in a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentState {
    /// No bytes, or an incomplete staged prefix with no open session
    Absent,
    /// A live staging session is writing the bytes
    Staging,
    /// Every byte is staged and verified, awaiting a revision
    Staged,
    /// Stored and readable
    Present,
}

/// Result of `get_content_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub state: ContentState,
    /// Bytes held so far (staged prefix or full content)
    pub length: u64,
}

impl ContentInfo {
    pub fn absent() -> Self {
        Self {
            state: ContentState::Absent,
            length: 0,
        }
    }

    /// Check if the bytes are available without a transfer
    pub fn is_available(&self) -> bool {
        matches!(self.state, ContentState::Staged | ContentState::Present)
    }
}

/// Handle on an in-progress upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingInfo {
    /// Opaque session token
    pub session_id: String,
    /// Bytes written so far
    pub length: u64,
    /// Digest of the bytes written so far
    pub hash: ContentHash,
}
