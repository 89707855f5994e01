//! Repository event log entries

use crate::command::Operation;
use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a repository's append-only history. Sequence numbers start
/// at 1 and have no gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub content: ContentHash,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
}
