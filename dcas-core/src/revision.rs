//! Revision object
//!
//! A revision is one immutable version of a content's metadata. Its hash is
//! computed from everything it carries, so two nodes that independently build
//! the same revision end up with the same identifier.

use crate::hash::{ContentHash, RevisionHash};
use crate::value::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One version of a content's metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Content this revision describes
    pub content: ContentHash,
    /// Self-certifying identifier
    pub revision: RevisionHash,
    /// Revisions this one directly supersedes
    pub parents: BTreeSet<RevisionHash>,
    /// Tombstone marker
    pub deleted: bool,
    /// Metadata snapshot
    pub metadata: Metadata,
}

/// Fields covered by the revision hash, in canonical order
#[derive(Serialize)]
struct HashedFields<'a> {
    content: &'a ContentHash,
    parents: &'a BTreeSet<RevisionHash>,
    deleted: bool,
    metadata: &'a Metadata,
}

impl Revision {
    /// Create a revision, computing its hash
    pub fn new(
        content: ContentHash,
        parents: impl IntoIterator<Item = RevisionHash>,
        metadata: Metadata,
        deleted: bool,
    ) -> Self {
        let parents: BTreeSet<RevisionHash> = parents.into_iter().collect();
        let revision = compute_hash(&content, &parents, deleted, &metadata);
        Self {
            content,
            revision,
            parents,
            deleted,
            metadata,
        }
    }

    /// Create a root revision (no parents)
    pub fn root(content: ContentHash, metadata: Metadata) -> Self {
        Self::new(content, [], metadata, false)
    }

    /// Check that the stored hash matches the revision's fields
    pub fn verify(&self) -> bool {
        compute_hash(&self.content, &self.parents, self.deleted, &self.metadata) == self.revision
    }

    /// Check if this is a root revision
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Check if this revision merges concurrent heads
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

fn compute_hash(
    content: &ContentHash,
    parents: &BTreeSet<RevisionHash>,
    deleted: bool,
    metadata: &Metadata,
) -> RevisionHash {
    let fields = HashedFields {
        content,
        parents,
        deleted,
        metadata,
    };
    let encoded =
        bincode::serialize(&fields).expect("revision fields always have a bincode encoding");
    RevisionHash::from_data(&encoded)
}
