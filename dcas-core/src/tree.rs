//! Revision tree
//!
//! The DAG of every revision a repository knows for one content hash.
//! Revisions are stored flat, keyed by hash, with parents held as hash
//! references. A tree may be partial: parents that have not arrived yet are
//! simply absent.
//!
//! Hash verification on [`RevisionTree::add`] also rules out parent cycles,
//! since a cycle would need a revision hash that is an input to itself.

use crate::hash::{ContentHash, RevisionHash};
use crate::merge::{self, Ancestry};
use crate::revision::Revision;
use crate::value::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Errors raised while building a tree
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("Revision {revision} describes content {actual}, expected {expected}")]
    ContentMismatch {
        expected: ContentHash,
        actual: ContentHash,
        revision: RevisionHash,
    },

    #[error("Revision {0} does not match its hash")]
    InvalidHash(RevisionHash),

    #[error("Cannot combine tree of {actual} into tree of {expected}")]
    TreeMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
}

/// Version history of one content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionTree {
    content: ContentHash,
    length: u64,
    revisions: BTreeMap<RevisionHash, Revision>,
}

impl RevisionTree {
    /// Create an empty tree
    pub fn new(content: ContentHash, length: u64) -> Self {
        Self {
            content,
            length,
            revisions: BTreeMap::new(),
        }
    }

    /// Create a tree holding `revisions`
    pub fn from_revisions(
        content: ContentHash,
        length: u64,
        revisions: impl IntoIterator<Item = Revision>,
    ) -> Result<Self, TreeError> {
        let mut tree = Self::new(content, length);
        for rev in revisions {
            tree.add(rev)?;
        }
        Ok(tree)
    }

    pub fn content(&self) -> ContentHash {
        self.content
    }

    /// Byte length of the content
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn get(&self, hash: &RevisionHash) -> Option<&Revision> {
        self.revisions.get(hash)
    }

    pub fn contains(&self, hash: &RevisionHash) -> bool {
        self.revisions.contains_key(hash)
    }

    /// Iterate over revisions in hash order
    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.values()
    }

    /// Insert a revision. Returns `false` if it was already known.
    pub fn add(&mut self, revision: Revision) -> Result<bool, TreeError> {
        if revision.content != self.content {
            return Err(TreeError::ContentMismatch {
                expected: self.content,
                actual: revision.content,
                revision: revision.revision,
            });
        }
        if !revision.verify() {
            return Err(TreeError::InvalidHash(revision.revision));
        }
        if self.revisions.contains_key(&revision.revision) {
            return Ok(false);
        }
        self.revisions.insert(revision.revision, revision);
        Ok(true)
    }

    /// Set-union `other` into this tree. Either every revision is taken or,
    /// on error, the tree is left untouched. Returns how many were new.
    pub fn absorb(&mut self, other: &RevisionTree) -> Result<usize, TreeError> {
        if other.content != self.content {
            return Err(TreeError::TreeMismatch {
                expected: self.content,
                actual: other.content,
            });
        }
        let mut combined = self.clone();
        let mut added = 0;
        for rev in other.revisions() {
            if combined.add(rev.clone())? {
                added += 1;
            }
        }
        if combined.length == 0 {
            combined.length = other.length;
        }
        *self = combined;
        Ok(added)
    }

    /// Revisions no other revision in the tree lists as a parent
    pub fn head(&self) -> BTreeSet<RevisionHash> {
        let referenced = self.referenced_parents();
        self.revisions
            .keys()
            .filter(|h| !referenced.contains(h))
            .copied()
            .collect()
    }

    /// Revisions with none of their parents present
    pub fn tail(&self) -> BTreeSet<RevisionHash> {
        self.revisions
            .values()
            .filter(|r| r.parents.iter().all(|p| !self.revisions.contains_key(p)))
            .map(|r| r.revision)
            .collect()
    }

    /// Parents referenced by some revision but missing from the tree
    pub fn unknown_parents(&self) -> BTreeSet<RevisionHash> {
        self.referenced_parents()
            .into_iter()
            .filter(|p| !self.revisions.contains_key(p))
            .collect()
    }

    pub fn head_revisions(&self) -> Vec<&Revision> {
        self.head().iter().filter_map(|h| self.get(h)).collect()
    }

    /// True iff the tree has a head and every head is a tombstone
    pub fn is_deleted(&self) -> bool {
        let heads = self.head_revisions();
        !heads.is_empty() && heads.iter().all(|r| r.deleted)
    }

    /// Build a revision succeeding the current head
    pub fn child(&self, metadata: Metadata, deleted: bool) -> Revision {
        Revision::new(self.content, self.head(), metadata, deleted)
    }

    /// Lowest common ancestors of the current heads
    pub fn merge_bases(&self) -> BTreeSet<RevisionHash> {
        Ancestry::new(self).merge_bases(&self.head())
    }

    /// Fold concurrent heads into one new revision. Returns the merge
    /// revision hash, or `None` when the tree already has a single head.
    pub fn merge(&mut self) -> Option<RevisionHash> {
        let heads = self.head();
        if heads.len() <= 1 {
            return None;
        }
        let merged = merge::merge_heads(self, &heads);
        let hash = merged.revision;
        self.revisions.insert(hash, merged);
        Some(hash)
    }

    /// Copy of this tree with concurrent heads merged
    pub fn merged(&self) -> RevisionTree {
        let mut tree = self.clone();
        tree.merge();
        tree
    }

    fn referenced_parents(&self) -> HashSet<RevisionHash> {
        self.revisions
            .values()
            .flat_map(|r| r.parents.iter().copied())
            .collect()
    }
}
