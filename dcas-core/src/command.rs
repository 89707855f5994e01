//! Outcome of mutating repository calls

use crate::hash::RevisionHash;
use crate::tree::RevisionTree;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of change a mutation made to a revision tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
    NoOp,
}

impl Operation {
    /// Classify the transition from `before` to `after`. A tree that was
    /// deleted and comes back counts as a creation.
    pub fn between(before: Option<&RevisionTree>, after: &RevisionTree) -> Self {
        let was_live = before.is_some_and(|t| !t.is_empty() && !t.is_deleted());
        match (was_live, after.is_deleted()) {
            (false, false) => Operation::Create,
            (true, true) => Operation::Delete,
            (false, true) if before.is_none_or(RevisionTree::is_empty) => Operation::Create,
            _ => Operation::Update,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::NoOp => "NO_OP",
        };
        f.write_str(name)
    }
}

/// Result of a mutating call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub operation: Operation,
    /// Head of the tree after the call
    pub head: BTreeSet<RevisionHash>,
    /// Event sequence number produced, if any
    pub seq: Option<u64>,
}

impl CommandResult {
    pub fn no_op(head: BTreeSet<RevisionHash>) -> Self {
        Self {
            operation: Operation::NoOp,
            head,
            seq: None,
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.operation == Operation::NoOp
    }
}
