//! Coordination-free merge of concurrent heads
//!
//! The merged revision depends only on the set of revisions in the tree, never
//! on the order they arrived in, so every replica that sees the same heads
//! builds the same merge revision (and therefore the same revision hash).
//!
//! Per-key policy against the selected base:
//! - no head changed the key: keep the base value
//! - every head that changed the key agrees: take that value
//! - heads disagree: the changing head with the greatest revision hash wins
//!
//! Removing a key counts as changing it to "absent".

use crate::hash::RevisionHash;
use crate::revision::Revision;
use crate::tree::RevisionTree;
use crate::value::{Metadata, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Ancestor lookups over one tree, memoised per starting revision
pub(crate) struct Ancestry<'a> {
    tree: &'a RevisionTree,
    inclusive: HashMap<RevisionHash, HashSet<RevisionHash>>,
}

impl<'a> Ancestry<'a> {
    pub(crate) fn new(tree: &'a RevisionTree) -> Self {
        Self {
            tree,
            inclusive: HashMap::new(),
        }
    }

    /// `hash` and every revision reachable from it through present parents
    pub(crate) fn inclusive(&mut self, hash: RevisionHash) -> &HashSet<RevisionHash> {
        let tree = self.tree;
        self.inclusive
            .entry(hash)
            .or_insert_with(|| walk(tree, [hash]))
    }

    /// Lowest common ancestors of `heads`: common ancestors that are not a
    /// strict ancestor of another common ancestor
    pub(crate) fn merge_bases(&mut self, heads: &BTreeSet<RevisionHash>) -> BTreeSet<RevisionHash> {
        let mut iter = heads.iter();
        let Some(first) = iter.next() else {
            return BTreeSet::new();
        };
        let mut common = self.inclusive(*first).clone();
        for head in iter {
            if common.is_empty() {
                break;
            }
            let ancestors = self.inclusive(*head);
            common.retain(|h| ancestors.contains(h));
        }
        if common.is_empty() {
            return BTreeSet::new();
        }

        let dominated = walk(
            self.tree,
            common
                .iter()
                .filter_map(|h| self.tree.get(h))
                .flat_map(|r| r.parents.iter().copied()),
        );
        common
            .into_iter()
            .filter(|h| !dominated.contains(h))
            .collect()
    }

    /// Base used for merging `heads`. With several merge bases (criss-cross)
    /// the one reached first by a breadth-first walk from the heads, in hash
    /// order, is selected.
    pub(crate) fn best_base(&mut self, heads: &BTreeSet<RevisionHash>) -> Option<RevisionHash> {
        let bases = self.merge_bases(heads);
        if bases.len() <= 1 {
            return bases.into_iter().next();
        }

        let mut queue: VecDeque<RevisionHash> = heads.iter().copied().collect();
        let mut seen: HashSet<RevisionHash> = heads.iter().copied().collect();
        while let Some(hash) = queue.pop_front() {
            if bases.contains(&hash) {
                return Some(hash);
            }
            if let Some(rev) = self.tree.get(&hash) {
                for parent in &rev.parents {
                    if self.tree.contains(parent) && seen.insert(*parent) {
                        queue.push_back(*parent);
                    }
                }
            }
        }
        bases.into_iter().next()
    }
}

/// Every present revision reachable from `starts`, including the starts
/// themselves when present
fn walk(
    tree: &RevisionTree,
    starts: impl IntoIterator<Item = RevisionHash>,
) -> HashSet<RevisionHash> {
    let mut seen = HashSet::new();
    let mut stack: Vec<RevisionHash> = starts.into_iter().collect();
    while let Some(hash) = stack.pop() {
        let Some(rev) = tree.get(&hash) else {
            continue;
        };
        if !seen.insert(hash) {
            continue;
        }
        stack.extend(rev.parents.iter().copied());
    }
    seen
}

/// Build the revision merging `heads`. Callers guarantee at least two heads.
pub(crate) fn merge_heads(tree: &RevisionTree, heads: &BTreeSet<RevisionHash>) -> Revision {
    let head_revs: Vec<&Revision> = heads.iter().filter_map(|h| tree.get(h)).collect();

    let mut ancestry = Ancestry::new(tree);
    let base = ancestry
        .best_base(heads)
        .and_then(|h| tree.get(&h))
        .map(|r| &r.metadata);

    let metadata = merge_metadata(base, &head_revs);
    let deleted = head_revs.iter().all(|r| r.deleted);
    Revision::new(tree.content(), heads.iter().copied(), metadata, deleted)
}

/// Reconcile head metadata against `base` (empty when the heads share no
/// ancestor). `heads` must be sorted by revision hash.
fn merge_metadata(base: Option<&Metadata>, heads: &[&Revision]) -> Metadata {
    let empty = Metadata::new();
    let base = base.unwrap_or(&empty);

    let keys: BTreeSet<&String> = base
        .keys()
        .chain(heads.iter().flat_map(|r| r.metadata.keys()))
        .collect();

    let mut merged = Metadata::new();
    for key in keys {
        let original = base.get(key);
        let changed: Vec<Option<&Value>> = heads
            .iter()
            .map(|r| r.metadata.get(key))
            .filter(|v| *v != original)
            .collect();

        // Heads are in ascending hash order, so the last change belongs to
        // the greatest revision hash.
        let value = match changed.split_last() {
            None => original,
            Some((last, _)) => *last,
        };
        if let Some(value) = value {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
