//! Repository contract
//!
//! The replication engine drives repositories only through [`Repository`].
//! A local store and a remote proxy both implement it; the engine cannot
//! tell them apart.

use crate::command::CommandResult;
use crate::content::{ContentInfo, StagingInfo};
use crate::error::{RepositoryError, Result};
use crate::event::Event;
use crate::hash::ContentHash;
use crate::revision::Revision;
use crate::tree::RevisionTree;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Storage contract for one repository
#[async_trait]
pub trait Repository: Send + Sync {
    /// Repository identifier
    fn id(&self) -> &str;

    /// Check if the repository accepts calls
    fn is_open(&self) -> bool;

    /// Full revision tree of `content`
    async fn get_tree(&self, content: &ContentHash) -> Result<RevisionTree>;

    /// Fold a (possibly partial) tree into the stored one, merging concurrent
    /// heads. Appends an event unless nothing new was learnt.
    async fn merge_tree(&self, tree: RevisionTree) -> Result<CommandResult>;

    /// Add a locally authored revision. The content must be present or fully
    /// staged unless the revision is a deletion.
    async fn add_revision(&self, revision: Revision) -> Result<CommandResult>;

    async fn get_content_info(&self, content: &ContentHash) -> Result<ContentInfo>;

    /// Open a staging session. Bytes kept from an earlier session are
    /// reported through the returned length and hash.
    async fn stage_content(&self, content: &ContentHash) -> Result<StagingInfo>;

    /// Truncate the staged bytes to `position`, then append `bytes`
    async fn write_content(
        &self,
        content: &ContentHash,
        session_id: &str,
        bytes: Bytes,
        position: u64,
    ) -> Result<StagingInfo>;

    /// Close a staging session, keeping the staged bytes
    async fn unstage_content(&self, content: &ContentHash, session_id: &str) -> Result<()>;

    /// Digest of `[offset, offset + length)`, read from present content or
    /// else from staged bytes
    async fn get_digest(&self, content: &ContentHash, offset: u64, length: u64)
    -> Result<ContentHash>;

    async fn get_content(&self, content: &ContentHash, offset: u64, length: u64) -> Result<Bytes>;

    /// Page of the event log. Ascending pages start at `from_seq` (default
    /// the first event), descending pages at `from_seq` (default the last).
    async fn history(&self, ascending: bool, from_seq: Option<u64>, size: usize)
    -> Result<Vec<Event>>;

    /// Sequence number of the latest event, 0 when the log is empty
    async fn last_seq(&self) -> Result<u64> {
        let latest = self.history(false, None, 1).await?;
        Ok(latest.first().map(|e| e.seq).unwrap_or(0))
    }
}

/// Looks up repositories by id
pub trait RepositoryResolver: Send + Sync {
    fn resolve(&self, id: &str) -> Result<Arc<dyn Repository>>;
}

/// Repositories known to this node
#[derive(Default)]
pub struct RepositoryRegistry {
    repositories: RwLock<HashMap<String, Arc<dyn Repository>>>,
    unreachable: RwLock<HashSet<String>>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository under its own id
    pub fn register(&self, repo: Arc<dyn Repository>) -> std::result::Result<(), String> {
        let mut repos = self.repositories.write().unwrap_or_else(|e| e.into_inner());
        let id = repo.id().to_string();
        if repos.contains_key(&id) {
            return Err(format!("Repository '{}' already registered", id));
        }
        repos.insert(id, repo);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn Repository>> {
        self.repositories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// Mark the node hosting `id` as (un)reachable
    pub fn set_reachable(&self, id: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write().unwrap_or_else(|e| e.into_inner());
        if reachable {
            unreachable.remove(id);
        } else {
            unreachable.insert(id.to_string());
        }
    }

    /// List all repository ids
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .repositories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl RepositoryResolver for RepositoryRegistry {
    fn resolve(&self, id: &str) -> Result<Arc<dyn Repository>> {
        let repo = self
            .repositories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownRepository(id.to_string()))?;

        if self
            .unreachable
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
        {
            return Err(RepositoryError::UnreachableNode(id.to_string()));
        }
        if !repo.is_open() {
            return Err(RepositoryError::RepositoryClosed(id.to_string()));
        }
        Ok(repo)
    }
}
