//! In-memory repository
//!
//! Complete implementation of the [`Repository`] contract held in memory.
//! Used by tests and as the reference for the semantics other backends must
//! follow.

use crate::command::{CommandResult, Operation};
use crate::config::ReplicationConfig;
use crate::content::{ContentInfo, ContentState, StagingInfo};
use crate::error::{RepositoryError, Result};
use crate::event::Event;
use crate::hash::ContentHash;
use crate::repository::Repository;
use crate::revision::Revision;
use crate::tree::RevisionTree;
use crate::value::Metadata;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Idle time after which a staging session is dropped
pub const DEFAULT_STAGING_TIMEOUT: Duration = Duration::from_secs(600);

struct Session {
    id: String,
    touched: Instant,
}

#[derive(Default)]
struct StagingArea {
    data: Vec<u8>,
    session: Option<Session>,
}

impl StagingArea {
    fn live_session(&self, timeout: Duration) -> Option<&Session> {
        self.session
            .as_ref()
            .filter(|s| s.touched.elapsed() < timeout)
    }

    fn info(&self, session_id: &str) -> StagingInfo {
        StagingInfo {
            session_id: session_id.to_string(),
            length: self.data.len() as u64,
            hash: ContentHash::from_data(&self.data),
        }
    }
}

#[derive(Default)]
struct State {
    trees: HashMap<ContentHash, RevisionTree>,
    contents: HashMap<ContentHash, Bytes>,
    staging: HashMap<ContentHash, StagingArea>,
    events: Vec<Event>,
}

impl State {
    /// Staged bytes that form the complete content, with no session open
    fn is_staged(&self, content: &ContentHash, timeout: Duration) -> bool {
        self.staging.get(content).is_some_and(|area| {
            area.live_session(timeout).is_none() && ContentHash::from_data(&area.data) == *content
        })
    }

    fn promote_staged(&mut self, content: &ContentHash, timeout: Duration) {
        if self.is_staged(content, timeout) {
            if let Some(area) = self.staging.remove(content) {
                debug!("Promoting staged content {}", content.short());
                self.contents.insert(*content, Bytes::from(area.data));
            }
        }
    }

    fn append_event(&mut self, content: ContentHash, operation: Operation) -> u64 {
        let seq = self.events.len() as u64 + 1;
        self.events.push(Event {
            seq,
            content,
            timestamp: chrono::Utc::now(),
            operation,
        });
        seq
    }

    /// Union `incoming` into the stored tree, merge concurrent heads and
    /// record the change
    fn fold_tree(&mut self, incoming: &RevisionTree, timeout: Duration) -> Result<CommandResult> {
        let content = incoming.content();
        let before = self.trees.get(&content);
        let mut current = before
            .cloned()
            .unwrap_or_else(|| RevisionTree::new(content, incoming.length()));

        if current.absorb(incoming)? == 0 {
            return Ok(CommandResult::no_op(current.head()));
        }
        current.merge();

        if !current.is_deleted() {
            self.promote_staged(&content, timeout);
            if !self.contents.contains_key(&content) {
                return Err(RepositoryError::ContentNotPresent(content));
            }
        }

        let operation = Operation::between(self.trees.get(&content), &current);
        let head = current.head();
        self.trees.insert(content, current);
        let seq = self.append_event(content, operation);
        debug!("Event {}: {} {}", seq, operation, content.short());

        Ok(CommandResult {
            operation,
            head,
            seq: Some(seq),
        })
    }

    fn read_range(
        &self,
        content: &ContentHash,
        data: &[u8],
        offset: u64,
        length: u64,
    ) -> Result<std::ops::Range<usize>> {
        let available = data.len() as u64;
        match offset.checked_add(length) {
            Some(end) if end <= available => Ok(offset as usize..end as usize),
            _ => Err(RepositoryError::InvalidRange {
                content: *content,
                offset,
                length,
                available,
            }),
        }
    }
}

/// Repository held entirely in memory
pub struct MemoryRepository {
    id: String,
    open: AtomicBool,
    staging_timeout: Duration,
    state: Mutex<State>,
}

impl MemoryRepository {
    /// Create an empty, open repository
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_staging_timeout(id, DEFAULT_STAGING_TIMEOUT)
    }

    /// Create a repository whose staging sessions expire after the
    /// configured `staging_timeout_secs`
    pub fn with_config(id: impl Into<String>, config: &ReplicationConfig) -> Self {
        Self::with_staging_timeout(id, config.staging_timeout())
    }

    pub fn with_staging_timeout(id: impl Into<String>, staging_timeout: Duration) -> Self {
        Self {
            id: id.into(),
            open: AtomicBool::new(true),
            staging_timeout,
            state: Mutex::new(State::default()),
        }
    }

    /// Reject every call until [`open`](Self::open) is called again
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RepositoryError::RepositoryClosed(self.id.clone()))
        }
    }

    /// Store `data` and record a revision of it: a new root, or a child of
    /// the current head when the content is already known
    pub async fn put(&self, data: Bytes, metadata: Metadata) -> Result<CommandResult> {
        self.check_open()?;
        let content = ContentHash::from_data(&data);
        let mut state = self.state.lock().await;
        let length = data.len() as u64;
        state.contents.entry(content).or_insert(data);

        let revision = match state.trees.get(&content) {
            Some(tree) => tree.child(metadata, false),
            None => Revision::root(content, metadata),
        };
        let incoming = RevisionTree::from_revisions(content, length, [revision])?;
        state.fold_tree(&incoming, self.staging_timeout)
    }

    /// Record a new metadata version succeeding the current head
    pub async fn update(&self, content: &ContentHash, metadata: Metadata) -> Result<CommandResult> {
        let tree = self.get_tree(content).await?;
        self.add_revision(tree.child(metadata, false)).await
    }

    /// Record a tombstone succeeding the current head
    pub async fn delete(&self, content: &ContentHash) -> Result<CommandResult> {
        let tree = self.get_tree(content).await?;
        let metadata = tree
            .head_revisions()
            .first()
            .map(|r| r.metadata.clone())
            .unwrap_or_default();
        self.add_revision(tree.child(metadata, true)).await
    }

    /// Whole content bytes, if present
    pub async fn read_all(&self, content: &ContentHash) -> Option<Bytes> {
        self.state.lock().await.contents.get(content).cloned()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn get_tree(&self, content: &ContentHash) -> Result<RevisionTree> {
        self.check_open()?;
        let state = self.state.lock().await;
        state
            .trees
            .get(content)
            .cloned()
            .ok_or(RepositoryError::UnknownContent(*content))
    }

    async fn merge_tree(&self, tree: RevisionTree) -> Result<CommandResult> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        state.fold_tree(&tree, self.staging_timeout)
    }

    async fn add_revision(&self, revision: Revision) -> Result<CommandResult> {
        self.check_open()?;
        let content = revision.content;
        let mut state = self.state.lock().await;

        let length = if let Some(data) = state.contents.get(&content) {
            data.len() as u64
        } else if state.is_staged(&content, self.staging_timeout) {
            state.staging.get(&content).map_or(0, |a| a.data.len() as u64)
        } else if let Some(tree) = state.trees.get(&content) {
            tree.length()
        } else {
            0
        };

        let incoming = RevisionTree::from_revisions(content, length, [revision])?;
        state.fold_tree(&incoming, self.staging_timeout)
    }

    async fn get_content_info(&self, content: &ContentHash) -> Result<ContentInfo> {
        self.check_open()?;
        let state = self.state.lock().await;
        if let Some(data) = state.contents.get(content) {
            return Ok(ContentInfo {
                state: ContentState::Present,
                length: data.len() as u64,
            });
        }
        let Some(area) = state.staging.get(content) else {
            return Ok(ContentInfo::absent());
        };
        let length = area.data.len() as u64;
        let state = if area.live_session(self.staging_timeout).is_some() {
            ContentState::Staging
        } else if ContentHash::from_data(&area.data) == *content {
            ContentState::Staged
        } else {
            ContentState::Absent
        };
        Ok(ContentInfo { state, length })
    }

    async fn stage_content(&self, content: &ContentHash) -> Result<StagingInfo> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        if state.contents.contains_key(content) {
            return Err(RepositoryError::AlreadyPresent(*content));
        }
        let area = state.staging.entry(*content).or_default();
        if area.live_session(self.staging_timeout).is_some() {
            return Err(RepositoryError::StagingInProgress(*content));
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        area.session = Some(Session {
            id: session_id.clone(),
            touched: Instant::now(),
        });
        debug!(
            "Staging {} (session {}, {} bytes kept)",
            content.short(),
            session_id,
            area.data.len()
        );
        Ok(area.info(&session_id))
    }

    async fn write_content(
        &self,
        content: &ContentHash,
        session_id: &str,
        bytes: Bytes,
        position: u64,
    ) -> Result<StagingInfo> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        let timeout = self.staging_timeout;
        let area = state
            .staging
            .get_mut(content)
            .filter(|a| a.live_session(timeout).is_some_and(|s| s.id == session_id))
            .ok_or_else(|| RepositoryError::UnknownSession {
                content: *content,
                session_id: session_id.to_string(),
            })?;

        let available = area.data.len() as u64;
        if position > available {
            return Err(RepositoryError::InvalidRange {
                content: *content,
                offset: position,
                length: bytes.len() as u64,
                available,
            });
        }
        area.data.truncate(position as usize);
        area.data.extend_from_slice(&bytes);
        if let Some(session) = area.session.as_mut() {
            session.touched = Instant::now();
        }
        Ok(area.info(session_id))
    }

    async fn unstage_content(&self, content: &ContentHash, session_id: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        let timeout = self.staging_timeout;
        let Some(area) = state
            .staging
            .get_mut(content)
            .filter(|a| a.live_session(timeout).is_some_and(|s| s.id == session_id))
        else {
            return Err(RepositoryError::UnknownSession {
                content: *content,
                session_id: session_id.to_string(),
            });
        };
        area.session = None;
        Ok(())
    }

    async fn get_digest(
        &self,
        content: &ContentHash,
        offset: u64,
        length: u64,
    ) -> Result<ContentHash> {
        self.check_open()?;
        let state = self.state.lock().await;
        let data: &[u8] = match state.contents.get(content) {
            Some(bytes) => bytes.as_ref(),
            None => match state.staging.get(content) {
                Some(area) => area.data.as_slice(),
                None => return Err(RepositoryError::UnknownContent(*content)),
            },
        };
        let range = state.read_range(content, data, offset, length)?;
        Ok(ContentHash::from_data(&data[range]))
    }

    async fn get_content(&self, content: &ContentHash, offset: u64, length: u64) -> Result<Bytes> {
        self.check_open()?;
        let state = self.state.lock().await;
        let data = state
            .contents
            .get(content)
            .ok_or(RepositoryError::ContentNotPresent(*content))?;
        let range = state.read_range(content, data, offset, length)?;
        Ok(data.slice(range))
    }

    async fn history(
        &self,
        ascending: bool,
        from_seq: Option<u64>,
        size: usize,
    ) -> Result<Vec<Event>> {
        self.check_open()?;
        let state = self.state.lock().await;
        let events = &state.events;
        if size == 0 || events.is_empty() {
            return Ok(Vec::new());
        }

        // seq n lives at index n - 1
        let page = if ascending {
            let start = from_seq.unwrap_or(1).max(1) as usize - 1;
            events.iter().skip(start).take(size).cloned().collect()
        } else {
            let last = events.len() as u64;
            let start = from_seq.unwrap_or(last).min(last);
            if start == 0 {
                return Ok(Vec::new());
            }
            events[..start as usize]
                .iter()
                .rev()
                .take(size)
                .cloned()
                .collect()
        };
        Ok(page)
    }
}
