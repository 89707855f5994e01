//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dcas_core::{
    AgentHandle, AgentInfo, CommandResult, ContentHash, ContentInfo, Event, MemoryRepository,
    Metadata, ReplicationConfig, Repository, RepositoryError, Result, Revision, RevisionTree,
    StagingInfo,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_config() -> ReplicationConfig {
    ReplicationConfig {
        chunk_size: 4,
        backoff_interval_ms: 10,
        heartbeat_interval_ms: 50,
        history_page_size: 3,
        ..Default::default()
    }
}

/// Wait until the agent's info satisfies `pred`
pub async fn wait_for(handle: &AgentHandle, pred: impl Fn(&AgentInfo) -> bool) -> AgentInfo {
    let mut rx = handle.subscribe();
    let info = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|i| pred(i)))
        .await
        .expect("agent did not reach the expected state")
        .expect("agent info channel closed")
        .clone();
    info
}

/// Poll a condition (which may `.await`) until it holds
macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while !($cond) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time: {}",
                stringify!($cond)
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

/// Deterministic payload of `len` bytes
pub fn payload(seed: u8, len: usize) -> Bytes {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
        .collect::<Vec<u8>>()
        .into()
}

/// Destination wrapper that slows writes down, counts written bytes, can
/// fail every write after a budget is spent and can let another writer land
/// content just before the next staging session opens
pub struct InstrumentedRepository {
    pub inner: Arc<MemoryRepository>,
    write_delay: Duration,
    pub written: AtomicU64,
    pub writes: AtomicU64,
    fail_after_writes: AtomicU64,
    land_before_stage: Mutex<Option<(Bytes, Metadata)>>,
    fail_unstage: AtomicBool,
}

impl InstrumentedRepository {
    pub fn new(inner: Arc<MemoryRepository>, write_delay: Duration) -> Self {
        Self {
            inner,
            write_delay,
            written: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fail_after_writes: AtomicU64::new(u64::MAX),
            land_before_stage: Mutex::new(None),
            fail_unstage: AtomicBool::new(false),
        }
    }

    /// Store `data` directly in the inner repository when the next
    /// `stage_content` call arrives, before serving it
    pub fn land_before_stage(&self, data: Bytes, metadata: Metadata) {
        *self.land_before_stage.lock().unwrap() = Some((data, metadata));
    }

    /// Fail every write after `n` successful ones
    pub fn fail_after(&self, n: u64) {
        self.fail_after_writes.store(n, Ordering::SeqCst);
    }

    /// Make every `unstage_content` call fail
    pub fn fail_unstage(&self, fail: bool) {
        self.fail_unstage.store(fail, Ordering::SeqCst);
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for InstrumentedRepository {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn get_tree(&self, content: &ContentHash) -> Result<RevisionTree> {
        self.inner.get_tree(content).await
    }

    async fn merge_tree(&self, tree: RevisionTree) -> Result<CommandResult> {
        self.inner.merge_tree(tree).await
    }

    async fn add_revision(&self, revision: Revision) -> Result<CommandResult> {
        self.inner.add_revision(revision).await
    }

    async fn get_content_info(&self, content: &ContentHash) -> Result<ContentInfo> {
        self.inner.get_content_info(content).await
    }

    async fn stage_content(&self, content: &ContentHash) -> Result<StagingInfo> {
        let landing = self.land_before_stage.lock().unwrap().take();
        if let Some((data, metadata)) = landing {
            self.inner.put(data, metadata).await?;
        }
        self.inner.stage_content(content).await
    }

    async fn write_content(
        &self,
        content: &ContentHash,
        session_id: &str,
        bytes: Bytes,
        position: u64,
    ) -> Result<StagingInfo> {
        let done = self.writes.fetch_add(1, Ordering::SeqCst);
        if done >= self.fail_after_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("disk unplugged".into()));
        }
        tokio::time::sleep(self.write_delay).await;
        self.written.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        self.inner
            .write_content(content, session_id, bytes, position)
            .await
    }

    async fn unstage_content(&self, content: &ContentHash, session_id: &str) -> Result<()> {
        if self.fail_unstage.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("unstage rejected".into()));
        }
        self.inner.unstage_content(content, session_id).await
    }

    async fn get_digest(
        &self,
        content: &ContentHash,
        offset: u64,
        length: u64,
    ) -> Result<ContentHash> {
        self.inner.get_digest(content, offset, length).await
    }

    async fn get_content(&self, content: &ContentHash, offset: u64, length: u64) -> Result<Bytes> {
        self.inner.get_content(content, offset, length).await
    }

    async fn history(
        &self,
        ascending: bool,
        from_seq: Option<u64>,
        size: usize,
    ) -> Result<Vec<Event>> {
        self.inner.history(ascending, from_seq, size).await
    }
}
