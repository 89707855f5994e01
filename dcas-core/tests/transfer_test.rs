//! Resumable transfer tests
//!
//! These tests validate:
//! - Stopping an agent mid-transfer and restarting it resumes the upload
//! - A write failure puts the agent in error; a restart finishes the upload
//! - A corrupted partial upload is discarded and replaced
//! - A foreign staging session defers, but never skips, an event
//! - Content landing from another writer right before staging is merged
//! - A failed session release during a stop does not turn into an error

#[macro_use]
mod common;

use bytes::Bytes;
use common::{fast_config, init_tracing, payload, wait_for, InstrumentedRepository};
use dcas_core::{
    metadata, Agent, AgentHandle, AgentState, ContentHash, ContentState, CursorStore,
    EventProcessor, MemoryCursorStore, MemoryRepository, ReplicationAgent, ReplicationConfig,
    Repository, StopSignal,
};
use std::sync::Arc;
use std::time::Duration;

const KEY: &str = "replication:source->destination";

fn spawn(
    source: &Arc<MemoryRepository>,
    destination: Arc<dyn Repository>,
    cursors: &Arc<MemoryCursorStore>,
    config: &ReplicationConfig,
) -> AgentHandle {
    let processor = ReplicationAgent::new(source.clone(), destination, config.chunk_size);
    Agent::spawn(
        KEY,
        source.clone(),
        Arc::new(processor),
        cursors.clone(),
        config,
    )
}

async fn source_with(data: &Bytes) -> Arc<MemoryRepository> {
    let source = Arc::new(MemoryRepository::new("source"));
    source
        .put(data.clone(), metadata([("name", "blob")]))
        .await
        .unwrap();
    source
}

#[tokio::test]
async fn test_stop_and_restart_resumes_upload() {
    init_tracing();
    let data = payload(3, 64);
    let content = ContentHash::from_data(&data);
    let source = source_with(&data).await;
    let inner = Arc::new(MemoryRepository::new("destination"));
    let destination = Arc::new(InstrumentedRepository::new(
        inner.clone(),
        Duration::from_millis(20),
    ));
    let cursors = Arc::new(MemoryCursorStore::new());
    let config = fast_config();

    let handle = spawn(&source, destination.clone(), &cursors, &config);
    eventually!(inner.get_content_info(&content).await.unwrap().length >= 12);
    handle.stop().await;

    assert_eq!(handle.info().state, AgentState::Stopped);
    assert_eq!(cursors.get(KEY).unwrap(), None);
    let partial = inner.get_content_info(&content).await.unwrap();
    assert_eq!(partial.state, ContentState::Absent);
    assert!(partial.length >= 12 && partial.length < 64);
    assert!(inner.get_tree(&content).await.is_err());

    let handle = spawn(&source, destination.clone(), &cursors, &config);
    wait_for(&handle, |i| i.cur_seq == 1).await;
    handle.stop().await;

    assert_eq!(inner.read_all(&content).await.unwrap(), data);
    assert_eq!(
        inner.get_digest(&content, 0, 64).await.unwrap(),
        source.get_digest(&content, 0, 64).await.unwrap()
    );
    // Every byte crossed the wire exactly once
    assert_eq!(destination.written(), 64);
    assert_eq!(cursors.get(KEY).unwrap(), Some(1));
}

#[tokio::test]
async fn test_write_failure_is_fatal_until_restarted() {
    init_tracing();
    let data = payload(5, 40);
    let content = ContentHash::from_data(&data);
    let source = source_with(&data).await;
    let inner = Arc::new(MemoryRepository::new("destination"));
    let destination = Arc::new(InstrumentedRepository::new(inner.clone(), Duration::ZERO));
    destination.fail_after(5);
    let cursors = Arc::new(MemoryCursorStore::new());
    let config = fast_config();

    let handle = spawn(&source, destination.clone(), &cursors, &config);
    let info = wait_for(&handle, |i| i.is_terminal()).await;
    assert_eq!(info.state, AgentState::Error);
    assert!(info.error.unwrap().contains("disk unplugged"));
    assert_eq!(info.cur_seq, 0);

    // The session was released despite the failure
    let partial = inner.get_content_info(&content).await.unwrap();
    assert_eq!(partial.state, ContentState::Absent);
    assert_eq!(partial.length, 20);

    destination.fail_after(u64::MAX);
    let handle = spawn(&source, destination.clone(), &cursors, &config);
    wait_for(&handle, |i| i.cur_seq == 1).await;
    handle.stop().await;

    assert_eq!(inner.read_all(&content).await.unwrap(), data);
    assert_eq!(destination.written(), 40);
}

#[tokio::test]
async fn test_corrupted_partial_is_replaced() {
    init_tracing();
    let data = payload(7, 24);
    let content = ContentHash::from_data(&data);
    let source = source_with(&data).await;
    let inner = Arc::new(MemoryRepository::new("destination"));

    let sid = inner.stage_content(&content).await.unwrap().session_id;
    inner
        .write_content(&content, &sid, Bytes::from_static(b"garbage!"), 0)
        .await
        .unwrap();
    inner.unstage_content(&content, &sid).await.unwrap();

    let destination = Arc::new(InstrumentedRepository::new(inner.clone(), Duration::ZERO));
    let cursors = Arc::new(MemoryCursorStore::new());
    let handle = spawn(&source, destination.clone(), &cursors, &fast_config());
    wait_for(&handle, |i| i.cur_seq == 1).await;
    handle.stop().await;

    assert_eq!(inner.read_all(&content).await.unwrap(), data);
    assert_eq!(destination.written(), 24);
    assert_eq!(
        inner.get_tree(&content).await.unwrap(),
        source.get_tree(&content).await.unwrap()
    );
}

#[tokio::test]
async fn test_foreign_staging_defers_without_skipping() {
    init_tracing();
    let first = payload(1, 16);
    let second = payload(2, 16);
    let (c1, c2) = (ContentHash::from_data(&first), ContentHash::from_data(&second));
    let source = source_with(&first).await;
    source.put(second, metadata([("name", "next")])).await.unwrap();

    let destination = Arc::new(MemoryRepository::new("destination"));
    let foreign = destination.stage_content(&c1).await.unwrap();
    let cursors = Arc::new(MemoryCursorStore::new());
    let handle = spawn(&source, destination.clone(), &cursors, &fast_config());

    let info = wait_for(&handle, |i| i.state == AgentState::Paused).await;
    assert_eq!(info.cur_seq, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.info().cur_seq, 0);
    assert!(destination.get_tree(&c2).await.is_err());

    destination
        .unstage_content(&c1, &foreign.session_id)
        .await
        .unwrap();
    wait_for(&handle, |i| i.cur_seq == 2).await;
    handle.stop().await;

    assert!(destination.read_all(&c1).await.is_some());
    assert!(destination.read_all(&c2).await.is_some());
}

#[tokio::test]
async fn test_abandoned_session_expires() {
    init_tracing();
    let data = payload(4, 10);
    let content = ContentHash::from_data(&data);
    let source = source_with(&data).await;
    let destination = Arc::new(MemoryRepository::with_staging_timeout(
        "destination",
        Duration::from_millis(100),
    ));
    destination.stage_content(&content).await.unwrap();

    let cursors = Arc::new(MemoryCursorStore::new());
    let handle = spawn(&source, destination.clone(), &cursors, &fast_config());
    wait_for(&handle, |i| i.cur_seq == 1).await;
    handle.stop().await;

    assert_eq!(destination.read_all(&content).await.unwrap(), data);
}

#[tokio::test]
async fn test_content_landing_before_staging_is_merged() {
    init_tracing();
    let data = payload(6, 18);
    let content = ContentHash::from_data(&data);
    let source = source_with(&data).await;
    let inner = Arc::new(MemoryRepository::new("destination"));
    let destination = Arc::new(InstrumentedRepository::new(inner.clone(), Duration::ZERO));
    destination.land_before_stage(data.clone(), metadata([("name", "elsewhere")]));

    let agent = ReplicationAgent::new(source.clone(), destination.clone(), 4);
    let (_tx, stop) = StopSignal::channel();
    let event = source.history(true, None, 1).await.unwrap().remove(0);
    assert_eq!(
        inner.get_content_info(&content).await.unwrap().state,
        ContentState::Absent
    );
    assert!(agent.process(&event, &stop).await.unwrap());

    // No byte was copied; the source's revision joined the landed one
    assert_eq!(destination.written(), 0);
    assert_eq!(inner.read_all(&content).await.unwrap(), data);
    let tree = inner.get_tree(&content).await.unwrap();
    let source_head = source.get_tree(&content).await.unwrap().head();
    assert!(source_head.iter().all(|h| tree.get(h).is_some()));
    assert_eq!(tree.head().len(), 1);
}

#[tokio::test]
async fn test_agent_survives_content_landing_before_staging() {
    init_tracing();
    let data = payload(8, 12);
    let content = ContentHash::from_data(&data);
    let source = source_with(&data).await;
    let inner = Arc::new(MemoryRepository::new("destination"));
    let destination = Arc::new(InstrumentedRepository::new(inner.clone(), Duration::ZERO));
    destination.land_before_stage(data.clone(), metadata([("name", "elsewhere")]));
    let cursors = Arc::new(MemoryCursorStore::new());

    let handle = spawn(&source, destination.clone(), &cursors, &fast_config());
    let info = wait_for(&handle, |i| i.cur_seq == 1 || i.is_terminal()).await;
    assert_eq!(info.cur_seq, 1);
    assert_eq!(info.error, None);
    handle.stop().await;
    assert_eq!(handle.info().state, AgentState::Stopped);
    assert!(inner.get_tree(&content).await.is_ok());
}

#[tokio::test]
async fn test_release_failure_after_stop_is_not_an_error() {
    init_tracing();
    let data = payload(9, 16);
    let content = ContentHash::from_data(&data);
    let source = source_with(&data).await;
    let inner = Arc::new(MemoryRepository::new("destination"));
    let destination = Arc::new(InstrumentedRepository::new(inner.clone(), Duration::ZERO));
    destination.fail_unstage(true);

    let agent = ReplicationAgent::new(source.clone(), destination.clone(), 4);
    let (tx, stop) = StopSignal::channel();
    tx.send_replace(true);
    let event = source.history(true, None, 1).await.unwrap().remove(0);
    assert!(!agent.process(&event, &stop).await.unwrap());
    assert!(inner.get_tree(&content).await.is_err());

    // A completed copy still reports the release failure
    let (_tx, running) = StopSignal::channel();
    let inner = Arc::new(MemoryRepository::new("other"));
    let destination = Arc::new(InstrumentedRepository::new(inner, Duration::ZERO));
    destination.fail_unstage(true);
    let agent = ReplicationAgent::new(source.clone(), destination, 4);
    assert!(agent.process(&event, &running).await.is_err());
}
