//! Replication of one source repository into one destination
//!
//! For each source event the agent copies the content bytes the destination
//! lacks, then folds the source revision tree into the destination.
//!
//! Transfers are chunked and resumable. A partial upload left by an earlier
//! attempt is kept only if its digest matches the same range at the source;
//! otherwise it is discarded and the copy restarts from offset 0.

use crate::agent::{EventProcessor, StopSignal};
use crate::content::ContentState;
use crate::error::{RepositoryError, Result};
use crate::event::Event;
use crate::hash::ContentHash;
use crate::repository::Repository;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Statistics of one content transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes written to the destination
    pub bytes: u64,
    pub chunks: u64,
    /// Bytes of an earlier partial upload that were kept
    pub resumed_from: u64,
    /// Partial uploads discarded after a digest mismatch
    pub restarts: u64,
    /// Time spent in milliseconds
    pub duration_ms: u64,
}

impl TransferStats {
    /// Throughput in bytes per second
    pub fn throughput_bps(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        (self.bytes as f64 / self.duration_ms as f64) * 1000.0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} in {} chunks (resumed from {}, {} restarts), {}ms, {}/s",
            format_size(self.bytes),
            self.chunks,
            format_size(self.resumed_from),
            self.restarts,
            self.duration_ms,
            format_size(self.throughput_bps() as u64),
        )
    }
}

/// Format bytes as human-readable size
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// How a transfer ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Complete,
    Aborted,
}

/// Event processor copying a source repository into a destination
pub struct ReplicationAgent {
    source: Arc<dyn Repository>,
    destination: Arc<dyn Repository>,
    chunk_size: u64,
}

impl ReplicationAgent {
    pub fn new(
        source: Arc<dyn Repository>,
        destination: Arc<dyn Repository>,
        chunk_size: u64,
    ) -> Self {
        Self {
            source,
            destination,
            chunk_size: chunk_size.max(1),
        }
    }

    fn name(&self) -> String {
        format!("{}->{}", self.source.id(), self.destination.id())
    }

    /// Copy `content` into a staging session at the destination. The session
    /// is released on every exit path.
    async fn transfer(
        &self,
        content: &ContentHash,
        total: u64,
        stop: &StopSignal,
    ) -> Result<Transfer> {
        let staging = match self.destination.stage_content(content).await {
            Ok(staging) => staging,
            Err(RepositoryError::AlreadyPresent(_)) => {
                debug!(
                    "[{}] {} arrived at the destination before staging",
                    self.name(),
                    content.short()
                );
                return Ok(Transfer::Complete);
            }
            Err(e) => return Err(e),
        };
        let session = staging.session_id;
        let mut stats = TransferStats::default();
        let start = Instant::now();

        let outcome = self
            .copy(content, &session, staging.length, total, stop, &mut stats)
            .await;

        match self.destination.unstage_content(content, &session).await {
            Ok(()) | Err(RepositoryError::UnknownSession { .. }) => {}
            Err(e) if matches!(outcome, Ok(Transfer::Complete)) => return Err(e),
            Err(e) => warn!(
                "[{}] Failed to release staging session for {}: {}",
                self.name(),
                content.short(),
                e
            ),
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        if let Ok(result) = &outcome {
            debug!(
                "[{}] {:?} transfer of {}: {}",
                self.name(),
                result,
                content.short(),
                stats.summary()
            );
        }
        outcome
    }

    async fn copy(
        &self,
        content: &ContentHash,
        session: &str,
        staged: u64,
        total: u64,
        stop: &StopSignal,
        stats: &mut TransferStats,
    ) -> Result<Transfer> {
        let mut offset = staged;
        if offset > 0 && !self.partial_matches(content, offset, total).await? {
            warn!(
                "[{}] Discarding {} staged bytes of {}: digest mismatch",
                self.name(),
                offset,
                content.short()
            );
            self.destination
                .write_content(content, session, Bytes::new(), 0)
                .await?;
            offset = 0;
            stats.restarts += 1;
        }
        stats.resumed_from = offset;

        while offset < total {
            if stop.is_stopped() {
                info!(
                    "[{}] Transfer of {} interrupted at {}/{}",
                    self.name(),
                    content.short(),
                    offset,
                    total
                );
                return Ok(Transfer::Aborted);
            }
            let length = self.chunk_size.min(total - offset);
            let chunk = self.source.get_content(content, offset, length).await?;
            let written = chunk.len() as u64;
            let staging = self
                .destination
                .write_content(content, session, chunk, offset)
                .await?;
            stats.bytes += written;
            stats.chunks += 1;
            offset = staging.length;
        }
        Ok(Transfer::Complete)
    }

    /// Check if the destination's first `length` staged bytes equal the
    /// source's
    async fn partial_matches(&self, content: &ContentHash, length: u64, total: u64) -> Result<bool> {
        if length > total {
            return Ok(false);
        }
        let ours = self.destination.get_digest(content, 0, length).await?;
        let theirs = self.source.get_digest(content, 0, length).await?;
        Ok(ours == theirs)
    }
}

#[async_trait]
impl EventProcessor for ReplicationAgent {
    async fn process(&self, event: &Event, stop: &StopSignal) -> Result<bool> {
        let content = event.content;
        let tree = self.source.get_tree(&content).await?;

        if !tree.is_deleted() {
            let info = self.destination.get_content_info(&content).await?;
            if !info.is_available() {
                if info.state == ContentState::Staging {
                    debug!(
                        "[{}] {} is being staged elsewhere, deferring seq {}",
                        self.name(),
                        content.short(),
                        event.seq
                    );
                    return Ok(false);
                }
                match self.transfer(&content, tree.length(), stop).await {
                    Ok(Transfer::Complete) => {}
                    Ok(Transfer::Aborted) => return Ok(false),
                    Err(RepositoryError::StagingInProgress(_)) => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
        }

        let result = self.destination.merge_tree(tree).await?;
        debug!(
            "[{}] seq {}: {} {}",
            self.name(),
            event.seq,
            result.operation,
            content.short()
        );
        Ok(true)
    }
}
