//! Cursor-driven event processing
//!
//! An agent replays the event log of one source repository through an
//! [`EventProcessor`], one event at a time, and persists the sequence number
//! of the last event processed. The driver owns polling, backoff and cursor
//! bookkeeping; the processor only decides what one event means.
//!
//! Loop, per iteration:
//!
//! 1. caught up (`cur_seq == max_seq`): refresh `max_seq`, and if still caught
//!    up wait in `Waiting` for a signal, the heartbeat, or stop;
//! 2. otherwise process event `cur_seq + 1`:
//!    - `Ok(true)`: persist `cur_seq + 1`
//!    - `Ok(false)`: `Paused` for the backoff interval, then retry the same event
//!    - `Err(_)`: `Error`, the task ends
//!
//! Stop is cooperative. The processor receives the [`StopSignal`] and is
//! expected to check it at its own safe points.

use crate::config::ReplicationConfig;
use crate::cursor::{CursorError, CursorStore};
use crate::error::RepositoryError;
use crate::event::Event;
use crate::repository::Repository;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Caught up, waiting for new events
    Waiting,
    Running,
    /// Backing off before retrying a deferred event
    Paused,
    Stopped,
    Error,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::Waiting => "WAITING",
            AgentState::Running => "RUNNING",
            AgentState::Paused => "PAUSED",
            AgentState::Stopped => "STOPPED",
            AgentState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Observable progress of an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub state: AgentState,
    /// Last event processed
    pub cur_seq: u64,
    /// Latest event known at the source
    pub max_seq: u64,
    /// Failure that moved the agent to `Error`
    pub error: Option<String>,
}

impl AgentInfo {
    fn initial() -> Self {
        Self {
            state: AgentState::Waiting,
            cur_seq: 0,
            max_seq: 0,
            error: None,
        }
    }

    /// Check if the agent's task has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, AgentState::Stopped | AgentState::Error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Cursor store error: {0}")]
    Cursor(#[from] CursorError),
}

/// Cooperative cancellation flag handed to processors
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Create a signal and the sender that trips it
    pub fn channel() -> (watch::Sender<bool>, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, StopSignal { rx })
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stop is requested. Never resolves if the sender is gone
    /// without having requested it.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Per-event hook run by an agent
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Handle `event`. `Ok(false)` defers it: the agent backs off and calls
    /// again with the same event.
    async fn process(&self, event: &Event, stop: &StopSignal) -> crate::error::Result<bool>;
}

/// Control handle of a running agent
pub struct AgentHandle {
    key: String,
    stop_tx: watch::Sender<bool>,
    notify: Arc<Notify>,
    info: Arc<watch::Sender<AgentInfo>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wake the agent so it re-checks the source for new events
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Request stop and wait for the task to end
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Agent {} task failed: {}", self.key, e);
                self.info.send_modify(|info| {
                    info.state = AgentState::Error;
                    info.error = Some(e.to_string());
                });
            }
        }
    }

    pub fn info(&self) -> AgentInfo {
        self.info.borrow().clone()
    }

    /// Receiver notified on every progress or state change
    pub fn subscribe(&self) -> watch::Receiver<AgentInfo> {
        self.info.subscribe()
    }

    /// Check if the agent's task is still running
    pub fn is_alive(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// Agent driver loop
pub struct Agent {
    key: String,
    source: Arc<dyn Repository>,
    processor: Arc<dyn EventProcessor>,
    cursors: Arc<dyn CursorStore>,
    page_size: usize,
    backoff: Duration,
    heartbeat: Duration,
    stop: StopSignal,
    notify: Arc<Notify>,
    info: Arc<watch::Sender<AgentInfo>>,
    pending: VecDeque<Event>,
    cur_seq: u64,
    max_seq: u64,
}

impl Agent {
    /// Start an agent on its own task. `key` names the persisted cursor.
    pub fn spawn(
        key: impl Into<String>,
        source: Arc<dyn Repository>,
        processor: Arc<dyn EventProcessor>,
        cursors: Arc<dyn CursorStore>,
        config: &ReplicationConfig,
    ) -> AgentHandle {
        let key = key.into();
        let (stop_tx, stop) = StopSignal::channel();
        let notify = Arc::new(Notify::new());
        let (info_tx, _) = watch::channel(AgentInfo::initial());
        let info = Arc::new(info_tx);

        let agent = Agent {
            key: key.clone(),
            source,
            processor,
            cursors,
            page_size: config.history_page_size.max(1),
            backoff: config.backoff_interval(),
            heartbeat: config.heartbeat_interval(),
            stop,
            notify: notify.clone(),
            info: info.clone(),
            pending: VecDeque::new(),
            cur_seq: 0,
            max_seq: 0,
        };
        let task = tokio::spawn(agent.run());

        AgentHandle {
            key,
            stop_tx,
            notify,
            info,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self) {
        info!("Agent {} started", self.key);
        match self.drive().await {
            Ok(()) => {
                info!("Agent {} stopped at seq {}", self.key, self.cur_seq);
                self.publish(AgentState::Stopped);
            }
            Err(e) => {
                error!("Agent {} failed at seq {}: {}", self.key, self.cur_seq, e);
                self.info.send_modify(|info| {
                    info.state = AgentState::Error;
                    info.error = Some(e.to_string());
                });
            }
        }
    }

    fn publish(&self, state: AgentState) {
        let (cur_seq, max_seq) = (self.cur_seq, self.max_seq);
        self.info.send_if_modified(|info| {
            let next = AgentInfo {
                state,
                cur_seq,
                max_seq,
                error: None,
            };
            if *info == next {
                return false;
            }
            *info = next;
            true
        });
    }

    async fn drive(&mut self) -> Result<(), AgentError> {
        self.cur_seq = self.cursors.get(&self.key)?.unwrap_or(0);
        self.max_seq = self.source.last_seq().await?;
        debug!(
            "Agent {} resuming at seq {} (source at {})",
            self.key, self.cur_seq, self.max_seq
        );

        while !self.stop.is_stopped() {
            if self.cur_seq >= self.max_seq {
                self.max_seq = self.source.last_seq().await?;
                if self.cur_seq >= self.max_seq {
                    self.publish(AgentState::Waiting);
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(self.heartbeat) => {}
                        _ = self.stop.stopped() => break,
                    }
                    self.max_seq = self.source.last_seq().await?;
                    continue;
                }
            }

            let Some(event) = self.next_event().await? else {
                // Log shorter than advertised; re-read the tail
                self.max_seq = self.source.last_seq().await?;
                continue;
            };

            self.publish(AgentState::Running);
            if self.processor.process(&event, &self.stop).await? {
                self.cursors.set(&self.key, event.seq)?;
                self.cur_seq = event.seq;
                self.pending.pop_front();
                self.max_seq = self.max_seq.max(self.cur_seq);
                self.publish(AgentState::Running);
            } else {
                if self.stop.is_stopped() {
                    break;
                }
                debug!(
                    "Agent {} deferred seq {}, retrying in {:?}",
                    self.key, event.seq, self.backoff
                );
                self.publish(AgentState::Paused);
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => {}
                    _ = self.stop.stopped() => break,
                }
            }
        }
        Ok(())
    }

    /// Event `cur_seq + 1`, fetching a page when the buffer runs dry
    async fn next_event(&mut self) -> Result<Option<Event>, AgentError> {
        let wanted = self.cur_seq + 1;
        while self.pending.front().is_some_and(|e| e.seq < wanted) {
            self.pending.pop_front();
        }
        if self.pending.front().is_none_or(|e| e.seq != wanted) {
            self.pending = self
                .source
                .history(true, Some(wanted), self.page_size)
                .await?
                .into_iter()
                .filter(|e| e.seq >= wanted)
                .collect();
        }
        Ok(self.pending.front().filter(|e| e.seq == wanted).cloned())
    }
}
