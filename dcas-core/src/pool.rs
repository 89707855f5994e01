//! Replication agents pool
//!
//! Maps each replication definition to at most one running agent. The pool
//! reacts to repository availability messages from a [`MessageBus`]: agents
//! are started when both ends become reachable, stopped when one goes away
//! and woken when their source reports new events.

use crate::agent::{Agent, AgentHandle, AgentInfo};
use crate::bus::{MessageBus, RepositoryMessage};
use crate::config::ReplicationConfig;
use crate::cursor::{CursorError, CursorStore};
use crate::error::RepositoryError;
use crate::replication::ReplicationAgent;
use crate::repository::RepositoryResolver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A one-way replication link
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationDef {
    pub source: String,
    pub destination: String,
}

impl ReplicationDef {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Replication id, `"<source>-><destination>"`
    pub fn id(&self) -> String {
        format!("{}->{}", self.source, self.destination)
    }

    /// Key of the persisted cursor
    pub fn cursor_key(&self) -> String {
        format!("replication:{}", self.id())
    }

    /// Check if `repository` is either end of the link
    pub fn involves(&self, repository: &str) -> bool {
        self.source == repository || self.destination == repository
    }
}

impl std::fmt::Display for ReplicationDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.source, self.destination)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Unknown replication: {0}")]
    UnknownReplication(String),

    #[error("Replication {0} has the same source and destination")]
    SelfReplication(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Cursor store error: {0}")]
    Cursor(#[from] CursorError),
}

pub type Result<T> = std::result::Result<T, PoolError>;

struct Slot {
    def: ReplicationDef,
    handle: Option<Arc<AgentHandle>>,
}

/// Registry of replication agents, one per replication id
pub struct ReplicationAgentsPool {
    resolver: Arc<dyn RepositoryResolver>,
    cursors: Arc<dyn CursorStore>,
    config: ReplicationConfig,
    slots: Mutex<BTreeMap<String, Slot>>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl ReplicationAgentsPool {
    pub fn new(
        resolver: Arc<dyn RepositoryResolver>,
        cursors: Arc<dyn CursorStore>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            resolver,
            cursors,
            config,
            slots: Mutex::new(BTreeMap::new()),
            listener: StdMutex::new(None),
        }
    }

    /// Register a brand-new replication, forgetting any cursor left under its
    /// key, and start it if both ends are reachable. Returns whether an
    /// agent was started.
    pub async fn create_agent(&self, def: ReplicationDef) -> Result<bool> {
        if def.source == def.destination {
            return Err(PoolError::SelfReplication(def.id()));
        }
        let old = self
            .slots
            .lock()
            .await
            .insert(
                def.id(),
                Slot {
                    def: def.clone(),
                    handle: None,
                },
            )
            .and_then(|slot| slot.handle);
        if let Some(handle) = old {
            handle.stop().await;
        }
        self.cursors.delete(&def.cursor_key())?;
        info!("Created replication {}", def);
        self.try_start_agent(&def).await
    }

    /// Start the agent for `def` unless one is already running. Fails if
    /// either end cannot be resolved.
    pub async fn start_agent(&self, def: &ReplicationDef) -> Result<()> {
        if def.source == def.destination {
            return Err(PoolError::SelfReplication(def.id()));
        }
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(def.id()).or_insert_with(|| Slot {
            def: def.clone(),
            handle: None,
        });
        if slot.handle.as_ref().is_some_and(|h| h.is_alive()) {
            debug!("Replication {} already running", def);
            return Ok(());
        }

        let source = self.resolver.resolve(&def.source)?;
        let destination = self.resolver.resolve(&def.destination)?;

        if let Some(old) = slot.handle.take() {
            old.stop().await;
        }
        let processor = ReplicationAgent::new(
            source.clone(),
            destination,
            self.config.chunk_size,
        );
        slot.handle = Some(Arc::new(Agent::spawn(
            def.cursor_key(),
            source,
            Arc::new(processor),
            self.cursors.clone(),
            &self.config,
        )));
        info!("Started replication {}", def);
        Ok(())
    }

    /// Like [`start_agent`](Self::start_agent), but an unknown, closed or
    /// unreachable repository only means "not started yet"
    pub async fn try_start_agent(&self, def: &ReplicationDef) -> Result<bool> {
        match self.start_agent(def).await {
            Ok(()) => Ok(true),
            Err(PoolError::Repository(e)) if e.is_unavailable() => {
                debug!("Replication {} not started: {}", def, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the agent of replication `id`, keeping its cursor
    pub async fn stop_agent(&self, id: &str) -> Result<()> {
        let handle = {
            let slots = self.slots.lock().await;
            let slot = slots
                .get(id)
                .ok_or_else(|| PoolError::UnknownReplication(id.to_string()))?;
            slot.handle.clone()
        };
        if let Some(handle) = handle {
            handle.stop().await;
            info!("Stopped replication {}", id);
        }
        Ok(())
    }

    /// Stop the agent of replication `id` and discard its cursor. The
    /// definition stays registered; a later start replays from the first
    /// event.
    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        let (handle, cursor_key) = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| PoolError::UnknownReplication(id.to_string()))?;
            (slot.handle.take(), slot.def.cursor_key())
        };
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.cursors.delete(&cursor_key)?;
        info!("Deleted agent of replication {}", id);
        Ok(())
    }

    /// Stop the agent, discard its cursor and forget the definition
    pub async fn remove_replication(&self, id: &str) -> Result<()> {
        self.delete_agent(id).await?;
        self.slots.lock().await.remove(id);
        Ok(())
    }

    /// Wake the agent of replication `id`. Returns false if it has none.
    pub async fn signal_agent(&self, id: &str) -> bool {
        let slots = self.slots.lock().await;
        match slots.get(id).and_then(|s| s.handle.as_ref()) {
            Some(handle) => {
                handle.signal();
                true
            }
            None => false,
        }
    }

    pub async fn try_get_agent_info(&self, id: &str) -> Option<AgentInfo> {
        let slots = self.slots.lock().await;
        slots
            .get(id)
            .and_then(|s| s.handle.as_ref())
            .map(|h| h.info())
    }

    /// Every registered replication with the info of its agent, if any
    pub async fn agents(&self) -> Vec<(ReplicationDef, Option<AgentInfo>)> {
        let slots = self.slots.lock().await;
        slots
            .values()
            .map(|s| (s.def.clone(), s.handle.as_ref().map(|h| h.info())))
            .collect()
    }

    async fn definitions(&self, pred: impl Fn(&ReplicationDef) -> bool) -> Vec<ReplicationDef> {
        let slots = self.slots.lock().await;
        slots
            .values()
            .map(|s| &s.def)
            .filter(|d| pred(d))
            .cloned()
            .collect()
    }

    /// React to one bus message
    pub async fn handle_message(&self, message: &RepositoryMessage) {
        debug!("Pool received {:?}", message);
        let repo = message.repository();
        match message {
            RepositoryMessage::RepositoryAvailable(_) => {
                for def in self.definitions(|d| d.involves(repo)).await {
                    if let Err(e) = self.try_start_agent(&def).await {
                        warn!("Failed to start replication {}: {}", def, e);
                    }
                }
            }
            RepositoryMessage::RepositoryUnavailable(_) => {
                for def in self.definitions(|d| d.involves(repo)).await {
                    if let Err(e) = self.stop_agent(&def.id()).await {
                        warn!("Failed to stop replication {}: {}", def, e);
                    }
                }
            }
            RepositoryMessage::RepositoryRemoved(_) => {
                for def in self.definitions(|d| d.involves(repo)).await {
                    if let Err(e) = self.delete_agent(&def.id()).await {
                        warn!("Failed to delete agent of {}: {}", def, e);
                    }
                }
            }
            RepositoryMessage::NewRepositoryEvent(_) => {
                for def in self.definitions(|d| d.source == repo).await {
                    self.signal_agent(&def.id()).await;
                }
            }
        }
    }

    async fn signal_all(&self) {
        let slots = self.slots.lock().await;
        for handle in slots.values().filter_map(|s| s.handle.as_ref()) {
            handle.signal();
        }
    }

    /// Subscribe to `bus` and react to its messages until [`shutdown`](Self::shutdown)
    pub fn start(self: &Arc<Self>, bus: &MessageBus) {
        let receiver = bus.subscribe();
        let pool = Arc::downgrade(self);
        let task = tokio::spawn(listen(pool, receiver));
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Replication pool listening");
    }

    /// Unsubscribe from the bus and stop every agent
    pub async fn shutdown(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.abort();
            let _ = listener.await;
        }
        let handles: Vec<Arc<AgentHandle>> = {
            let slots = self.slots.lock().await;
            slots.values().filter_map(|s| s.handle.clone()).collect()
        };
        for handle in handles {
            handle.stop().await;
        }
        info!("Replication pool shut down");
    }
}

async fn listen(pool: Weak<ReplicationAgentsPool>, mut receiver: broadcast::Receiver<RepositoryMessage>) {
    loop {
        let received = receiver.recv().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        match received {
            Ok(message) => pool.handle_message(&message).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Pool missed {} bus messages, waking every agent", missed);
                pool.signal_all().await;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
