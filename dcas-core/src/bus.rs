//! Repository availability and activity notifications
//!
//! The bus is an explicit object handed to whoever consumes it; there is no
//! process-wide instance.

use tokio::sync::broadcast;
use tracing::trace;

/// Default number of messages a slow subscriber may fall behind
pub const DEFAULT_CAPACITY: usize = 256;

/// Notification about a repository, identified by its id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryMessage {
    RepositoryAvailable(String),
    RepositoryUnavailable(String),
    RepositoryRemoved(String),
    /// The repository appended to its event log
    NewRepositoryEvent(String),
}

impl RepositoryMessage {
    pub fn repository(&self) -> &str {
        match self {
            Self::RepositoryAvailable(id)
            | Self::RepositoryUnavailable(id)
            | Self::RepositoryRemoved(id)
            | Self::NewRepositoryEvent(id) => id,
        }
    }
}

/// Publish/subscribe channel for [`RepositoryMessage`]s
#[derive(Debug, Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<RepositoryMessage>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `message` to current subscribers. Returns how many received it.
    pub fn publish(&self, message: RepositoryMessage) -> usize {
        trace!("Publishing {:?}", message);
        self.sender.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
