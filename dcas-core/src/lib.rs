//! dcas core library
//!
//! Replication core of a distributed content-addressable store. Content is
//! immutable and addressed by its SHA-256 hash; the metadata describing it
//! evolves as a DAG of revisions (a [`RevisionTree`]) that merges
//! deterministically, so repositories converge without coordination.
//!
//! A [`ReplicationAgentsPool`] runs one agent per replication link. Each
//! agent replays the source repository's event log, copies missing bytes in
//! resumable chunks and folds revision trees into the destination.

pub mod agent;
pub mod bus;
pub mod command;
pub mod config;
pub mod content;
pub mod cursor;
pub mod error;
pub mod event;
pub mod hash;
mod merge;
pub mod memory;
pub mod pool;
pub mod replication;
pub mod repository;
pub mod revision;
pub mod tree;
pub mod value;

pub use agent::{Agent, AgentError, AgentHandle, AgentInfo, AgentState, EventProcessor, StopSignal};
pub use bus::{MessageBus, RepositoryMessage};
pub use command::{CommandResult, Operation};
pub use config::ReplicationConfig;
pub use content::{ContentInfo, ContentState, StagingInfo};
pub use cursor::{CursorError, CursorStore, MemoryCursorStore, SqliteCursorStore};
pub use error::{RepositoryError, Result};
pub use event::Event;
pub use hash::{ContentHash, RevisionHash};
pub use memory::MemoryRepository;
pub use pool::{PoolError, ReplicationAgentsPool, ReplicationDef};
pub use replication::{ReplicationAgent, TransferStats};
pub use repository::{Repository, RepositoryRegistry, RepositoryResolver};
pub use revision::Revision;
pub use tree::{RevisionTree, TreeError};
pub use value::{metadata, Metadata, Value};
