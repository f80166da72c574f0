//! Server assembly: config, collaborator traits and the accept loop
//!
//! [`Services`] bundles the process-wide state every session shares; the
//! registries and pub/sub are constructed once here and passed by `Arc`,
//! never reached through globals, so tests can build isolated instances.

pub mod auth;
pub mod config;
pub mod directory;
pub mod listener;

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::pubsub::RoomPubSub;
use crate::registry::ConnectionRegistry;
use crate::store::{MessageLog, StreamStore};

pub use auth::{MemorySessionAuth, SessionAuth, UserIdentity};
pub use config::ServerConfig;
pub use directory::{DirectoryError, MemoryRoomDirectory, RoomDirectory, RoomRecord};
pub use listener::CometServer;

/// Shared state handed to every session and the rpc endpoint
pub struct Services<A, D, S> {
    pub auth: A,
    pub directory: D,
    pub log: MessageLog<S>,
    pub registry: Arc<ConnectionRegistry>,
    pub pubsub: Arc<RoomPubSub>,
    /// Bounded worker pool for message-store calls (see
    /// [`ServerConfig::store_concurrency`])
    pub store_permits: Semaphore,
    pub config: ServerConfig,
}

impl<A, D, S: StreamStore> Services<A, D, S> {
    pub fn new(config: ServerConfig, auth: A, directory: D, store: S) -> Self {
        Self {
            auth,
            directory,
            log: MessageLog::new(store, config.history_page_size),
            registry: Arc::new(ConnectionRegistry::new()),
            pubsub: Arc::new(RoomPubSub::new()),
            store_permits: Semaphore::new(config.store_concurrency),
            config,
        }
    }
}
