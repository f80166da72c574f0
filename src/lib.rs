//! Real-time chat delivery tier
//!
//! Holds every client's WebSocket connection, fans room messages out to
//! subscribers and serves cursor-paginated history. Identity verification,
//! room persistence and durable message storage live in other services,
//! reached through the [`server::SessionAuth`], [`server::RoomDirectory`]
//! and [`store::StreamStore`] seams.
//!
//! ```text
//!  browser ══ websocket ══╗
//!  browser ══ websocket ══╬═► CometServer ──► sessions ──► room fanout
//!  browser ══ websocket ══╝        │               │
//!                                  │         ConnectionRegistry
//!  other node ══ tcp rpc ══► BroadcastEndpoint     │
//!                                  │          RoomPubSub
//!                                  └────► MessageLog (stream store)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use comet_rs::server::{CometServer, MemoryRoomDirectory, MemorySessionAuth, ServerConfig};
//! use comet_rs::store::MemoryStreamStore;
//!
//! #[tokio::main]
//! async fn main() -> comet_rs::Result<()> {
//!     let config = ServerConfig::default().bind("127.0.0.1:8090".parse().unwrap());
//!     let server = CometServer::new(
//!         config,
//!         MemorySessionAuth::new(),
//!         MemoryRoomDirectory::new(),
//!         MemoryStreamStore::new(),
//!     );
//!     server.run().await
//! }
//! ```

pub mod error;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use server::{CometServer, ServerConfig};
