//! Identity -> live connection registry
//!
//! One process-wide [`ConnectionRegistry`] instance maps each authenticated
//! user to its single live connection. Fanout resolves identities through
//! the registry and pushes pre-encoded frames onto each connection's
//! outbound queue:
//!
//! ```text
//!                   ConnectionRegistry
//!               ┌──────────────────────────┐
//!               │ identity -> Handle {     │
//!               │   conn_id,               │
//!               │   tx: mpsc::Sender,      │
//!               │ }                        │
//!               └─────────┬────────────────┘
//!                         │ lookup(identity)
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!     [room fanout]  [rpc endpoint]  [takeover close]
//!          │              │              │
//!          └── send_frame(Bytes) ────────┘
//!                         │
//!                 writer task ──► socket
//! ```
//!
//! Frames are `bytes::Bytes`, so one encode is shared by every subscriber;
//! the queue push is lock-free with respect to the registry map.

pub mod handle;
pub mod store;

pub use handle::{ConnectionHandle, Outbound};
pub use store::ConnectionRegistry;
