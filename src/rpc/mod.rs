//! Cross-node broadcast RPC
//!
//! A multi-node deployment shards connections across processes; a message
//! produced on one node must still reach subscribers connected elsewhere.
//! Each node exposes a [`BroadcastEndpoint`] over plain TCP; peers and the
//! logic tier drive it with a [`BroadcastClient`]:
//!
//! ```text
//!   node A session ──► BroadcastClient ══ tcp ══► BroadcastEndpoint (node B)
//!                                                        │
//!                                          registry / pub/sub on node B
//! ```
//!
//! The wire format is length-prefixed JSON; see [`wire`].

pub mod client;
pub mod endpoint;
pub mod wire;

pub use client::{BroadcastClient, RetryPolicy};
pub use endpoint::BroadcastEndpoint;
pub use wire::{RpcRequest, RpcResponse, MAX_RPC_FRAME};
