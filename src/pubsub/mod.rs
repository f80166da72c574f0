//! Room pub/sub fanout
//!
//! One process-wide [`RoomPubSub`] owns every [`RoomTopic`] and its
//! subscriber set. Subscribers are opaque identity strings; resolving them
//! to live connections is the caller's job (via the connection registry),
//! which keeps this layer free of any socket knowledge.

pub mod error;
pub mod service;
pub mod topic;

pub use error::TopicError;
pub use service::{RoomInfo, RoomPubSub};
pub use topic::RoomTopic;
