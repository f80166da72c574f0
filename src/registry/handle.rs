//! Live connection handles
//!
//! A [`ConnectionHandle`] is the cloneable address of one connection's
//! outbound queue. Everything that needs to deliver to a connection (room
//! fanout, the cross-node endpoint, takeover eviction) enqueues through the
//! handle; only the connection's own writer task touches the socket.

use bytes::Bytes;
use tokio::sync::mpsc;

/// An item queued for a connection's writer task
#[derive(Debug)]
pub enum Outbound {
    /// Pre-encoded WebSocket frame bytes
    Frame(Bytes),
    /// Raw bytes written as-is (the 101 handshake response)
    Raw(Bytes),
    /// Write a close frame, then shut the socket down
    Close { code: u16, reason: String },
}

/// Non-owning reference to a live connection, keyed by identity
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    identity: String,
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(identity: String, conn_id: u64, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            identity,
            conn_id,
            tx,
        }
    }

    /// Authenticated user ID this connection belongs to
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Unique per-process connection number; distinguishes a reconnect from
    /// the connection it replaced
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Enqueue an encoded frame. Returns false when the connection's writer
    /// is already gone; callers treat that as a skipped delivery.
    pub fn send_frame(&self, frame: Bytes) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Ask the connection to close with the given status
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }
}
