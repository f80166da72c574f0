//! Connection registry
//!
//! Maps authenticated identity to the live connection handle. The map
//! enforces the single-connection invariant: at most one live connection
//! per identity, with last-writer-wins takeover. The lock is held only for
//! the map mutation itself; delivery through a handle is a queue push and
//! never happens under the lock.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::handle::ConnectionHandle;

/// Process-wide identity -> connection map
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, atomically evicting any previous one for the
    /// same identity. Returns the evicted handle so the caller can send it
    /// a close; there is no window with two connections registered.
    pub fn upsert(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut map = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let evicted = map.insert(handle.identity().to_string(), handle);

        if let Some(ref prev) = evicted {
            tracing::info!(
                identity = prev.identity(),
                old_conn = prev.conn_id(),
                "existing connection evicted by takeover"
            );
        }
        evicted
    }

    /// Remove a connection, but only if it is still the one registered for
    /// the identity. A stale teardown after a takeover is a no-op and must
    /// not evict the newer connection.
    pub fn remove(&self, identity: &str, conn_id: u64) -> bool {
        let mut map = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match map.get(identity) {
            Some(current) if current.conn_id() == conn_id => {
                map.remove(identity);
                true
            }
            Some(_) => {
                tracing::debug!(identity, conn_id, "stale remove ignored");
                false
            }
            None => false,
        }
    }

    /// Resolve an identity to its live connection, if any
    pub fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Snapshot of every registered connection
    pub fn all(&self) -> Vec<ConnectionHandle> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
