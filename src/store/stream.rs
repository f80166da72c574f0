//! Ordered-stream store seam
//!
//! The durable message backend is an append-only stream per room with
//! store-assigned monotonic entry IDs, read backwards from a cursor. The
//! wire shape mirrors a stream store's add/reverse-range pair: append takes
//! a `{payload: json}` field map and returns the assigned ID; reads return
//! `(id, payload)` pairs newest-first.
//!
//! [`MemoryStreamStore`] is the in-process implementation used by tests and
//! the demo server; production embeds a durable one behind the same trait.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::RwLock;

use crate::error::StoreError;

/// Pagination cursor for reverse reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Start from the most recent entry
    Newest,
    /// Entries strictly older than this ID (exclusive continuation)
    Before(u64),
}

impl Cursor {
    /// Parse a client-supplied cursor string. Empty means newest; anything
    /// that is not a valid ID is rejected.
    pub fn parse(value: &str) -> Option<Cursor> {
        if value.is_empty() {
            return Some(Cursor::Newest);
        }
        value.parse::<u64>().ok().map(Cursor::Before)
    }
}

/// Append-only stream store with per-key monotonic IDs
///
/// Methods return `Send` futures so sessions holding a store can run on
/// spawned tasks.
pub trait StreamStore: Send + Sync {
    /// Append a payload under `key`; the store assigns and returns the next
    /// monotonically increasing ID for that key. Callers never invent IDs.
    fn xadd(
        &self,
        key: &str,
        payload: String,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Read entries newest-first, strictly older than the cursor, up to
    /// `limit`. An unknown key yields an empty result, not an error.
    fn xrevrange(
        &self,
        key: &str,
        cursor: Cursor,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(u64, String)>, StoreError>> + Send;
}

#[derive(Default)]
struct StreamEntries {
    next_id: u64,
    /// Ascending by ID
    entries: Vec<(u64, String)>,
}

/// In-memory stream store
#[derive(Default)]
pub struct MemoryStreamStore {
    streams: RwLock<HashMap<String, StreamEntries>>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamStore for MemoryStreamStore {
    async fn xadd(&self, key: &str, payload: String) -> Result<u64, StoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(key.to_string()).or_default();
        stream.next_id += 1;
        let id = stream.next_id;
        stream.entries.push((id, payload));
        Ok(id)
    }

    async fn xrevrange(
        &self,
        key: &str,
        cursor: Cursor,
        limit: usize,
    ) -> Result<Vec<(u64, String)>, StoreError> {
        let streams = self.streams.read().await;
        let Some(stream) = streams.get(key) else {
            return Ok(Vec::new());
        };

        let result = stream
            .entries
            .iter()
            .rev()
            .filter(|(id, _)| match cursor {
                Cursor::Newest => true,
                Cursor::Before(anchor) => *id < anchor,
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(result)
    }
}
