//! Durable, cursor-paginated message log
//!
//! [`MessageLog`] handles message serialization and page assembly;
//! [`StreamStore`] is the seam to the durable ordered-stream backend, with
//! [`MemoryStreamStore`] as the in-process implementation.

pub mod log;
pub mod stream;

pub use log::{Message, MessageBatch, MessageLog, DEFAULT_PAGE_SIZE};
pub use stream::{Cursor, MemoryStreamStore, StreamStore};
