//! Wire protocol: opening handshake, frame codec and JSON envelopes
//!
//! The stack, bottom up:
//!
//! ```text
//! socket bytes
//!    |  handshake::UpgradeRequest  (once, HTTP Upgrade -> 101)
//!    v
//! frame::FrameDecoder              (incremental, reassembles fragments)
//!    |
//!    v
//! envelope::parse_client_text      ({"type", "payload"} dispatch)
//! ```

pub mod envelope;
pub mod frame;
pub mod handshake;

pub use envelope::{ClientRequest, MessageJson, UserRef};
pub use frame::{Frame, FrameDecoder, Opcode};
pub use handshake::UpgradeRequest;
