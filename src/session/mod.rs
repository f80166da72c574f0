//! Per-connection session handling
//!
//! ```text
//!   TcpStream ──► read loop ──► FrameDecoder ──► Session dispatch
//!                                                     │
//!        writer task ◄── outbound queue ◄─────────────┘
//! ```
//!
//! Each accepted socket gets a [`Session`] plus a dedicated writer task.
//! Fanout from other connections enqueues onto the same writer through the
//! registry handle, so a session's replies and broadcast deliveries never
//! interleave mid-frame.

pub mod connection;
pub mod state;

pub use connection::Session;
pub use state::{SessionPhase, SessionState};
