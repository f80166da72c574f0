//! Session state machine
//!
//! Tracks one connection's lifecycle from socket accept to teardown.

use std::net::SocketAddr;
use std::time::Instant;

use crate::server::UserIdentity;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// TCP connected, HTTP Upgrade not completed or identity not verified
    Handshaking,
    /// Upgrade done, identity verified, registered and subscribed
    Authenticated,
    /// Terminal; teardown has run
    Closed,
}

/// Complete per-connection state
#[derive(Debug)]
pub struct SessionState {
    /// Unique connection number, also used as the registry conn_id
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current phase
    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Time when authentication completed
    pub authenticated_at: Option<Instant>,

    /// Identity behind this connection (set on authentication)
    pub identity: Option<UserIdentity>,
}

impl SessionState {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::Handshaking,
            connected_at: Instant::now(),
            authenticated_at: None,
            identity: None,
        }
    }

    /// Complete the handshake with a verified identity
    pub fn authenticate(&mut self, identity: UserIdentity) {
        if self.phase == SessionPhase::Handshaking {
            self.phase = SessionPhase::Authenticated;
            self.authenticated_at = Some(Instant::now());
            self.identity = Some(identity);
        }
    }

    /// Enter the terminal phase
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }

    /// Session duration so far
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }
}
