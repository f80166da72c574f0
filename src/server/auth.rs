//! Session-identity lookup collaborator
//!
//! The delivery tier does not check credentials itself; the login service
//! already did that and left a `sid` cookie behind. This trait resolves
//! that cookie to the identity it belongs to.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{PoisonError, RwLock};

use crate::error::AuthError;

/// The authenticated user behind a session cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub username: String,
}

/// Cookie -> identity lookup (external collaborator)
///
/// Methods return `Send` futures so sessions holding the collaborator can
/// run on spawned tasks.
pub trait SessionAuth: Send + Sync {
    /// Resolve a `sid` cookie value to an identity
    fn lookup(&self, sid: &str)
        -> impl Future<Output = Result<UserIdentity, AuthError>> + Send;
}

/// In-memory session table for tests and the demo server
#[derive(Default)]
pub struct MemorySessionAuth {
    sessions: RwLock<HashMap<String, UserIdentity>>,
}

impl MemorySessionAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sid: &str, identity: UserIdentity) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sid.to_string(), identity);
    }
}

impl SessionAuth for MemorySessionAuth {
    async fn lookup(&self, sid: &str) -> Result<UserIdentity, AuthError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sid)
            .cloned()
            .ok_or(AuthError::InvalidSession)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup() {
        let auth = MemorySessionAuth::new();
        auth.insert(
            "sid-1",
            UserIdentity {
                user_id: "u1".into(),
                username: "alice".into(),
            },
        );

        let identity = auth.lookup("sid-1").await.unwrap();
        assert_eq!(identity.username, "alice");
        assert!(matches!(
            auth.lookup("sid-2").await,
            Err(AuthError::InvalidSession)
        ));
    }
}
