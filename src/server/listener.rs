//! Chat server listener
//!
//! Handles the TCP accept loop, mirrors the room directory into the
//! pub/sub layer at startup and spawns one session per connection. When
//! configured, also brings up the cross-node broadcast endpoint sharing
//! the same registry and pub/sub maps.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::rpc::BroadcastEndpoint;
use crate::server::config::ServerConfig;
use crate::server::{RoomDirectory, Services, SessionAuth};
use crate::session::Session;
use crate::store::StreamStore;

/// Chat delivery server
pub struct CometServer<A, D, S> {
    services: Arc<Services<A, D, S>>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl<A, D, S> CometServer<A, D, S>
where
    A: SessionAuth + 'static,
    D: RoomDirectory + 'static,
    S: StreamStore + 'static,
{
    /// Create a new server from its configuration and collaborators
    pub fn new(config: ServerConfig, auth: A, directory: D, store: S) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            services: Arc::new(Services::new(config, auth, directory, store)),
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Shared state: registry, pub/sub, log and collaborators
    pub fn services(&self) -> &Arc<Services<A, D, S>> {
        &self.services
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = self.start().await?;
        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = self.start().await?;

        tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    /// Bind the listener, mirror the room directory and bring up the
    /// broadcast endpoint
    async fn start(&self) -> Result<TcpListener> {
        self.mirror_rooms().await?;

        if let Some(rpc_addr) = self.services.config.rpc_bind_addr {
            let rpc_listener = TcpListener::bind(rpc_addr).await?;
            tracing::info!(addr = %rpc_addr, "broadcast endpoint listening");
            let endpoint = Arc::new(BroadcastEndpoint::new(
                Arc::clone(&self.services.registry),
                Arc::clone(&self.services.pubsub),
            ));
            tokio::spawn(endpoint.serve(rpc_listener));
        }

        let listener = TcpListener::bind(self.services.config.bind_addr).await?;
        tracing::info!(addr = %self.services.config.bind_addr, "chat server listening");
        Ok(listener)
    }

    /// Load every persisted room into the pub/sub layer so sessions can
    /// subscribe and broadcast from the first connection on
    async fn mirror_rooms(&self) -> Result<()> {
        let rooms = self
            .services
            .directory
            .list_rooms()
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut mirrored = 0usize;
        for room in rooms {
            match self
                .services
                .pubsub
                .create_topic(&room.room_id, &room.room_name, &room.creator_id)
            {
                Ok(()) => mirrored += 1,
                Err(e) => tracing::warn!(room = %room.room_id, error = %e, "room not mirrored"),
            }
        }
        tracing::info!(rooms = mirrored, "room directory mirrored");
        Ok(())
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let _permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id, peer = %peer_addr, "new connection");

        if self.services.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::warn!(session_id, error = %e, "failed to set TCP_NODELAY");
            }
        }

        let services = Arc::clone(&self.services);
        tokio::spawn(async move {
            Session::run(services, session_id, socket, peer_addr).await;
            tracing::debug!(session_id, "connection closed");
            drop(_permit);
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.services.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{MemoryRoomDirectory, MemorySessionAuth};
    use crate::store::MemoryStreamStore;

    fn server(config: ServerConfig) -> CometServer<MemorySessionAuth, MemoryRoomDirectory, MemoryStreamStore> {
        let directory = MemoryRoomDirectory::new();
        directory.seed("r1", "general", "u0");
        directory.seed("r2", "random", "u0");
        CometServer::new(config, MemorySessionAuth::new(), directory, MemoryStreamStore::new())
    }

    #[tokio::test]
    async fn test_mirror_rooms_at_startup() {
        let server = server(ServerConfig::default());
        server.mirror_rooms().await.unwrap();

        assert!(server.services().pubsub.contains("r1"));
        assert!(server.services().pubsub.contains("r2"));
        assert_eq!(server.services().pubsub.rooms().len(), 2);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let config = ServerConfig::default().bind("127.0.0.1:0".parse().unwrap());
        let server = server(config);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tx.send(()).unwrap();
        server
            .run_until(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    }
}
