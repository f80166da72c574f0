//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::store::DEFAULT_PAGE_SIZE;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: SocketAddr,

    /// Address of the cross-node broadcast endpoint (None = disabled)
    pub rpc_bind_addr: Option<SocketAddr>,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Handshake must complete within this time
    pub handshake_timeout: Duration,

    /// History messages per page
    pub history_page_size: usize,

    /// Concurrent message-store operations across all connections; frame
    /// handling on one connection stays ordered, but heavy store work is
    /// capped so it cannot starve everyone else
    pub store_concurrency: usize,

    /// Per-read buffer size for the socket read loop
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8090".parse().expect("static addr"),
            rpc_bind_addr: None,
            max_connections: 0, // Unlimited
            tcp_nodelay: true,
            handshake_timeout: Duration::from_secs(10),
            history_page_size: DEFAULT_PAGE_SIZE,
            store_concurrency: 32,
            read_buffer_size: 16 * 1024,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Enable the cross-node broadcast endpoint on this address
    pub fn rpc_bind(mut self, addr: SocketAddr) -> Self {
        self.rpc_bind_addr = Some(addr);
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the history page size (minimum 1)
    pub fn history_page_size(mut self, size: usize) -> Self {
        self.history_page_size = size.max(1);
        self
    }

    /// Set the store worker-pool width (minimum 1)
    pub fn store_concurrency(mut self, permits: usize) -> Self {
        self.store_concurrency = permits.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 8090);
        assert!(config.rpc_bind_addr.is_none());
        assert_eq!(config.max_connections, 0);
        assert!(config.tcp_nodelay);
        assert_eq!(config.history_page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let rpc: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .rpc_bind(rpc)
            .max_connections(500)
            .handshake_timeout(Duration::from_secs(5))
            .history_page_size(25)
            .store_concurrency(8);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.rpc_bind_addr, Some(rpc));
        assert_eq!(config.max_connections, 500);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.history_page_size, 25);
        assert_eq!(config.store_concurrency, 8);
    }

    #[test]
    fn test_builder_minimums() {
        let config = ServerConfig::default().history_page_size(0).store_concurrency(0);
        assert_eq!(config.history_page_size, 1);
        assert_eq!(config.store_concurrency, 1);
    }
}
