//! Broadcast RPC client
//!
//! Used by the logic tier (or a sibling node) to push deliveries into a
//! node's [`BroadcastEndpoint`](super::BroadcastEndpoint). Connections are
//! lazy and reused; transport failures reconnect and retry with exponential
//! backoff, while an explicit rejection from the endpoint is returned
//! immediately since retrying it would only repeat the rejection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use super::wire::{self, RpcRequest, RpcResponse};
use crate::error::RpcError;

/// Retry schedule for transport failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Client for one remote broadcast endpoint
pub struct BroadcastClient {
    addr: SocketAddr,
    retry: RetryPolicy,
    stream: Option<TcpStream>,
}

impl BroadcastClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_retry(addr, RetryPolicy::default())
    }

    pub fn with_retry(addr: SocketAddr, retry: RetryPolicy) -> Self {
        Self {
            addr,
            retry,
            stream: None,
        }
    }

    /// Send one request and wait for the endpoint's response, reconnecting
    /// and retrying transport failures per the policy.
    pub async fn call(&mut self, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        let mut backoff = self.retry.initial_backoff;

        for attempt in 1..=self.retry.max_attempts {
            match self.try_call(request).await {
                Ok(response) if response.ok => return Ok(response),
                Ok(response) => {
                    // The endpoint answered; this is not a transport failure
                    let reason = response.error.unwrap_or_else(|| "rejected".to_string());
                    return Err(RpcError::Rejected(reason));
                }
                Err(e) => {
                    self.stream = None;
                    tracing::warn!(
                        addr = %self.addr,
                        attempt,
                        error = %e,
                        "rpc call failed, will retry"
                    );
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.retry.max_backoff);
                    }
                }
            }
        }
        Err(RpcError::RetriesExhausted(self.retry.max_attempts))
    }

    async fn try_call(&mut self, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(self.addr).await?;
            stream.set_nodelay(true)?;
            self.stream = Some(stream);
        }
        let stream = self.stream.as_mut().expect("connected above");

        wire::write_frame(stream, request).await?;
        match wire::read_frame(stream).await? {
            Some(response) => Ok(response),
            None => Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "endpoint closed mid-call",
            ))),
        }
    }
}
