//! Cross-node broadcast endpoint
//!
//! Other nodes (or the logic tier) connect over plain TCP and send
//! length-prefixed [`RpcRequest`] frames; each gets an [`RpcResponse`] on
//! the same connection. The endpoint shares the registry and pub/sub maps
//! with the local sessions, so a remote broadcast and a local one deliver
//! through exactly the same path.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};

use super::wire::{self, RpcRequest, RpcResponse};
use crate::protocol::frame::{self, Frame};
use crate::pubsub::RoomPubSub;
use crate::registry::ConnectionRegistry;

/// Serves broadcast requests against this node's live connections
pub struct BroadcastEndpoint {
    registry: Arc<ConnectionRegistry>,
    pubsub: Arc<RoomPubSub>,
}

impl BroadcastEndpoint {
    pub fn new(registry: Arc<ConnectionRegistry>, pubsub: Arc<RoomPubSub>) -> Self {
        Self { registry, pubsub }
    }

    /// Accept loop; one task per peer connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "rpc peer connected");
                    let endpoint = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = endpoint.serve_peer(stream).await {
                            tracing::warn!(%peer, error = %e, "rpc peer failed");
                        }
                        tracing::debug!(%peer, "rpc peer disconnected");
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "rpc accept failed");
                }
            }
        }
    }

    async fn serve_peer(&self, mut stream: TcpStream) -> Result<(), crate::error::RpcError> {
        loop {
            let request: RpcRequest = match wire::read_frame(&mut stream).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e) => {
                    // Tell the peer before dropping the connection
                    let _ =
                        wire::write_frame(&mut stream, &RpcResponse::rejected(e.to_string()))
                            .await;
                    return Err(e);
                }
            };
            let response = self.apply(request).await;
            wire::write_frame(&mut stream, &response).await?;
        }
    }

    /// Execute one broadcast instruction against the local maps
    pub async fn apply(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::PushKeys { keys, envelope } => {
                let frame_bytes = encode_envelope_frame(&envelope);
                let mut delivered = 0;
                for key in &keys {
                    match self.registry.lookup(key) {
                        Some(handle) if handle.send_frame(frame_bytes.clone()) => delivered += 1,
                        Some(_) => tracing::debug!(identity = %key, "stale connection skipped"),
                        None => tracing::debug!(identity = %key, "identity not connected here"),
                    }
                }
                tracing::debug!(requested = keys.len(), delivered, "push-keys applied");
                RpcResponse::delivered(delivered)
            }
            RpcRequest::BroadcastRoom { room_id, envelope } => {
                if !self.pubsub.contains(&room_id) {
                    return RpcResponse::rejected(format!("unknown room: {room_id}"));
                }
                let frame_bytes = encode_envelope_frame(&envelope);
                let mut delivered = 0;
                self.pubsub.broadcast(&room_id, |subscribers| {
                    for subscriber in subscribers {
                        if let Some(handle) = self.registry.lookup(subscriber) {
                            if handle.send_frame(frame_bytes.clone()) {
                                delivered += 1;
                            }
                        }
                    }
                });
                tracing::debug!(room = %room_id, delivered, "room broadcast applied");
                RpcResponse::delivered(delivered)
            }
            RpcRequest::BroadcastAll { envelope, speed } => {
                let frame_bytes = encode_envelope_frame(&envelope);
                let handles = self.registry.all();
                let chunk = if speed == 0 { handles.len().max(1) } else { speed as usize };

                let mut delivered = 0;
                let mut chunks = handles.chunks(chunk).peekable();
                while let Some(batch) = chunks.next() {
                    for handle in batch {
                        if handle.send_frame(frame_bytes.clone()) {
                            delivered += 1;
                        }
                    }
                    if chunks.peek().is_some() {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                tracing::debug!(delivered, speed, "node-wide broadcast applied");
                RpcResponse::delivered(delivered)
            }
        }
    }
}

/// Encode the carried envelope JSON into shared text-frame bytes
fn encode_envelope_frame(envelope: &str) -> Bytes {
    frame::encode(&Frame::text(envelope.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, Outbound};
    use tokio::sync::mpsc;

    fn endpoint() -> (
        BroadcastEndpoint,
        Arc<ConnectionRegistry>,
        Arc<RoomPubSub>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new());
        let pubsub = Arc::new(RoomPubSub::new());
        pubsub.create_topic("r1", "general", "u0").unwrap();
        let endpoint = BroadcastEndpoint::new(Arc::clone(&registry), Arc::clone(&pubsub));
        (endpoint, registry, pubsub)
    }

    fn connect(
        registry: &ConnectionRegistry,
        identity: &str,
        conn_id: u64,
    ) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.upsert(ConnectionHandle::new(identity.into(), conn_id, tx));
        rx
    }

    fn received_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<Bytes> {
        match rx.try_recv() {
            Ok(Outbound::Frame(bytes)) => Some(bytes),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_push_keys_counts_connected_only() {
        let (endpoint, registry, _) = endpoint();
        let mut rx = connect(&registry, "u1", 1);

        let response = endpoint
            .apply(RpcRequest::PushKeys {
                keys: vec!["u1".into(), "u-absent".into()],
                envelope: r#"{"type":"hello","payload":{}}"#.into(),
            })
            .await;

        assert!(response.ok);
        assert_eq!(response.delivered, 1);
        assert!(received_frame(&mut rx).is_some());
    }

    #[tokio::test]
    async fn test_broadcast_room_reaches_subscribers_only() {
        let (endpoint, registry, pubsub) = endpoint();
        let mut rx_in = connect(&registry, "u1", 1);
        let mut rx_out = connect(&registry, "u2", 2);
        pubsub.add_subscriber("r1", "u1");

        let response = endpoint
            .apply(RpcRequest::BroadcastRoom {
                room_id: "r1".into(),
                envelope: "{}".into(),
            })
            .await;

        assert_eq!(response.delivered, 1);
        assert!(received_frame(&mut rx_in).is_some());
        assert!(received_frame(&mut rx_out).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_unknown_room_rejected() {
        let (endpoint, _, _) = endpoint();
        let response = endpoint
            .apply(RpcRequest::BroadcastRoom {
                room_id: "nope".into(),
                envelope: "{}".into(),
            })
            .await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("unknown room"));
    }

    #[tokio::test]
    async fn test_broadcast_all_skips_stale() {
        let (endpoint, registry, _) = endpoint();
        let mut rx_live = connect(&registry, "u1", 1);
        let rx_stale = connect(&registry, "u2", 2);
        drop(rx_stale);

        let response = endpoint
            .apply(RpcRequest::BroadcastAll {
                envelope: "{}".into(),
                speed: 0,
            })
            .await;
        assert_eq!(response.delivered, 1);
        assert!(received_frame(&mut rx_live).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_all_paced_delivers_everyone() {
        let (endpoint, registry, _) = endpoint();
        let mut receivers: Vec<_> = (1..=3)
            .map(|i| connect(&registry, &format!("u{i}"), i))
            .collect();

        // Speed 1 means one connection per second; paused time makes the
        // sleeps instantaneous while keeping the chunking path exercised
        let response = endpoint
            .apply(RpcRequest::BroadcastAll {
                envelope: "{}".into(),
                speed: 1,
            })
            .await;

        assert_eq!(response.delivered, 3);
        for rx in &mut receivers {
            assert!(received_frame(rx).is_some());
        }
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let (endpoint, registry, _) = endpoint();
        let mut rx = connect(&registry, "u1", 1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::new(endpoint).serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_frame(
            &mut stream,
            &RpcRequest::PushKeys {
                keys: vec!["u1".into()],
                envelope: "{}".into(),
            },
        )
        .await
        .unwrap();

        let response: RpcResponse = wire::read_frame(&mut stream).await.unwrap().unwrap();
        assert!(response.ok);
        assert_eq!(response.delivered, 1);
        assert!(received_frame(&mut rx).is_some());
    }
}
