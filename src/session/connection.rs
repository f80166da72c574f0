//! Per-connection protocol session
//!
//! One [`Session`] owns one client connection end to end: the HTTP Upgrade
//! handshake, identity verification, registration and room subscription,
//! frame dispatch, and teardown. The socket is split; all writes go through
//! the connection's outbound queue so fanout from other tasks and this
//! session's own replies share one writer.
//!
//! Ordering: frames of a single connection are handled sequentially by its
//! own task. Heavy store work takes a permit from the shared bounded pool,
//! which caps cross-connection store pressure without reordering anything
//! within a connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::protocol::envelope::{
    self, ClientMessages, ClientRequest, CreateRoomRequest, HelloPayload, HelloRoom,
    HistoryRequest, MessageJson, ServerCreateRoom, ServerMessages, ServerRoomHistory, UserRef,
    TYPE_HELLO, TYPE_SERVER_CREATE_ROOM, TYPE_SERVER_MESSAGES, TYPE_SERVER_ROOM_HISTORY,
};
use crate::protocol::frame::{
    self, Frame, FrameDecoder, Opcode, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
    CLOSE_PROTOCOL_ERROR,
};
use crate::protocol::handshake::UpgradeRequest;
use crate::registry::{ConnectionHandle, Outbound};
use crate::server::{DirectoryError, RoomDirectory, Services, SessionAuth};
use crate::session::state::{SessionPhase, SessionState};
use crate::store::{Cursor, Message, StreamStore};

/// One client connection's protocol session
pub struct Session<A, D, S> {
    services: Arc<Services<A, D, S>>,
    state: SessionState,
    decoder: FrameDecoder,
    /// Accumulates bytes until the upgrade request is complete
    hs_buf: BytesMut,
    out_tx: mpsc::UnboundedSender<Outbound>,
    torn_down: bool,
}

impl<A, D, S> Session<A, D, S>
where
    A: SessionAuth,
    D: RoomDirectory,
    S: StreamStore,
{
    pub fn new(
        services: Arc<Services<A, D, S>>,
        session_id: u64,
        peer_addr: SocketAddr,
        out_tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            services,
            state: SessionState::new(session_id, peer_addr),
            decoder: FrameDecoder::new(),
            hs_buf: BytesMut::new(),
            out_tx,
            torn_down: false,
        }
    }

    /// Drive a connection to completion. Spawns the writer task, runs the
    /// read loop, and tears the session down on every exit path.
    pub async fn run(
        services: Arc<Services<A, D, S>>,
        session_id: u64,
        socket: TcpStream,
        peer_addr: SocketAddr,
    ) {
        let (mut reader, writer) = socket.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (closed_tx, mut closed_rx) = watch::channel(false);
        tokio::spawn(write_loop(writer, out_rx, closed_tx));

        let read_buffer_size = services.config.read_buffer_size;
        let handshake_deadline =
            tokio::time::Instant::now() + services.config.handshake_timeout;
        let mut session = Session::new(services, session_id, peer_addr, out_tx);

        let mut buf = BytesMut::with_capacity(read_buffer_size);
        loop {
            let read = if session.state.phase == SessionPhase::Handshaking {
                match tokio::time::timeout_at(handshake_deadline, reader.read_buf(&mut buf)).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::debug!(session_id, "handshake timed out");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    result = reader.read_buf(&mut buf) => result,
                    _ = closed_rx.changed() => break,
                }
            };

            match read {
                Ok(0) => break,
                Ok(_) => {
                    let data = buf.split().freeze();
                    if !session.on_bytes(&data).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id, error = %e, "socket read failed");
                    break;
                }
            }
        }

        session.teardown();
    }

    /// Feed newly read bytes through the current phase. Returns false when
    /// the connection should stop.
    async fn on_bytes(&mut self, data: &[u8]) -> bool {
        match self.state.phase {
            SessionPhase::Handshaking => {
                self.hs_buf.extend_from_slice(data);
                let (request, consumed) = match UpgradeRequest::parse(&self.hs_buf) {
                    Ok(Some(parsed)) => parsed,
                    Ok(None) => return true,
                    Err(e) => {
                        tracing::warn!(
                            session_id = self.state.id,
                            error = %e,
                            "malformed handshake, closing without response"
                        );
                        return false;
                    }
                };
                if !self.handle_handshake(request).await {
                    return false;
                }
                // Frames pipelined behind the handshake belong to the stream
                let leftover = self.hs_buf.split_off(consumed);
                self.hs_buf.clear();
                if !leftover.is_empty() {
                    self.decoder.extend(&leftover);
                }
                self.drain_frames().await
            }
            SessionPhase::Authenticated => {
                self.decoder.extend(data);
                self.drain_frames().await
            }
            SessionPhase::Closed => false,
        }
    }

    async fn drain_frames(&mut self) -> bool {
        loop {
            match self.decoder.next() {
                Ok(Some(frame)) => {
                    if !self.handle_frame(frame).await {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    tracing::warn!(session_id = self.state.id, error = %e, "frame protocol error");
                    self.send_close(CLOSE_PROTOCOL_ERROR, "protocol error");
                    return false;
                }
            }
        }
    }

    /// Complete the upgrade, verify identity, register and send the hello
    /// snapshot. Returns false when the connection must close.
    async fn handle_handshake(&mut self, request: UpgradeRequest) -> bool {
        let key = match request.websocket_key() {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(session_id = self.state.id, error = %e, "handshake rejected");
                return false;
            }
        };

        let accept = crate::protocol::handshake::accept_key(key);
        let response = crate::protocol::handshake::build_response(&accept);
        self.send_raw(Bytes::from(response));

        let identity = match request.session_id() {
            Some(sid) => self.services.auth.lookup(sid).await,
            None => Err(crate::error::AuthError::MissingCookie),
        };
        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(
                    session_id = self.state.id,
                    peer = %self.state.peer_addr,
                    error = %e,
                    "cookie validation failed"
                );
                self.send_close(CLOSE_POLICY_VIOLATION, "cookie validation failed");
                return false;
            }
        };

        tracing::info!(
            session_id = self.state.id,
            identity = %identity.user_id,
            username = %identity.username,
            "session authenticated"
        );
        self.state.authenticate(identity.clone());

        // Register, actively evicting any previous connection for this user
        let handle = ConnectionHandle::new(
            identity.user_id.clone(),
            self.state.id,
            self.out_tx.clone(),
        );
        if let Some(previous) = self.services.registry.upsert(handle) {
            previous.close(CLOSE_NORMAL, "replaced by newer connection");
        }

        match self.send_hello(&identity).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(session_id = self.state.id, error = %e, "hello snapshot failed");
                self.send_close(CLOSE_INTERNAL_ERROR, "history unavailable");
                false
            }
        }
    }

    /// Subscribe to every mirrored room and send the initial snapshot:
    /// identity info plus one history page per room.
    async fn send_hello(
        &mut self,
        identity: &crate::server::UserIdentity,
    ) -> Result<(), crate::error::StoreError> {
        let page_size = self.services.log.page_size();
        let mut rooms = Vec::new();

        for info in self.services.pubsub.rooms() {
            self.services.pubsub.add_subscriber(&info.room_id, &identity.user_id);

            let batch = {
                let _permit = self.services.store_permits.acquire().await.ok();
                self.services
                    .log
                    .reverse_range(&info.room_id, Cursor::Newest, page_size)
                    .await?
            };
            rooms.push(HelloRoom {
                id: info.room_id,
                name: info.room_name,
                has_more_messages: batch.has_more,
                messages: batch.messages.iter().map(MessageJson::from_message).collect(),
            });
        }

        let payload = HelloPayload {
            me: UserRef {
                id: identity.user_id.clone(),
                username: identity.username.clone(),
            },
            rooms,
        };
        self.send_envelope(TYPE_HELLO, &payload);
        Ok(())
    }

    /// Dispatch one complete frame. Returns false when the connection
    /// should stop.
    async fn handle_frame(&mut self, frame: Frame) -> bool {
        match frame.opcode {
            Opcode::Text => {
                let text = match std::str::from_utf8(&frame.payload) {
                    Ok(text) => text,
                    Err(_) => {
                        self.send_close(CLOSE_PROTOCOL_ERROR, "text frame is not utf-8");
                        return false;
                    }
                };
                match envelope::parse_client_text(text) {
                    Ok(Some(request)) => {
                        self.dispatch(request).await;
                        true
                    }
                    Ok(None) => true, // dropped and logged
                    Err(e) => {
                        tracing::warn!(session_id = self.state.id, error = %e, "unparsable envelope");
                        self.send_close(CLOSE_PROTOCOL_ERROR, "unparsable envelope");
                        false
                    }
                }
            }
            Opcode::Close => {
                tracing::debug!(session_id = self.state.id, code = ?frame.close_code(), "client close");
                self.send_close(CLOSE_NORMAL, "");
                false
            }
            Opcode::Ping => {
                self.send_frame(&Frame::pong(frame.payload));
                true
            }
            Opcode::Pong | Opcode::Binary | Opcode::Continuation => {
                tracing::debug!(session_id = self.state.id, opcode = ?frame.opcode, "frame ignored");
                true
            }
        }
    }

    async fn dispatch(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Messages(req) => self.handle_client_messages(req).await,
            ClientRequest::RoomHistory(req) => self.handle_history(req).await,
            ClientRequest::CreateRoom(req) => self.handle_create_room(req).await,
        }
    }

    /// Persist the submitted messages, then fan the batch out to every
    /// current subscriber of the room.
    async fn handle_client_messages(&mut self, req: ClientMessages) {
        let Some(identity) = self.state.identity.clone() else {
            return;
        };
        if !self.services.pubsub.contains(&req.room_id) {
            tracing::warn!(room = %req.room_id, "messages for unknown room dropped");
            return;
        }

        // Client-supplied identity fields are ignored; the session stamps
        // its own identity and a server-side timestamp.
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        let mut messages: Vec<Message> = req
            .messages
            .into_iter()
            .map(|m| Message {
                id: 0,
                user_id: identity.user_id.clone(),
                username: identity.username.clone(),
                content: m.content,
                timestamp,
            })
            .collect();

        {
            let _permit = self.services.store_permits.acquire().await.ok();
            for message in &mut messages {
                if let Err(e) = self.services.log.append(&req.room_id, message).await {
                    tracing::error!(
                        session_id = self.state.id,
                        room = %req.room_id,
                        error = %e,
                        "append failed, aborting send"
                    );
                    return; // never fan out an unpersisted message
                }
            }
        }

        let payload = ServerMessages {
            room_id: req.room_id.clone(),
            messages: messages.iter().map(MessageJson::from_message).collect(),
        };
        let frame_bytes = match encode_text_envelope(TYPE_SERVER_MESSAGES, &payload) {
            Some(bytes) => bytes,
            None => return,
        };

        let services = Arc::clone(&self.services);
        services.pubsub.broadcast(&req.room_id, |subscribers| {
            tracing::debug!(
                room = %req.room_id,
                subscribers = subscribers.len(),
                "fanning out messages"
            );
            for subscriber in subscribers {
                match services.registry.lookup(subscriber) {
                    Some(handle) => {
                        if !handle.send_frame(frame_bytes.clone()) {
                            tracing::debug!(identity = %subscriber, "stale connection skipped");
                        }
                    }
                    None => {
                        tracing::debug!(identity = %subscriber, "subscriber offline, skipped");
                    }
                }
            }
        });
    }

    /// Reverse-cursor history read; the reply goes only to the requester.
    /// The cursor is per-request state, never stored on shared room data.
    async fn handle_history(&mut self, req: HistoryRequest) {
        let cursor = match req.first_message_id.as_deref() {
            None => Cursor::Newest,
            Some(raw) => match Cursor::parse(raw) {
                Some(cursor) => cursor,
                None => {
                    tracing::warn!(
                        session_id = self.state.id,
                        cursor = raw,
                        "bad history cursor, dropping request"
                    );
                    return;
                }
            },
        };
        let Some(name) = self.services.pubsub.room_name(&req.room_id) else {
            tracing::warn!(room = %req.room_id, "history for unknown room ignored");
            return;
        };

        let page_size = self.services.log.page_size();
        let limit = req.count.unwrap_or(page_size).clamp(1, page_size);

        let batch = {
            let _permit = self.services.store_permits.acquire().await.ok();
            match self.services.log.reverse_range(&req.room_id, cursor, limit).await {
                Ok(batch) => batch,
                Err(e) => {
                    // No partial or corrupt data; the client may retry
                    tracing::error!(room = %req.room_id, error = %e, "history read failed");
                    return;
                }
            }
        };

        let payload = ServerRoomHistory {
            room_id: req.room_id,
            name,
            has_more_messages: batch.has_more,
            messages: batch.messages.iter().map(MessageJson::from_message).collect(),
        };
        self.send_envelope(TYPE_SERVER_ROOM_HISTORY, &payload);
    }

    /// Delegate room persistence, then mirror the topic, subscribe every
    /// live connection, and announce the room to all of them.
    async fn handle_create_room(&mut self, req: CreateRoomRequest) {
        let Some(identity) = self.state.identity.clone() else {
            return;
        };

        let record = match self
            .services
            .directory
            .create_room(&req.room_name, &identity.user_id)
            .await
        {
            Ok(record) => record,
            Err(DirectoryError::NameExists(name)) => {
                tracing::debug!(room_name = %name, "create-room name collision");
                self.send_envelope(TYPE_SERVER_CREATE_ROOM, &ServerCreateRoom::collision());
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "room persistence failed");
                return;
            }
        };

        if let Err(e) =
            self.services
                .pubsub
                .create_topic(&record.room_id, &record.room_name, &record.creator_id)
        {
            tracing::warn!(error = %e, "room topic already mirrored");
        }

        let connections = self.services.registry.all();
        for handle in &connections {
            self.services.pubsub.add_subscriber(&record.room_id, handle.identity());
        }

        tracing::info!(
            room = %record.room_id,
            name = %record.room_name,
            creator = %identity.user_id,
            subscribers = connections.len(),
            "room created"
        );

        let payload = ServerCreateRoom {
            room_id: record.room_id,
            room_name: record.room_name,
            creator_id: identity.user_id,
            creator_username: identity.username,
        };
        let Some(frame_bytes) = encode_text_envelope(TYPE_SERVER_CREATE_ROOM, &payload) else {
            return;
        };
        for handle in &connections {
            if !handle.send_frame(frame_bytes.clone()) {
                tracing::debug!(identity = handle.identity(), "stale connection skipped");
            }
        }
    }

    fn send_raw(&self, bytes: Bytes) {
        let _ = self.out_tx.send(Outbound::Raw(bytes));
    }

    fn send_frame(&self, frame: &Frame) {
        let _ = self.out_tx.send(Outbound::Frame(frame::encode(frame)));
    }

    fn send_close(&self, code: u16, reason: &str) {
        let _ = self.out_tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn send_envelope<P: serde::Serialize>(&self, kind: &str, payload: &P) {
        if let Some(bytes) = encode_text_envelope(kind, payload) {
            let _ = self.out_tx.send(Outbound::Frame(bytes));
        }
    }
}

impl<A, D, S> Session<A, D, S> {
    /// Remove this session from the registry and every room. Runs exactly
    /// once no matter which path closed the connection.
    ///
    /// Subscriptions are removed only when this session was still the
    /// registered connection for its identity. After a takeover, the same
    /// identity's newer connection holds subscriptions of its own; a stale
    /// teardown must leave those (and the registration) untouched.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(identity) = self.state.identity.take() {
            if self.services.registry.remove(&identity.user_id, self.state.id) {
                self.services.pubsub.remove_subscriber_everywhere(&identity.user_id);
                tracing::info!(
                    session_id = self.state.id,
                    identity = %identity.user_id,
                    duration_ms = self.state.duration().as_millis() as u64,
                    "session torn down"
                );
            } else {
                tracing::debug!(
                    session_id = self.state.id,
                    identity = %identity.user_id,
                    "stale teardown, registration already replaced"
                );
            }
        }
        self.state.close();
    }
}

impl<A, D, S> Drop for Session<A, D, S> {
    fn drop(&mut self) {
        // Guarded; a normal run() exit has already torn down
        self.teardown();
    }
}

/// Encode an envelope into ready-to-send text frame bytes
fn encode_text_envelope<P: serde::Serialize>(kind: &str, payload: &P) -> Option<Bytes> {
    match envelope::encode_envelope(kind, payload) {
        Ok(json) => Some(frame::encode(&Frame::text(json))),
        Err(e) => {
            tracing::error!(r#type = kind, error = %e, "envelope serialization failed");
            None
        }
    }
}

/// Writer task: drains the outbound queue onto the socket. On `Close` it
/// writes the close frame, shuts the socket down and signals the read loop.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    closed: watch::Sender<bool>,
) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outbound::Raw(bytes) | Outbound::Frame(bytes) => writer.write_all(&bytes).await,
            Outbound::Close { code, reason } => {
                let bytes = frame::encode(&Frame::close(code, &reason));
                let _ = writer.write_all(&bytes).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    let _ = closed.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        MemoryRoomDirectory, MemorySessionAuth, ServerConfig, UserIdentity,
    };
    use crate::store::MemoryStreamStore;

    type TestServices = Services<MemorySessionAuth, MemoryRoomDirectory, MemoryStreamStore>;
    type TestSession = Session<MemorySessionAuth, MemoryRoomDirectory, MemoryStreamStore>;

    fn services() -> Arc<TestServices> {
        let services = Services::new(
            ServerConfig::default().history_page_size(3),
            MemorySessionAuth::new(),
            MemoryRoomDirectory::new(),
            MemoryStreamStore::new(),
        );
        services.auth.insert(
            "sid-alice",
            UserIdentity {
                user_id: "u-alice".into(),
                username: "alice".into(),
            },
        );
        services.auth.insert(
            "sid-bob",
            UserIdentity {
                user_id: "u-bob".into(),
                username: "bob".into(),
            },
        );
        services.pubsub.create_topic("r1", "general", "u0").unwrap();
        services.pubsub.create_topic("r2", "random", "u0").unwrap();
        Arc::new(services)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:54321".parse().unwrap()
    }

    fn upgrade_request(sid: &str) -> String {
        format!(
            "GET /ws HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Cookie: sid={sid}\r\n\r\n"
        )
    }

    fn client_frame(value: &serde_json::Value) -> Bytes {
        frame::encode_masked(&Frame::text(value.to_string()), [9, 8, 7, 6])
    }

    async fn authenticated_session(
        services: &Arc<TestServices>,
        session_id: u64,
        sid: &str,
    ) -> (TestSession, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(Arc::clone(services), session_id, peer(), tx);
        assert!(session.on_bytes(upgrade_request(sid).as_bytes()).await);

        // Swallow the 101 response and the hello snapshot
        assert!(matches!(rx.try_recv(), Ok(Outbound::Raw(_))));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(_))));
        (session, rx)
    }

    /// Decode the next queued frame as a JSON envelope
    fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> serde_json::Value {
        match rx.try_recv() {
            Ok(Outbound::Frame(bytes)) => {
                let mut decoder = FrameDecoder::new();
                decoder.extend(&bytes);
                let frame = decoder.next().unwrap().expect("complete frame");
                assert_eq!(frame.opcode, Opcode::Text);
                serde_json::from_slice(&frame.payload).unwrap()
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_and_hello_snapshot() {
        let services = services();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(Arc::clone(&services), 1, peer(), tx);

        assert!(session.on_bytes(upgrade_request("sid-alice").as_bytes()).await);

        match rx.try_recv() {
            Ok(Outbound::Raw(bytes)) => {
                let response = String::from_utf8(bytes.to_vec()).unwrap();
                assert!(response.starts_with("HTTP/1.1 101"));
                assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
            }
            other => panic!("expected 101 response, got {other:?}"),
        }

        let hello = next_envelope(&mut rx);
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["payload"]["me"]["username"], "alice");
        let rooms = hello["payload"]["rooms"].as_array().unwrap();
        assert_eq!(rooms.len(), 2);
        assert!(rooms.iter().all(|r| r["messages"].is_array()));

        // Registered and subscribed everywhere
        assert!(services.registry.lookup("u-alice").is_some());
        assert_eq!(services.pubsub.subscriber_count("r1"), 1);
        assert_eq!(services.pubsub.subscriber_count("r2"), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_sends_1008_close() {
        let services = services();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(Arc::clone(&services), 1, peer(), tx);

        assert!(!session.on_bytes(upgrade_request("sid-unknown").as_bytes()).await);

        assert!(matches!(rx.try_recv(), Ok(Outbound::Raw(_)))); // 101 still sent
        match rx.try_recv() {
            Ok(Outbound::Close { code, reason }) => {
                assert_eq!(code, CLOSE_POLICY_VIOLATION);
                assert_eq!(reason, "cookie validation failed");
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(services.registry.is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_closes_without_response() {
        let services = services();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(Arc::clone(&services), 1, peer(), tx);

        let request = "GET /ws HTTP/1.1\r\nCookie: sid=sid-alice\r\n\r\n";
        assert!(!session.on_bytes(request.as_bytes()).await);
        assert!(rx.try_recv().is_err(), "no bytes written at all");
    }

    #[tokio::test]
    async fn test_send_message_persists_and_fans_out() {
        let services = services();
        let (mut alice, mut rx_alice) = authenticated_session(&services, 1, "sid-alice").await;
        let (_bob, mut rx_bob) = authenticated_session(&services, 2, "sid-bob").await;

        let frame = client_frame(&serde_json::json!({
            "type": "clientMessages",
            "payload": {"roomId": "r1", "messages": [{"content": "hi all"}]}
        }));
        assert!(alice.on_bytes(&frame).await);

        // Both subscribers of r1 receive the batch
        for rx in [&mut rx_alice, &mut rx_bob] {
            let envelope = next_envelope(rx);
            assert_eq!(envelope["type"], "serverMessages");
            assert_eq!(envelope["payload"]["roomId"], "r1");
            let messages = envelope["payload"]["messages"].as_array().unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0]["content"], "hi all");
            assert_eq!(messages[0]["user"]["username"], "alice");
            assert_eq!(messages[0]["id"], "1"); // store-assigned
        }

        // And it is in the log for late readers
        let batch = services.log.reverse_range("r1", Cursor::Newest, 10).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].content, "hi all");
    }

    #[tokio::test]
    async fn test_fanout_respects_room_isolation() {
        let services = services();
        let (mut alice, mut rx_alice) = authenticated_session(&services, 1, "sid-alice").await;
        let (_bob, mut rx_bob) = authenticated_session(&services, 2, "sid-bob").await;

        // Bob leaves r1; a broadcast to r1 must no longer reach him
        services.pubsub.remove_subscriber("r1", "u-bob");

        let frame = client_frame(&serde_json::json!({
            "type": "clientMessages",
            "payload": {"roomId": "r1", "messages": [{"content": "secret"}]}
        }));
        assert!(alice.on_bytes(&frame).await);

        assert_eq!(next_envelope(&mut rx_alice)["type"], "serverMessages");
        assert!(rx_bob.try_recv().is_err(), "bob is not subscribed to r1");
    }

    #[tokio::test]
    async fn test_identity_takeover_evicts_first_connection() {
        let services = services();
        let (_first, mut rx_first) = authenticated_session(&services, 1, "sid-alice").await;
        let (mut second, mut rx_second) = authenticated_session(&services, 2, "sid-alice").await;

        // First connection got the takeover close
        match rx_first.try_recv() {
            Ok(Outbound::Close { code, .. }) => assert_eq!(code, CLOSE_NORMAL),
            other => panic!("expected takeover close, got {other:?}"),
        }
        assert_eq!(
            services.registry.lookup("u-alice").map(|h| h.conn_id()),
            Some(2)
        );

        // A room broadcast reaches only the second connection
        let frame = client_frame(&serde_json::json!({
            "type": "clientMessages",
            "payload": {"roomId": "r1", "messages": [{"content": "after takeover"}]}
        }));
        assert!(second.on_bytes(&frame).await);
        assert_eq!(next_envelope(&mut rx_second)["type"], "serverMessages");
        assert!(rx_first.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_history_pages_reply_only_to_requester() {
        let services = services();
        // Pre-populate r1 with ids 1..=5
        for i in 1..=5 {
            let mut msg = Message {
                id: 0,
                user_id: "u0".into(),
                username: "seed".into(),
                content: format!("m{i}"),
                timestamp: i,
            };
            services.log.append("r1", &mut msg).await.unwrap();
        }

        let (mut alice, mut rx_alice) = authenticated_session(&services, 1, "sid-alice").await;
        let (_bob, mut rx_bob) = authenticated_session(&services, 2, "sid-bob").await;

        // Page 1: newest, page size 3 -> [5,4,3], more available
        let frame = client_frame(&serde_json::json!({
            "type": "requestRoomHistory",
            "payload": {"roomId": "r1"}
        }));
        assert!(alice.on_bytes(&frame).await);
        let page = next_envelope(&mut rx_alice);
        assert_eq!(page["type"], "serverRoomHistory");
        assert_eq!(page["payload"]["name"], "general");
        assert_eq!(page["payload"]["hasMoreMessages"], true);
        let ids: Vec<&str> = page["payload"]["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["5", "4", "3"]);

        // Page 2: continue before id 3 -> [2,1], no more
        let frame = client_frame(&serde_json::json!({
            "type": "requestRoomHistory",
            "payload": {"roomId": "r1", "firstMessageId": "3"}
        }));
        assert!(alice.on_bytes(&frame).await);
        let page = next_envelope(&mut rx_alice);
        assert_eq!(page["payload"]["hasMoreMessages"], false);
        let ids: Vec<&str> = page["payload"]["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["2", "1"]);

        // No fanout of history
        assert!(rx_bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_room_announces_and_subscribes_everyone() {
        let services = services();
        let (mut alice, mut rx_alice) = authenticated_session(&services, 1, "sid-alice").await;
        let (_bob, mut rx_bob) = authenticated_session(&services, 2, "sid-bob").await;

        let frame = client_frame(&serde_json::json!({
            "type": "clientCreateRoom",
            "payload": {"roomName": "lounge"}
        }));
        assert!(alice.on_bytes(&frame).await);

        let announce_alice = next_envelope(&mut rx_alice);
        let announce_bob = next_envelope(&mut rx_bob);
        assert_eq!(announce_alice["type"], "serverCreateRoom");
        assert_eq!(announce_alice["payload"]["roomName"], "lounge");
        assert_eq!(announce_alice["payload"]["creatorUsername"], "alice");
        assert_eq!(announce_alice, announce_bob);

        let room_id = announce_alice["payload"]["roomId"].as_str().unwrap().to_string();
        assert!(!room_id.is_empty());
        assert_eq!(services.pubsub.subscriber_count(&room_id), 2);
    }

    #[tokio::test]
    async fn test_create_room_collision_replies_empty_to_requester_only() {
        let services = services();
        let (mut alice, mut rx_alice) = authenticated_session(&services, 1, "sid-alice").await;
        let (_bob, mut rx_bob) = authenticated_session(&services, 2, "sid-bob").await;

        for _ in 0..2 {
            let frame = client_frame(&serde_json::json!({
                "type": "clientCreateRoom",
                "payload": {"roomName": "lounge"}
            }));
            assert!(alice.on_bytes(&frame).await);
        }

        let _created = next_envelope(&mut rx_alice);
        let _announced_to_bob = next_envelope(&mut rx_bob);

        let collision = next_envelope(&mut rx_alice);
        assert_eq!(collision["type"], "serverCreateRoom");
        assert_eq!(collision["payload"]["roomId"], "");
        assert!(rx_bob.try_recv().is_err(), "collision reply is not broadcast");
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let services = services();
        let (mut alice, mut rx) = authenticated_session(&services, 1, "sid-alice").await;

        let ping = frame::encode_masked(
            &Frame {
                opcode: Opcode::Ping,
                payload: Bytes::from_static(b"tick"),
            },
            [1, 2, 3, 4],
        );
        assert!(alice.on_bytes(&ping).await);

        match rx.try_recv() {
            Ok(Outbound::Frame(bytes)) => {
                let mut decoder = FrameDecoder::new();
                decoder.extend(&bytes);
                let pong = decoder.next().unwrap().unwrap();
                assert_eq!(pong.opcode, Opcode::Pong);
                assert_eq!(&pong.payload[..], b"tick");
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparsable_envelope_closes_connection() {
        let services = services();
        let (mut alice, mut rx) = authenticated_session(&services, 1, "sid-alice").await;

        let frame = frame::encode_masked(&Frame::text("{broken"), [1, 2, 3, 4]);
        assert!(!alice.on_bytes(&frame).await);
        match rx.try_recv() {
            Ok(Outbound::Close { code, .. }) => assert_eq!(code, CLOSE_PROTOCOL_ERROR),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_connection_open() {
        let services = services();
        let (mut alice, mut rx) = authenticated_session(&services, 1, "sid-alice").await;

        let frame = client_frame(&serde_json::json!({"type": "clientTyping", "payload": {}}));
        assert!(alice.on_bytes(&frame).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_teardown_removes_all_traces_exactly_once() {
        let services = services();
        let (mut alice, _rx) = authenticated_session(&services, 1, "sid-alice").await;
        let (_bob, _rx_bob) = authenticated_session(&services, 2, "sid-bob").await;

        alice.teardown();
        alice.teardown(); // second call is a no-op

        assert!(services.registry.lookup("u-alice").is_none());
        assert!(services.registry.lookup("u-bob").is_some());
        assert_eq!(services.pubsub.subscriber_count("r1"), 1);
        assert_eq!(services.pubsub.subscriber_count("r2"), 1);
    }

    #[tokio::test]
    async fn test_stale_teardown_after_takeover_keeps_new_connection() {
        let services = services();
        let (mut first, _rx1) = authenticated_session(&services, 1, "sid-alice").await;
        let (mut second, mut rx_second) = authenticated_session(&services, 2, "sid-alice").await;

        // The evicted session tears down late; the new registration and the
        // new connection's room subscriptions both stay
        first.teardown();
        assert_eq!(
            services.registry.lookup("u-alice").map(|h| h.conn_id()),
            Some(2)
        );
        assert_eq!(services.pubsub.subscriber_count("r1"), 1);
        assert_eq!(services.pubsub.subscriber_count("r2"), 1);

        // Room broadcasts still reach the surviving connection
        let frame = client_frame(&serde_json::json!({
            "type": "clientMessages",
            "payload": {"roomId": "r1", "messages": [{"content": "still here"}]}
        }));
        assert!(second.on_bytes(&frame).await);
        assert_eq!(next_envelope(&mut rx_second)["type"], "serverMessages");
    }

    #[tokio::test]
    async fn test_messages_for_unknown_room_are_dropped() {
        let services = services();
        let (mut alice, mut rx) = authenticated_session(&services, 1, "sid-alice").await;

        let frame = client_frame(&serde_json::json!({
            "type": "clientMessages",
            "payload": {"roomId": "r-ghost", "messages": [{"content": "hi"}]}
        }));
        assert!(alice.on_bytes(&frame).await, "connection stays open");

        // Nothing delivered and nothing persisted under the unknown key
        assert!(rx.try_recv().is_err());
        let batch = services
            .log
            .reverse_range("r-ghost", Cursor::Newest, 10)
            .await
            .unwrap();
        assert!(batch.messages.is_empty());
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let services = services();
        let (mut alice, mut rx) = authenticated_session(&services, 1, "sid-alice").await;

        let frame = client_frame(&serde_json::json!({
            "type": "requestRoomHistory",
            "payload": {"roomId": "r1"}
        }));
        let (head, tail) = frame.split_at(7);
        assert!(alice.on_bytes(head).await);
        assert!(rx.try_recv().is_err(), "incomplete frame produces nothing");
        assert!(alice.on_bytes(tail).await);
        assert_eq!(next_envelope(&mut rx)["type"], "serverRoomHistory");
    }
}
