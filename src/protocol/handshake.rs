//! WebSocket opening handshake
//!
//! The client opens with a standard HTTP Upgrade request:
//!
//! ```text
//! GET /ws HTTP/1.1
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Cookie: sid=abc123
//! ```
//!
//! The server answers `101 Switching Protocols` with the accept value
//! derived from the key: `base64(sha1(key + MAGIC))`. Parsing is
//! incremental: [`UpgradeRequest::parse`] returns `Ok(None)` until the
//! full header block (terminated by a blank line) has arrived.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

/// Fixed GUID appended to the client key before hashing (RFC 6455)
pub const ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A parsed HTTP Upgrade request
#[derive(Debug)]
pub struct UpgradeRequest {
    path: String,
    /// Header names are stored lowercased
    headers: HashMap<String, String>,
}

impl UpgradeRequest {
    /// Try to parse an upgrade request from the accumulated bytes.
    ///
    /// Returns `Ok(None)` while the terminating blank line has not arrived
    /// yet. On success returns the request and the number of bytes consumed;
    /// anything past that belongs to the frame stream.
    pub fn parse(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>, HandshakeError> {
        let Some(end) = find_header_end(buf) else {
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..end]).map_err(|_| HandshakeError::Malformed)?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().ok_or(HandshakeError::Malformed)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(HandshakeError::Malformed)?;
        let path = parts.next().ok_or(HandshakeError::Malformed)?;
        if method != "GET" {
            return Err(HandshakeError::Malformed);
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or(HandshakeError::Malformed)?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Some((
            UpgradeRequest {
                path: path.to_string(),
                headers,
            },
            end + 4,
        )))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// The `Sec-WebSocket-Key` value; its absence fails the handshake
    pub fn websocket_key(&self) -> Result<&str, HandshakeError> {
        self.header("sec-websocket-key")
            .ok_or(HandshakeError::MissingKey)
    }

    /// The `sid` value from the Cookie header, if any
    pub fn session_id(&self) -> Option<&str> {
        self.header("cookie").and_then(extract_sid)
    }
}

/// Locate the `\r\n\r\n` header terminator
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Pull the `sid=` value out of a Cookie header
pub fn extract_sid(cookie: &str) -> Option<&str> {
    for part in cookie.split(';') {
        if let Some((name, value)) = part.split_once('=') {
            if name.trim() == "sid" && !value.is_empty() {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Compute the `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response
pub fn build_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "GET /ws HTTP/1.1\r\n\
        Host: chat.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Cookie: theme=dark; sid=abc123; lang=en\r\n\r\n";

    #[test]
    fn test_accept_key_rfc_vector() {
        // Worked example from RFC 6455 section 1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_parse_complete_request() {
        let (req, consumed) = UpgradeRequest::parse(REQUEST.as_bytes())
            .unwrap()
            .expect("complete request");
        assert_eq!(consumed, REQUEST.len());
        assert_eq!(req.path(), "/ws");
        assert_eq!(req.websocket_key().unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(req.session_id(), Some("abc123"));
        assert_eq!(req.header("UPGRADE"), Some("websocket"));
    }

    #[test]
    fn test_parse_incremental() {
        // No blank line yet: not an error, just incomplete
        let partial = &REQUEST.as_bytes()[..REQUEST.len() - 3];
        assert!(UpgradeRequest::parse(partial).unwrap().is_none());
    }

    #[test]
    fn test_consumed_excludes_pipelined_bytes() {
        let mut bytes = REQUEST.as_bytes().to_vec();
        bytes.extend_from_slice(&[0x81, 0x00]); // a frame right behind the handshake
        let (_, consumed) = UpgradeRequest::parse(&bytes).unwrap().unwrap();
        assert_eq!(consumed, REQUEST.len());
    }

    #[test]
    fn test_missing_key() {
        let request = "GET /ws HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = UpgradeRequest::parse(request.as_bytes()).unwrap().unwrap();
        assert!(matches!(req.websocket_key(), Err(HandshakeError::MissingKey)));
    }

    #[test]
    fn test_non_get_rejected() {
        let request = "POST /ws HTTP/1.1\r\n\r\n";
        assert!(UpgradeRequest::parse(request.as_bytes()).is_err());
    }

    #[test]
    fn test_extract_sid() {
        assert_eq!(extract_sid("sid=xyz"), Some("xyz"));
        assert_eq!(extract_sid("a=1; sid=xyz; b=2"), Some("xyz"));
        assert_eq!(extract_sid("a=1; b=2"), None);
        assert_eq!(extract_sid("sid="), None);
    }

    #[test]
    fn test_build_response() {
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(response.ends_with("\r\n\r\n"));
    }
}
