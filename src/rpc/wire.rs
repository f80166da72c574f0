//! Broadcast RPC wire format
//!
//! Frames are a 4-byte big-endian length followed by a JSON body:
//!
//! ```text
//! +----------------+---------------------------+
//! | u32 length (BE)| json body (length bytes)  |
//! +----------------+---------------------------+
//! ```
//!
//! Requests are a tagged enum keyed by `op`; every request carries the
//! pre-built envelope JSON to deliver, so the endpoint never interprets the
//! payload, it only encodes it into a text frame and routes it.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

/// Upper bound on one RPC frame body
pub const MAX_RPC_FRAME: usize = 1024 * 1024;

/// A broadcast instruction from another node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RpcRequest {
    /// Deliver to each named identity that is connected here
    #[serde(rename_all = "camelCase")]
    PushKeys { keys: Vec<String>, envelope: String },

    /// Deliver to every subscriber of one room
    #[serde(rename_all = "camelCase")]
    BroadcastRoom { room_id: String, envelope: String },

    /// Deliver to every connection on this node. A non-zero `speed` paces
    /// delivery to that many connections per second.
    #[serde(rename_all = "camelCase")]
    BroadcastAll {
        envelope: String,
        #[serde(default)]
        speed: u32,
    },
}

/// Endpoint reply; `delivered` counts queue pushes that succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub ok: bool,
    pub delivered: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn delivered(count: usize) -> Self {
        Self {
            ok: true,
            delivered: count,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            delivered: 0,
            error: Some(reason.into()),
        }
    }
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, body: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(body).map_err(RpcError::BadPayload)?;
    if json.len() > MAX_RPC_FRAME {
        return Err(RpcError::OversizedFrame(json.len()));
    }
    writer.write_all(&(json.len() as u32).to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame. `Ok(None)` means the peer closed
/// cleanly at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RpcError::Io(e)),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_RPC_FRAME {
        return Err(RpcError::OversizedFrame(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let value = serde_json::from_slice(&body).map_err(RpcError::BadPayload)?;
    Ok(Some(value))
}
