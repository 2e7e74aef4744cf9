//! Length-prefixed JSON framing for the control and proxy channels.
//!
//! Wire format: `[8-byte little-endian length][JSON envelope]` where the
//! envelope is `{"Type": "...", "Payload": {...}}`. Decoding is a two-step
//! dispatch: the envelope first, then the payload against the shape
//! registered for its `Type`, so an unknown type and a malformed payload
//! are distinguishable errors.

use crate::error::{BurrowError, BurrowResult};
use crate::messages::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: u64 = 1 << 20;

#[derive(Serialize)]
struct WireOut<'a, T: Serialize> {
    #[serde(rename = "Type")]
    type_name: &'a str,
    #[serde(rename = "Payload")]
    payload: &'a T,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "Type")]
    type_name: String,
    #[serde(rename = "Payload", default)]
    payload: serde_json::Value,
}

/// Serialize a message into its envelope bytes (no length prefix).
pub fn pack(msg: &Message) -> BurrowResult<Vec<u8>> {
    fn env<T: Serialize>(name: &str, payload: &T) -> BurrowResult<Vec<u8>> {
        serde_json::to_vec(&WireOut {
            type_name: name,
            payload,
        })
        .map_err(|e| BurrowError::Other(format!("encode {name}: {e}")))
    }

    match msg {
        Message::AuthRequest(m) => env("AuthRequest", m),
        Message::AuthResponse(m) => env("AuthResponse", m),
        Message::TunnelRequest(m) => env("TunnelRequest", m),
        Message::TunnelResponse(m) => env("TunnelResponse", m),
        Message::ProxyRegister(m) => env("ProxyRegister", m),
        Message::ProxyRequest(m) => env("ProxyRequest", m),
        Message::ProxyStart(m) => env("ProxyStart", m),
        Message::Ping(m) => env("Ping", m),
        Message::Pong(m) => env("Pong", m),
    }
}

/// Decode envelope bytes (no length prefix) into a typed message.
pub fn unpack(buf: &[u8]) -> BurrowResult<Message> {
    let env: WireIn =
        serde_json::from_slice(buf).map_err(|e| BurrowError::MalformedFrame(e.to_string()))?;

    fn payload<T: DeserializeOwned>(name: &str, value: serde_json::Value) -> BurrowResult<T> {
        serde_json::from_value(value)
            .map_err(|e| BurrowError::MalformedPayload(name.to_string(), e.to_string()))
    }

    Ok(match env.type_name.as_str() {
        "AuthRequest" => Message::AuthRequest(payload("AuthRequest", env.payload)?),
        "AuthResponse" => Message::AuthResponse(payload("AuthResponse", env.payload)?),
        "TunnelRequest" => Message::TunnelRequest(payload("TunnelRequest", env.payload)?),
        "TunnelResponse" => Message::TunnelResponse(payload("TunnelResponse", env.payload)?),
        "ProxyRegister" => Message::ProxyRegister(payload("ProxyRegister", env.payload)?),
        "ProxyRequest" => Message::ProxyRequest(payload("ProxyRequest", env.payload)?),
        "ProxyStart" => Message::ProxyStart(payload("ProxyStart", env.payload)?),
        "Ping" => Message::Ping(payload("Ping", env.payload)?),
        "Pong" => Message::Pong(payload("Pong", env.payload)?),
        other => return Err(BurrowError::UnknownType(other.to_string())),
    })
}

/// Encode a message into a complete length-prefixed frame.
pub fn encode(msg: &Message) -> BurrowResult<Vec<u8>> {
    let payload = pack(msg)?;
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Read one framed message off `r`.
///
/// Short reads are retried until the frame is complete; streams are under
/// no obligation to deliver a frame in one read. A clean EOF before the
/// length prefix returns `None`; EOF inside a frame is a malformed frame.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> BurrowResult<Option<Message>> {
    let mut len_buf = [0u8; 8];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u64::from_le_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(BurrowError::MalformedFrame(format!(
            "frame length {len} out of range"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    match r.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(BurrowError::MalformedFrame(format!(
                "expected {len} payload bytes, stream ended early"
            )));
        }
        Err(e) => return Err(e.into()),
    }

    unpack(&buf).map(Some)
}

/// Write one framed message to `w` and flush it.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> BurrowResult<()> {
    let frame = encode(msg)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}
