//! Virtual-host peek at an inbound HTTP request.
//!
//! Reads just enough of the stream to expose the request line plus the
//! `Host` and `Authorization` headers, keeping every consumed byte so the
//! caller can replay them and the tunneled backend sees the request
//! unmodified.

use burrow_core::{BurrowError, BurrowResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Request heads larger than this are rejected.
const MAX_HEAD_LEN: usize = 8192;

/// The peeked portion of an HTTP request.
#[derive(Debug)]
pub struct RequestHead {
    /// Lowercased `Host` header value (port included when the client sent
    /// one).
    pub host: String,
    /// Raw `Authorization` header value; empty when absent.
    pub authorization: String,
    /// Every byte consumed while peeking, to be replayed.
    pub consumed: Vec<u8>,
}

/// Read and parse the request head off `r`.
pub async fn read_request_head<R: AsyncRead + Unpin>(r: &mut R) -> BurrowResult<RequestHead> {
    let mut consumed = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(end) = find_head_end(&consumed) {
            break end;
        }
        if consumed.len() >= MAX_HEAD_LEN {
            return Err(BurrowError::InvalidMessage("request head too large".into()));
        }
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Err(BurrowError::InvalidMessage(
                "connection closed before request head".into(),
            ));
        }
        consumed.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&consumed[..head_end])
        .map_err(|_| BurrowError::InvalidMessage("request head is not valid utf-8".into()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, _uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m, u, v),
        _ => {
            return Err(BurrowError::InvalidMessage(format!(
                "bad request line: {request_line}"
            )));
        }
    };
    if method.is_empty() || !version.starts_with("HTTP/") {
        return Err(BurrowError::InvalidMessage(format!(
            "bad request line: {request_line}"
        )));
    }

    let mut host = String::new();
    let mut authorization = String::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(BurrowError::InvalidMessage(format!("bad header: {line}")));
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host = value.to_lowercase();
        } else if name.eq_ignore_ascii_case("authorization") {
            authorization = value.to_string();
        }
    }

    if host.is_empty() {
        return Err(BurrowError::InvalidMessage("missing host header".into()));
    }

    Ok(RequestHead {
        host,
        authorization,
        consumed,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
