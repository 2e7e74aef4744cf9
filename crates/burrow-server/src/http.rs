//! Public HTTP/HTTPS front door.
//!
//! One shared listener per protocol. Each accepted connection is peeked
//! for its Host header, matched against the tunnel registry, gated on the
//! tunnel's basic-auth requirement, and handed to the tunnel. Rejections
//! use fixed HTTP/1.0 responses.

use crate::server::Context;
use crate::vhost;
use burrow_core::{conn, BurrowResult, WrappedConn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time;
use tracing::{debug, info};

pub(crate) const NOT_AUTHORIZED: &str = "HTTP/1.0 401 Not Authorized\r\n\
WWW-Authenticate: Basic realm=\"ngrok\"\r\n\
Content-Length: 23\r\n\
\r\n\
Authorization required\n";

pub(crate) const BAD_REQUEST: &str = "HTTP/1.0 400 Bad Request\r\n\
Content-Length: 12\r\n\
\r\n\
Bad Request\n";

/// 404 for an unknown host. The Content-Length of `len(host)+8` undercounts
/// the body; it is part of the wire contract and kept as-is.
pub(crate) fn not_found(host: &str) -> String {
    format!(
        "HTTP/1.0 404 Not Found\r\nContent-Length: {}\r\n\r\nTunnel {} not found\n",
        host.len() + 8,
        host
    )
}

/// Start the shared public listener for `http` (no TLS config) or `https`
/// (with one). Returns the bound address so OS-assigned ports can be
/// reflected into public URLs.
pub async fn start_public_listener(
    ctx: Arc<Context>,
    addr: &str,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> BurrowResult<SocketAddr> {
    let proto = if tls.is_some() { "https" } else { "http" };
    let mut listener = conn::listen(addr, "public", tls).await?;
    let local_addr = listener.local_addr;
    info!(proto, addr = %local_addr, "public listener started");

    tokio::spawn(async move {
        while let Some(conn) = listener.conns.recv().await {
            let ctx = ctx.clone();
            tokio::spawn(async move { dispatch_public(ctx, conn, proto).await });
        }
        debug!(proto, "public listener loop ended");
    });

    Ok(local_addr)
}

async fn dispatch_public(ctx: Arc<Context>, mut conn: WrappedConn, proto: &'static str) {
    let head = match time::timeout(ctx.read_timeout(), vhost::read_request_head(&mut conn)).await
    {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            debug!(conn = conn.id(), error = %e, "bad public request");
            let _ = conn.write_all(BAD_REQUEST.as_bytes()).await;
            conn.close().await;
            return;
        }
        Err(_) => {
            debug!(conn = conn.id(), "public request head timed out");
            let _ = conn.write_all(BAD_REQUEST.as_bytes()).await;
            conn.close().await;
            return;
        }
    };

    // Subsequent reads replay the peeked bytes, then the live stream.
    conn.replay(head.consumed);

    let url = format!("{proto}://{}", head.host);
    let Some(tunnel) = ctx.tunnels.get(&url).await else {
        debug!(host = %head.host, "no tunnel for host");
        let _ = conn.write_all(not_found(&head.host).as_bytes()).await;
        conn.close().await;
        return;
    };

    if tunnel.requires_auth() && tunnel.http_auth() != head.authorization {
        debug!(host = %head.host, "public request failed authentication");
        let _ = conn.write_all(NOT_AUTHORIZED.as_bytes()).await;
        conn.close().await;
        return;
    }

    tunnel.handle_public(conn).await;
}
