//! Dialing the server: direct, through an HTTP CONNECT proxy, and with
//! optional TLS on top.

use crate::config::ClientSection;
use burrow_core::{conn, BurrowError, BurrowResult, WrappedConn};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Dial the configured server address, tagging the connection with `typ`
/// ("control" or "proxy").
pub(crate) async fn dial_server(
    cfg: &ClientSection,
    typ: &str,
    tls: Option<Arc<rustls::ClientConfig>>,
) -> BurrowResult<WrappedConn> {
    let conn = if cfg.http_proxy.is_empty() {
        conn::dial(&cfg.server_addr, typ).await?
    } else {
        dial_http_proxy(&cfg.http_proxy, &cfg.server_addr, typ).await?
    };

    match tls {
        Some(tls_cfg) => {
            let host = host_of(&cfg.server_addr);
            let domain = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| BurrowError::Other(format!("invalid tls server name: {host}")))?;
            let connector = TlsConnector::from(tls_cfg);
            conn.start_tls(&connector, domain).await
        }
        None => Ok(conn),
    }
}

/// Open a tunnel to `target` through an HTTP CONNECT proxy.
async fn dial_http_proxy(
    proxy_addr: &str,
    target: &str,
    typ: &str,
) -> BurrowResult<WrappedConn> {
    let mut conn = conn::dial(proxy_addr, typ).await?;

    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    conn.write_all(request.as_bytes()).await?;

    // Read the proxy's response head.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 4096 {
            return Err(BurrowError::Transport(
                "oversized CONNECT response from proxy".into(),
            ));
        }
        let n = conn.read(&mut byte).await?;
        if n == 0 {
            return Err(BurrowError::Transport(
                "proxy closed connection during CONNECT".into(),
            ));
        }
        head.push(byte[0]);
    }

    let status_line = std::str::from_utf8(&head)
        .unwrap_or_default()
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(BurrowError::Transport(format!(
            "proxy CONNECT failed: {status_line}"
        )));
    }

    debug!(proxy = %proxy_addr, %target, "CONNECT tunnel established");
    Ok(conn)
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}
