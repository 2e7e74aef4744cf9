//! Tunnels: one public-URL registration bound to one client and protocol.
//!
//! TCP tunnels own a listening socket and accept loop; HTTP/HTTPS tunnels
//! are resolved by the vhost dispatcher against the shared public
//! listener. Either way a matched public connection is handed to
//! [`Tunnel::handle_public`], which pairs it with a proxy leg and splices.

use crate::control::Control;
use crate::server::Context;
use burrow_core::messages::{ProxyStart, TunnelRequest};
use burrow_core::{splice, BurrowError, BurrowResult, Message, WrappedConn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A single registered tunnel.
pub struct Tunnel {
    req: TunnelRequest,
    url: String,
    ctx: Arc<Context>,
    /// The owning control. A relation, not ownership: the control owns its
    /// tunnels, and every tunnel loop observes the exit signal.
    ctl: Weak<Control>,
    /// Bound address for TCP tunnels (reflects an OS-assigned port).
    local_addr: Option<SocketAddr>,
    exiting: AtomicBool,
    exit_tx: broadcast::Sender<()>,
}

impl Tunnel {
    /// Register a tunnel for a single-protocol request and start serving
    /// it. Duplicate URLs and unknown protocols are reported back to the
    /// requesting client as tunnel errors.
    pub async fn open(
        ctx: Arc<Context>,
        ctl: &Arc<Control>,
        req: TunnelRequest,
    ) -> BurrowResult<Arc<Tunnel>> {
        match req.protocol.as_str() {
            "tcp" => Self::open_tcp(ctx, ctl, req).await,
            "http" | "https" => Self::open_vhost(ctx, ctl, req).await,
            other => Err(BurrowError::UnsupportedProtocol(other.to_string())),
        }
    }

    async fn open_tcp(
        ctx: Arc<Context>,
        ctl: &Arc<Control>,
        req: TunnelRequest,
    ) -> BurrowResult<Arc<Tunnel>> {
        let listener = TcpListener::bind(("0.0.0.0", req.remote_port)).await?;
        let local_addr = listener.local_addr()?;
        let url = format!(
            "tcp://{}:{}",
            ctx.cfg.domain.to_lowercase(),
            local_addr.port()
        );

        let (exit_tx, exit_rx) = broadcast::channel(1);
        let tunnel = Arc::new(Tunnel {
            req,
            url: url.clone(),
            ctx: ctx.clone(),
            ctl: Arc::downgrade(ctl),
            local_addr: Some(local_addr),
            exiting: AtomicBool::new(false),
            exit_tx,
        });

        // Register before serving; a duplicate URL drops the listener.
        ctx.tunnels.register(&url, tunnel.clone()).await?;
        tunnel.clone().spawn_accept_loop(listener, exit_rx);

        Ok(tunnel)
    }

    async fn open_vhost(
        ctx: Arc<Context>,
        ctl: &Arc<Control>,
        req: TunnelRequest,
    ) -> BurrowResult<Arc<Tunnel>> {
        let proto = req.protocol.clone();
        let port = ctx.public_port(&proto).await.ok_or_else(|| {
            BurrowError::Other(format!("not listening for {proto} connections"))
        })?;
        let url = derive_public_url(&req, &proto, &ctx.cfg.domain, port);

        let (exit_tx, _) = broadcast::channel(1);
        let tunnel = Arc::new(Tunnel {
            req,
            url: url.clone(),
            ctx: ctx.clone(),
            ctl: Arc::downgrade(ctl),
            local_addr: None,
            exiting: AtomicBool::new(false),
            exit_tx,
        });

        ctx.tunnels.register(&url, tunnel.clone()).await?;
        Ok(tunnel)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Bound address of a TCP tunnel's listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn requires_auth(&self) -> bool {
        !self.req.http_auth.is_empty()
    }

    pub fn http_auth(&self) -> &str {
        &self.req.http_auth
    }

    fn spawn_accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut exit_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = exit_rx.recv() => break,
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            debug!(url = %self.url, %peer, "public connection accepted");
                            let conn = WrappedConn::new(stream, "public");
                            let tunnel = self.clone();
                            tokio::spawn(async move { tunnel.handle_public(conn).await });
                        }
                        Err(e) => {
                            warn!(url = %self.url, error = %e, "accept failed");
                        }
                    }
                }
            }
            debug!(url = %self.url, "tunnel accept loop ended");
        });
    }

    /// Pair a public connection with a proxy leg from the owning client,
    /// announce the pairing on the leg, and splice the two together.
    pub async fn handle_public(self: Arc<Self>, mut pub_conn: WrappedConn) {
        let Some(ctl) = self.ctl.upgrade() else {
            pub_conn.close().await;
            return;
        };

        let mut proxy_conn = match ctl.get_proxy().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(url = %self.url, error = %e, "dropping public connection");
                pub_conn.close().await;
                return;
            }
        };

        let start = Message::ProxyStart(ProxyStart {
            url: self.url.clone(),
            client_addr: pub_conn
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        });
        if let Err(e) = proxy_conn.write_msg(&start).await {
            warn!(url = %self.url, error = %e, "proxy start failed");
            pub_conn.close().await;
            proxy_conn.close().await;
            return;
        }

        proxy_conn.set_read_timeout(None);
        proxy_conn.set_write_timeout(None);

        let (to_client, to_public) = splice::join(pub_conn, proxy_conn).await;
        debug!(url = %self.url, to_client, to_public, "public connection finished");
    }

    /// Stop serving and deregister. Idempotent.
    pub async fn exit(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        // The accept loop owns the listener; the signal ends the loop and
        // dropping the listener closes the socket.
        let _ = self.exit_tx.send(());
        self.ctx.tunnels.remove(&self.url).await;
        info!(url = %self.url, "tunnel closed");
    }
}

/// Public URL for an HTTP/HTTPS tunnel request: an explicit hostname wins,
/// then an explicit subdomain, then a generated one; the latter two are
/// hosted under `domain` at the shared listener's effective port.
pub(crate) fn derive_public_url(
    req: &TunnelRequest,
    proto: &str,
    domain: &str,
    port: u16,
) -> String {
    let vhost = format!("{}:{}", domain.to_lowercase(), port);

    let host_name = req.host_name.trim().to_lowercase();
    if !host_name.is_empty() {
        return format!("{proto}://{host_name}");
    }

    let sub_domain = req.sub_domain.trim().to_lowercase();
    if !sub_domain.is_empty() {
        return format!("{proto}://{sub_domain}.{vhost}");
    }

    format!("{proto}://{}.{vhost}", burrow_core::next_id())
}
