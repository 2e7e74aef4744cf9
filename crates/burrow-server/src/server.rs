//! Server entry: composes the public listeners, the registries, and the
//! tunnel-channel acceptor.

use crate::config::ServerConfig;
use crate::control::Control;
use crate::proxy;
use crate::registry::{ControlRegistry, TunnelRegistry};
use crate::http;
use burrow_core::{conn, BurrowError, BurrowResult, Message, WrappedConn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// State shared by controls, tunnels, and the vhost dispatcher. The
/// registries live here rather than in globals, so server instances spun
/// up side by side (as the tests do) stay self-contained.
pub struct Context {
    pub cfg: ServerConfig,
    pub tunnels: TunnelRegistry,
    pub controls: ControlRegistry,
    /// Effective port of the shared public listener per protocol.
    public_ports: RwLock<HashMap<String, u16>>,
    /// Effective address of the tunnel-channel listener.
    tunnel_addr: RwLock<Option<SocketAddr>>,
}

impl Context {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.conn_read_timeout_sec)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.conn_write_timeout_sec)
    }

    pub async fn public_port(&self, proto: &str) -> Option<u16> {
        self.public_ports.read().await.get(proto).copied()
    }

    async fn set_public_port(&self, proto: &str, port: u16) {
        self.public_ports.write().await.insert(proto.to_string(), port);
    }

    pub async fn tunnel_addr(&self) -> Option<SocketAddr> {
        *self.tunnel_addr.read().await
    }
}

/// The burrow server instance.
pub struct Server {
    ctx: Arc<Context>,
    exiting: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        Self {
            ctx: Arc::new(Context {
                cfg,
                tunnels: TunnelRegistry::new(),
                controls: ControlRegistry::new(),
                public_ports: RwLock::new(HashMap::new()),
                tunnel_addr: RwLock::new(None),
            }),
            exiting: AtomicBool::new(false),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Bind every configured listener, then accept tunnel-channel
    /// connections until [`Server::exit`] is called.
    pub async fn run(&self) -> BurrowResult<()> {
        if !self.ctx.cfg.http_addr.is_empty() {
            let addr =
                http::start_public_listener(self.ctx.clone(), &self.ctx.cfg.http_addr, None)
                    .await?;
            self.ctx.set_public_port("http", addr.port()).await;
        }

        if !self.ctx.cfg.https_addr.is_empty() {
            let tls = load_tls_config(&self.ctx.cfg.tls_crt, &self.ctx.cfg.tls_key)?;
            let addr = http::start_public_listener(
                self.ctx.clone(),
                &self.ctx.cfg.https_addr,
                Some(Arc::new(tls)),
            )
            .await?;
            self.ctx.set_public_port("https", addr.port()).await;
        }

        self.serve_tunnel_channel().await
    }

    async fn serve_tunnel_channel(&self) -> BurrowResult<()> {
        let mut listener =
            conn::listen(&self.ctx.cfg.client_tunnel_addr, "tunnel", None).await?;
        info!(addr = %listener.local_addr, "tunnel channel listening");
        *self.ctx.tunnel_addr.write().await = Some(listener.local_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                maybe = listener.conns.recv() => {
                    let Some(conn) = maybe else { break };
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move { handle_tunnel_conn(ctx, conn).await });
                }
            }
        }

        info!("tunnel channel closed");
        Ok(())
    }

    /// Graceful shutdown: drain every control, then stop the accept loops.
    pub async fn exit(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server exiting");
        self.ctx.controls.exit_all().await;
        let _ = self.shutdown_tx.send(());
        info!("server exited");
    }
}

/// Demux the first message on a fresh tunnel-channel connection:
/// `AuthRequest` starts a control, `ProxyRegister` feeds a proxy pool,
/// anything else closes the connection.
async fn handle_tunnel_conn(ctx: Arc<Context>, mut conn: WrappedConn) {
    conn.set_read_timeout(Some(ctx.read_timeout()));
    let first = match conn.read_msg().await {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            conn.close().await;
            return;
        }
        Err(e) => {
            debug!(conn = conn.id(), error = %e, "tunnel channel handshake failed");
            conn.close().await;
            return;
        }
    };
    // Later framing carries its own per-read deadlines.
    conn.set_read_timeout(None);

    match first {
        Message::AuthRequest(auth) => Control::start(ctx, conn, auth).await,
        Message::ProxyRegister(reg) => proxy::register(&ctx, conn, reg).await,
        other => {
            debug!(conn = conn.id(), kind = other.type_name(), "unexpected first message");
            conn.close().await;
        }
    }
}

fn load_tls_config(cert_path: &str, key_path: &str) -> BurrowResult<rustls::ServerConfig> {
    if cert_path.is_empty() || key_path.is_empty() {
        return Err(BurrowError::Other(
            "https_addr requires tls_crt and tls_key".into(),
        ));
    }

    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| BurrowError::Other(format!("cannot read cert {cert_path}: {e}")))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| BurrowError::Other(format!("cannot read key {key_path}: {e}")))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BurrowError::Other(format!("bad certificate pem: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| BurrowError::Other(format!("bad key pem: {e}")))?
        .ok_or_else(|| BurrowError::Other("no private key found in pem".into()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| BurrowError::Other(format!("tls config: {e}")))
}
