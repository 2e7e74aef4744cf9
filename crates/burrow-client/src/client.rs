//! The burrow client: control session, heartbeat, and tunnel table.

use crate::backoff::Backoff;
use crate::config::{ClientSection, TunnelSection};
use crate::{proxy, transport};
use burrow_core::messages::*;
use burrow_core::{codec, BurrowError, BurrowResult, Message, WrappedConn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{debug, error, info, warn};

/// How often the client pings the server.
pub const PING_INTERVAL: Duration = Duration::from_secs(3);
/// How often the client checks that pongs are keeping up with pings.
const PONG_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Deadline for the server's AuthResponse.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// A tunnel the server has established for this client.
#[derive(Debug, Clone)]
pub struct ActiveTunnel {
    pub public_url: String,
    pub local_addr: String,
    pub protocol: String,
}

/// The burrow client. Create with [`Client::new`], drive with
/// [`Client::run`], stop with [`Client::exit`].
pub struct Client {
    pub(crate) cfg: ClientSection,
    pub(crate) tls: Option<Arc<rustls::ClientConfig>>,
    /// Server-assigned client id, kept across reconnects so the server can
    /// replace the previous control.
    pub(crate) id: Mutex<String>,
    /// Established tunnels keyed by public URL; proxy legs resolve their
    /// local address here.
    tunnels: Mutex<HashMap<String, ActiveTunnel>>,
    last_pong: Mutex<time::Instant>,
    exiting: AtomicBool,
    exit_tx: broadcast::Sender<()>,
}

impl Client {
    pub fn new(cfg: ClientSection) -> Arc<Self> {
        Self::with_tls(cfg, None)
    }

    /// A client that upgrades its server connections to TLS. The config
    /// surface carries no TLS switch; callers that terminate TLS on the
    /// tunnel channel supply their own `rustls` config here.
    pub fn with_tls(cfg: ClientSection, tls: Option<Arc<rustls::ClientConfig>>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            tls,
            id: Mutex::new(String::new()),
            tunnels: Mutex::new(HashMap::new()),
            last_pong: Mutex::new(time::Instant::now()),
            exiting: AtomicBool::new(false),
            exit_tx: broadcast::channel(1).0,
        })
    }

    /// The server-assigned client id (empty before the first session).
    pub async fn client_id(&self) -> String {
        self.id.lock().await.clone()
    }

    /// Snapshot of the established tunnels.
    pub async fn tunnels(&self) -> Vec<ActiveTunnel> {
        self.tunnels.lock().await.values().cloned().collect()
    }

    pub(crate) async fn lookup_tunnel(&self, url: &str) -> Option<ActiveTunnel> {
        self.tunnels.lock().await.get(url).cloned()
    }

    /// Run sessions against the server until [`Client::exit`] is called,
    /// reconnecting with exponential backoff. Gives up and returns the
    /// last error after the backoff's failure budget is spent; a session
    /// that reached steady state (authenticated with at least one tunnel
    /// established) resets the budget.
    pub async fn run(self: Arc<Self>) -> BurrowResult<()> {
        let mut backoff = Backoff::default();

        loop {
            let steady = AtomicBool::new(false);
            let result = Self::session(&self, &steady).await;

            if self.exiting.load(Ordering::SeqCst) {
                info!("client exited");
                return Ok(());
            }

            let err = match result {
                Ok(()) => BurrowError::Other("session ended".into()),
                Err(e) => e,
            };
            warn!(error = %err, "session ended");

            if steady.load(Ordering::SeqCst) {
                backoff.reset();
            }
            let Some(delay) = backoff.next_delay() else {
                error!(
                    failures = backoff.max_failures(),
                    "giving up after too many failed sessions"
                );
                return Err(err);
            };

            debug!(delay_ms = delay.as_millis() as u64, "reconnecting");
            let mut exit_rx = self.exit_tx.subscribe();
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = exit_rx.recv() => return Ok(()),
            }
        }
    }

    /// One control session: dial, authenticate, request tunnels, then run
    /// the read loop and heartbeat until either fails or exit is called.
    async fn session(client: &Arc<Self>, steady: &AtomicBool) -> BurrowResult<()> {
        let mut conn = transport::dial_server(&client.cfg, "control", client.tls.clone()).await?;

        let auth = AuthRequest {
            user: client.cfg.auth_token.clone(),
            password: String::new(),
            client_id: client.id.lock().await.clone(),
        };
        conn.write_msg(&Message::AuthRequest(auth)).await?;

        conn.set_read_timeout(Some(AUTH_TIMEOUT));
        let resp = match conn.read_msg().await? {
            Some(Message::AuthResponse(resp)) => resp,
            Some(other) => {
                return Err(BurrowError::InvalidMessage(format!(
                    "expected AuthResponse, got {}",
                    other.type_name()
                )));
            }
            None => {
                return Err(BurrowError::Transport(
                    "server closed the connection during auth".into(),
                ));
            }
        };
        conn.set_read_timeout(None);

        if !resp.error_msg.is_empty() {
            error!(error = %resp.error_msg, "authentication rejected");
            return Err(BurrowError::AuthFailed(resp.error_msg));
        }
        *client.id.lock().await = resp.client_id.clone();
        info!(client = %resp.client_id, "control connection established");

        // Request every configured tunnel; responses are matched back up
        // by request id.
        let mut requests: HashMap<String, TunnelSection> = HashMap::new();
        for (name, tunnel_cfg) in &client.cfg.tunnels {
            let protocols: Vec<&str> = tunnel_cfg.protocols.keys().map(String::as_str).collect();
            let request = TunnelRequest {
                request_id: burrow_core::next_string_id(),
                protocol: protocols.join(","),
                host_name: tunnel_cfg.host_name.clone(),
                sub_domain: tunnel_cfg.sub_domain.clone(),
                http_auth: tunnel_cfg.http_auth.clone(),
                remote_port: tunnel_cfg.remote_port,
            };
            debug!(tunnel = %name, request = %request.request_id, "requesting tunnel");
            conn.write_msg(&Message::TunnelRequest(request.clone())).await?;
            requests.insert(request.request_id, tunnel_cfg.clone());
        }

        client.tunnels.lock().await.clear();
        *client.last_pong.lock().await = time::Instant::now();

        // The heartbeat owns the write half from here on; the read loop
        // owns the read half. Ending the select drops both, closing the
        // control connection.
        let (rd, wr) = tokio::io::split(conn);
        let mut exit_rx = client.exit_tx.subscribe();
        tokio::select! {
            res = Self::read_loop(client, rd, &requests, steady) => res,
            res = client.heartbeat(wr) => res,
            _ = exit_rx.recv() => Ok(()),
        }
    }

    async fn read_loop(
        client: &Arc<Self>,
        mut rd: ReadHalf<WrappedConn>,
        requests: &HashMap<String, TunnelSection>,
        steady: &AtomicBool,
    ) -> BurrowResult<()> {
        loop {
            let msg = match codec::read_message(&mut rd).await? {
                Some(msg) => msg,
                None => {
                    return Err(BurrowError::Transport(
                        "server closed the control connection".into(),
                    ));
                }
            };

            match msg {
                Message::Pong(_) => {
                    *client.last_pong.lock().await = time::Instant::now();
                }
                Message::TunnelResponse(resp) => {
                    if !resp.error_msg.is_empty() {
                        error!(request = %resp.request_id, error = %resp.error_msg, "tunnel rejected");
                        continue;
                    }
                    let Some(tunnel_cfg) = requests.get(&resp.request_id) else {
                        warn!(request = %resp.request_id, "response for unknown tunnel request");
                        continue;
                    };
                    let Some(local_addr) = tunnel_cfg.protocols.get(&resp.protocol) else {
                        warn!(
                            request = %resp.request_id,
                            protocol = %resp.protocol,
                            "response for unrequested protocol"
                        );
                        continue;
                    };
                    let tunnel = ActiveTunnel {
                        public_url: resp.url.clone(),
                        local_addr: local_addr.clone(),
                        protocol: resp.protocol.clone(),
                    };
                    info!(url = %tunnel.public_url, local = %tunnel.local_addr, "tunnel established");
                    client.tunnels.lock().await.insert(resp.url, tunnel);
                    steady.store(true, Ordering::SeqCst);
                }
                Message::ProxyRequest(_) => {
                    tokio::spawn(proxy::run_leg(client.clone()));
                }
                other => {
                    debug!(kind = other.type_name(), "ignoring message");
                }
            }
        }
    }

    /// Pings every 3 s and verifies the server's pongs keep pace. The
    /// heartbeat task is the sole writer to the control connection once
    /// the session reaches steady state.
    async fn heartbeat(
        &self,
        mut wr: tokio::io::WriteHalf<WrappedConn>,
    ) -> BurrowResult<()> {
        let mut ping = time::interval_at(time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
        let mut pong_check = time::interval_at(
            time::Instant::now() + PONG_CHECK_INTERVAL,
            PONG_CHECK_INTERVAL,
        );
        let mut last_ping = time::Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    codec::write_message(&mut wr, &Message::Ping(Ping {})).await?;
                    last_ping = time::Instant::now();
                }
                _ = pong_check.tick() => {
                    let last_pong = *self.last_pong.lock().await;
                    if last_ping.saturating_duration_since(last_pong) > 2 * PING_INTERVAL {
                        error!("no pong from server, ending session");
                        return Err(BurrowError::HeartbeatLoss);
                    }
                }
            }
        }
    }

    /// Stop the client: the current session ends and [`Client::run`]
    /// returns without reconnecting.
    pub async fn exit(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.exit_tx.send(());
        info!("client exiting");
    }
}
