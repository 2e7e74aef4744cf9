//! Per-client control state machine.
//!
//! Each authenticated client is represented by a [`Control`] running three
//! cooperating tasks: a reader draining framed messages off the control
//! connection, a writer that is the sole writer to it, and a manager
//! dispatching inbound messages and watching the heartbeat. All three
//! observe the exit signal; exit itself runs exactly once and always on a
//! task of its own, so no control task ever joins itself.

use crate::server::Context;
use crate::tunnel::Tunnel;
use burrow_core::messages::*;
use burrow_core::{codec, BurrowError, BurrowResult, Message, WrappedConn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Capacity of the per-client pool of pre-registered proxy connections.
pub const PROXY_POOL_SIZE: usize = 10;

/// How often the manager checks for a missed heartbeat; also the bound on
/// how long a public connection waits for a solicited proxy leg.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a pooled proxy connection may sit idle before its deadline
/// fires on first use. Cleared by the consumer before splicing.
const PROXY_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Server-side session state for one connected client.
pub struct Control {
    id: String,
    auth: AuthRequest,
    conn_id: i64,
    ctx: Arc<Context>,

    /// Outbound messages, drained by the writer task.
    out_tx: mpsc::Sender<Message>,
    /// Pool of pre-registered proxy connections from this client, FIFO.
    /// The lock guards the deque only; it is never held across a wait.
    proxies: Mutex<VecDeque<WrappedConn>>,
    /// Signalled once per pooled connection, waking one dry `get_proxy`
    /// caller.
    proxy_notify: Notify,
    /// Tunnels owned by this control, in registration order.
    tunnels: Mutex<Vec<Arc<Tunnel>>>,

    exiting: AtomicBool,
    exit_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Control {
    /// Start a control for a freshly authenticated connection: install it
    /// in the registry (draining any predecessor with the same client id),
    /// answer the auth request, prime the proxy pool, and spawn the
    /// reader/writer/manager tasks.
    pub async fn start(ctx: Arc<Context>, mut conn: WrappedConn, auth: AuthRequest) {
        let client_id = if auth.client_id.is_empty() {
            burrow_core::next_string_id()
        } else {
            auth.client_id.clone()
        };
        conn.set_type("control");

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let (exit_tx, _) = broadcast::channel(1);

        let ctl = Arc::new(Control {
            id: client_id.clone(),
            auth,
            conn_id: conn.id(),
            ctx: ctx.clone(),
            out_tx: out_tx.clone(),
            proxies: Mutex::new(VecDeque::new()),
            proxy_notify: Notify::new(),
            tunnels: Mutex::new(Vec::new()),
            exiting: AtomicBool::new(false),
            exit_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // Subscribed before the registry swap so an immediate takeover
        // cannot race past a not-yet-listening task.
        let reader_exit = ctl.exit_tx.subscribe();
        let writer_exit = ctl.exit_tx.subscribe();
        let manager_exit = ctl.exit_tx.subscribe();

        // Returns only after any displaced control has fully drained.
        ctx.controls.add(&client_id, ctl.clone()).await;

        info!(client = %client_id, conn = ctl.conn_id, user = %ctl.auth.user, "control started");

        let _ = out_tx
            .send(Message::AuthResponse(AuthResponse {
                client_id: client_id.clone(),
                error_msg: String::new(),
            }))
            .await;
        // One eager proxy leg absorbs the first public connection.
        let _ = out_tx.send(Message::ProxyRequest(ProxyRequest {})).await;

        let (rd, wr) = tokio::io::split(conn);
        let handles = vec![
            tokio::spawn(Self::reader(ctl.clone(), rd, in_tx, reader_exit)),
            tokio::spawn(Self::writer(ctl.clone(), wr, out_rx, writer_exit)),
            tokio::spawn(Self::manager(ctl.clone(), in_rx, manager_exit)),
        ];
        ctl.tasks.lock().await.extend(handles);
    }

    pub fn client_id(&self) -> &str {
        &self.id
    }

    pub fn auth_user(&self) -> &str {
        &self.auth.user
    }

    /// Reads framed messages into the inbox. A per-read deadline catches
    /// half-open connections even when heartbeats stall; EOF ends the task
    /// quietly and the manager picks it up through the closed inbox.
    async fn reader(
        ctl: Arc<Control>,
        mut rd: ReadHalf<WrappedConn>,
        in_tx: mpsc::Sender<Message>,
        mut exit_rx: broadcast::Receiver<()>,
    ) {
        let read_timeout = ctl.ctx.read_timeout();
        loop {
            if ctl.exiting.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = exit_rx.recv() => break,
                res = time::timeout(read_timeout, codec::read_message(&mut rd)) => {
                    match res {
                        Ok(Ok(Some(msg))) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Ok(Ok(None)) => {
                            debug!(client = %ctl.id, "control connection closed by peer");
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!(client = %ctl.id, error = %e, "control read failed");
                            Self::spawn_exit(ctl.clone());
                            break;
                        }
                        Err(_) => {
                            warn!(client = %ctl.id, "control read timed out");
                            Self::spawn_exit(ctl.clone());
                            break;
                        }
                    }
                }
            }
        }
        debug!(client = %ctl.id, "control reader finished");
    }

    /// Sole writer to the control connection.
    async fn writer(
        ctl: Arc<Control>,
        mut wr: WriteHalf<WrappedConn>,
        mut out_rx: mpsc::Receiver<Message>,
        mut exit_rx: broadcast::Receiver<()>,
    ) {
        let write_timeout = ctl.ctx.write_timeout();
        loop {
            if ctl.exiting.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = exit_rx.recv() => break,
                maybe = out_rx.recv() => {
                    let Some(msg) = maybe else { break };
                    match time::timeout(write_timeout, codec::write_message(&mut wr, &msg)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(client = %ctl.id, error = %e, "control write failed");
                            Self::spawn_exit(ctl.clone());
                            break;
                        }
                        Err(_) => {
                            warn!(client = %ctl.id, "control write timed out");
                            Self::spawn_exit(ctl.clone());
                            break;
                        }
                    }
                }
            }
        }
        let _ = wr.shutdown().await;
        debug!(client = %ctl.id, "control writer finished");
    }

    /// Dispatches inbound messages and watches the heartbeat.
    async fn manager(
        ctl: Arc<Control>,
        mut in_rx: mpsc::Receiver<Message>,
        mut exit_rx: broadcast::Receiver<()>,
    ) {
        let mut heartbeat = time::interval_at(
            time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        let mut last_ping = time::Instant::now();

        loop {
            if ctl.exiting.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = exit_rx.recv() => break,
                _ = heartbeat.tick() => {
                    if last_ping.elapsed() > HEARTBEAT_INTERVAL {
                        warn!(client = %ctl.id, "heartbeat lost");
                        Self::spawn_exit(ctl.clone());
                        break;
                    }
                }
                maybe = in_rx.recv() => {
                    let Some(msg) = maybe else {
                        // Reader is gone; nothing more can arrive.
                        Self::spawn_exit(ctl.clone());
                        break;
                    };
                    match msg {
                        Message::Ping(_) => {
                            last_ping = time::Instant::now();
                            ctl.out(Message::Pong(Pong {})).await;
                        }
                        Message::TunnelRequest(req) => {
                            Self::handle_tunnel_request(&ctl, req).await;
                        }
                        other => {
                            debug!(client = %ctl.id, kind = other.type_name(), "ignoring message");
                        }
                    }
                }
            }
        }
        debug!(client = %ctl.id, "control manager finished");
    }

    /// Register one tunnel per protocol named in the request, answering
    /// each attempt individually. A control left with zero tunnels after a
    /// fully failed request has no useful work and exits.
    async fn handle_tunnel_request(ctl: &Arc<Control>, req: TunnelRequest) {
        let mut established = false;

        for proto in req.protocol.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let single = TunnelRequest {
                protocol: proto.to_string(),
                ..req.clone()
            };
            match Tunnel::open(ctl.ctx.clone(), ctl, single).await {
                Ok(tunnel) => {
                    established = true;
                    let url = tunnel.url().to_string();
                    ctl.tunnels.lock().await.push(tunnel);
                    info!(client = %ctl.id, %url, protocol = proto, "tunnel registered");
                    ctl.out(Message::TunnelResponse(TunnelResponse {
                        request_id: req.request_id.clone(),
                        url,
                        protocol: proto.to_string(),
                        error_msg: String::new(),
                    }))
                    .await;
                }
                Err(e) => {
                    warn!(client = %ctl.id, protocol = proto, error = %e, "tunnel registration failed");
                    ctl.out(Message::TunnelResponse(TunnelResponse {
                        request_id: req.request_id.clone(),
                        url: String::new(),
                        protocol: proto.to_string(),
                        error_msg: e.to_string(),
                    }))
                    .await;
                }
            }
        }

        if !established && ctl.tunnels.lock().await.is_empty() {
            info!(client = %ctl.id, "no tunnels established, exiting control");
            Self::spawn_exit(ctl.clone());
        }
    }

    /// Enqueue a message for the writer. Sends after exit are dropped.
    async fn out(&self, msg: Message) {
        if self.exiting.load(Ordering::SeqCst) {
            return;
        }
        if self.out_tx.send(msg).await.is_err() {
            debug!(client = %self.id, "outbox closed, message dropped");
        }
    }

    /// Take a proxy connection from the pool. When the pool is dry, ask
    /// the client for a fresh leg and wait a bounded time for one to
    /// arrive. The pool lock is released before the wait, so concurrent
    /// misses each solicit their own leg and wait independently.
    pub async fn get_proxy(&self) -> BurrowResult<WrappedConn> {
        if let Some(conn) = self.proxies.lock().await.pop_front() {
            return Ok(conn);
        }

        debug!(client = %self.id, "proxy pool dry, soliciting a new leg");
        self.out(Message::ProxyRequest(ProxyRequest {})).await;

        let deadline = time::Instant::now() + HEARTBEAT_INTERVAL;
        loop {
            if self.exiting.load(Ordering::SeqCst) {
                return Err(BurrowError::NoProxyAvailable);
            }
            // Register interest before the re-check so a registration
            // landing in between still wakes this waiter.
            let notified = self.proxy_notify.notified();
            if let Some(conn) = self.proxies.lock().await.pop_front() {
                return Ok(conn);
            }
            tokio::select! {
                _ = notified => {}
                _ = time::sleep_until(deadline) => return Err(BurrowError::NoProxyAvailable),
            }
        }
    }

    /// Add a freshly registered proxy connection to the pool. The pool
    /// never blocks: a full pool (or an exiting control) closes the
    /// connection instead.
    pub async fn register_proxy(&self, mut conn: WrappedConn) -> BurrowResult<()> {
        conn.set_read_timeout(Some(PROXY_IDLE_TIMEOUT));
        conn.set_write_timeout(Some(PROXY_IDLE_TIMEOUT));

        {
            let mut proxies = self.proxies.lock().await;
            // Checked under the pool lock: a concurrent exit either drains
            // this connection or this call observes the flag and rejects.
            if self.exiting.load(Ordering::SeqCst) {
                drop(proxies);
                conn.close().await;
                return Err(BurrowError::Other(format!(
                    "control {} is exiting",
                    self.id
                )));
            }
            if proxies.len() >= PROXY_POOL_SIZE {
                drop(proxies);
                conn.close().await;
                return Err(BurrowError::ProxyBufferFull);
            }
            proxies.push_back(conn);
        }

        self.proxy_notify.notify_one();
        debug!(client = %self.id, "proxy connection pooled");
        Ok(())
    }

    /// Initiate exit without waiting for it; used from inside the control
    /// tasks, which must never join themselves.
    fn spawn_exit(ctl: Arc<Control>) {
        tokio::spawn(async move { ctl.exit().await });
    }

    /// Exit on behalf of a successor holding the same client id. The
    /// registry has already been repointed, so the identity-checked remove
    /// inside [`Control::exit`] leaves the successor in place.
    pub async fn replace(self: Arc<Self>) {
        info!(client = %self.id, conn = self.conn_id, "control replaced by new connection");
        self.exit().await;
    }

    /// Tear the control down exactly once: deregister, signal the tasks,
    /// join them, exit owned tunnels, then drain and close the proxy pool.
    pub async fn exit(self: Arc<Self>) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(client = %self.id, "control exiting");

        self.ctx.controls.remove(&self.id, &self).await;

        let _ = self.exit_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.lock().await.drain(..).collect();
        for tunnel in tunnels {
            tunnel.exit().await;
        }

        // The exiting flag is already visible, so registrations racing this
        // drain are rejected under the same lock.
        let drained: Vec<WrappedConn> = {
            let mut proxies = self.proxies.lock().await;
            proxies.drain(..).collect()
        };
        for mut conn in drained {
            conn.close().await;
        }
        self.proxy_notify.notify_waiters();

        info!(client = %self.id, "control exited");
    }
}
