//! End-to-end scenarios over real sockets: a server instance, burrow
//! clients, and raw protocol conversations side by side.

use burrow_client::{Client, ClientSection, TunnelSection};
use burrow_core::messages::*;
use burrow_core::{conn, Message, WrappedConn};
use burrow_server::{Server, ServerConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

const WAIT: Duration = Duration::from_millis(50);
const TRIES: usize = 100;

async fn start_server() -> (Arc<Server>, u16, SocketAddr) {
    let cfg = ServerConfig {
        http_addr: "127.0.0.1:0".into(),
        https_addr: String::new(),
        client_tunnel_addr: "127.0.0.1:0".into(),
        domain: "example.test".into(),
        tls_crt: String::new(),
        tls_key: String::new(),
        conn_read_timeout_sec: 10,
        conn_write_timeout_sec: 10,
    };
    let server = Arc::new(Server::new(cfg));
    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });

    for _ in 0..TRIES {
        let http = server.context().public_port("http").await;
        let tunnel = server.context().tunnel_addr().await;
        if let (Some(http), Some(tunnel)) = (http, tunnel) {
            return (server, http, tunnel);
        }
        time::sleep(WAIT).await;
    }
    panic!("server did not start listening");
}

/// Local backend answering every connection with a fixed HTTP response.
async fn start_hello_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut head = Vec::new();
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nHELLO")
                    .await;
            });
        }
    });
    addr
}

/// Local backend echoing every byte back.
async fn start_echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn client_config(tunnel_addr: SocketAddr, tunnels: HashMap<String, TunnelSection>) -> ClientSection {
    ClientSection {
        server_addr: tunnel_addr.to_string(),
        http_proxy: String::new(),
        auth_token: "test-token".into(),
        tunnels,
    }
}

async fn wait_for_tunnel(client: &Arc<Client>) -> burrow_client::ActiveTunnel {
    for _ in 0..TRIES {
        if let Some(t) = client.tunnels().await.into_iter().next() {
            return t;
        }
        time::sleep(WAIT).await;
    }
    panic!("tunnel was not established");
}

async fn http_get(port: u16, host: &str, authorization: Option<&str>) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut request = format!("GET / HTTP/1.1\r\nHost: {host}\r\n");
    if let Some(auth) = authorization {
        request.push_str(&format!("Authorization: {auth}\r\n"));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn http_tunnel_happy_path() {
    let (server, http_port, tunnel_addr) = start_server().await;
    let backend = start_hello_service().await;

    let mut tunnels = HashMap::new();
    tunnels.insert(
        "web".to_string(),
        TunnelSection {
            sub_domain: "foo".into(),
            protocols: HashMap::from([("http".to_string(), backend.to_string())]),
            ..Default::default()
        },
    );
    let client = Client::new(client_config(tunnel_addr, tunnels));
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    let tunnel = wait_for_tunnel(&client).await;
    assert_eq!(tunnel.public_url, format!("http://foo.example.test:{http_port}"));

    let response = http_get(http_port, &format!("foo.example.test:{http_port}"), None).await;
    assert!(response.starts_with("HTTP/1.0 200 OK"), "got: {response}");
    assert!(response.ends_with("HELLO"), "got: {response}");

    client.exit().await;
    server.exit().await;
}

#[tokio::test]
async fn tcp_tunnel_round_trip() {
    let (server, _http_port, tunnel_addr) = start_server().await;
    let backend = start_echo_service().await;

    let mut tunnels = HashMap::new();
    tunnels.insert(
        "db".to_string(),
        TunnelSection {
            protocols: HashMap::from([("tcp".to_string(), backend.to_string())]),
            remote_port: 0,
            ..Default::default()
        },
    );
    let client = Client::new(client_config(tunnel_addr, tunnels));
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    let tunnel = wait_for_tunnel(&client).await;
    assert!(tunnel.public_url.starts_with("tcp://example.test:"));
    let port: u16 = tunnel.public_url.rsplit(':').next().unwrap().parse().unwrap();
    assert_ne!(port, 0);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let line = b"SELECT 1;\n";
    stream.write_all(line).await.unwrap();

    let mut reply = vec![0u8; line.len()];
    time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .expect("echo reply timed out")
        .unwrap();
    assert_eq!(reply, line);

    client.exit().await;
    server.exit().await;
}

#[tokio::test]
async fn unknown_host_gets_the_exact_404() {
    let (server, http_port, _tunnel_addr) = start_server().await;

    let host = format!("ghost.example.test:{http_port}");
    let response = http_get(http_port, &host, None).await;

    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.0 404 Not Found"), "got: {head}");
    assert!(head.contains(&format!("Content-Length: {}", host.len() + 8)));
    assert_eq!(body, format!("Tunnel {host} not found\n"));

    server.exit().await;
}

#[tokio::test]
async fn malformed_request_gets_the_exact_400() {
    let (server, http_port, _tunnel_addr) = start_server().await;

    let mut stream = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    stream.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    let _ = time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    let response = String::from_utf8_lossy(&response);

    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.0 400 Bad Request"), "got: {head}");
    assert_eq!(body, "Bad Request\n");

    server.exit().await;
}

#[tokio::test]
async fn basic_auth_gate() {
    let (server, http_port, tunnel_addr) = start_server().await;
    let backend = start_hello_service().await;

    let mut tunnels = HashMap::new();
    tunnels.insert(
        "web".to_string(),
        TunnelSection {
            sub_domain: "guarded".into(),
            http_auth: "Basic dXNlcjpwYXNz".into(),
            protocols: HashMap::from([("http".to_string(), backend.to_string())]),
            ..Default::default()
        },
    );
    let client = Client::new(client_config(tunnel_addr, tunnels));
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });
    wait_for_tunnel(&client).await;

    let host = format!("guarded.example.test:{http_port}");

    let no_auth = http_get(http_port, &host, None).await;
    let (head, body) = no_auth.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.0 401 Not Authorized"), "got: {head}");
    assert_eq!(body, "Authorization required\n");

    let wrong = http_get(http_port, &host, Some("Basic d3Jvbmc6d3Jvbmc=")).await;
    assert!(wrong.starts_with("HTTP/1.0 401 Not Authorized"), "got: {wrong}");

    let right = http_get(http_port, &host, Some("Basic dXNlcjpwYXNz")).await;
    assert!(right.starts_with("HTTP/1.0 200 OK"), "got: {right}");
    assert!(right.ends_with("HELLO"), "got: {right}");

    client.exit().await;
    server.exit().await;
}

// ── Raw protocol conversations ───────────────────────────────────────

async fn raw_auth(tunnel_addr: SocketAddr, client_id: &str) -> WrappedConn {
    let mut conn = conn::dial(&tunnel_addr.to_string(), "control").await.unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(5)));
    conn.write_msg(&Message::AuthRequest(AuthRequest {
        user: "raw".into(),
        password: String::new(),
        client_id: client_id.into(),
    }))
    .await
    .unwrap();

    let Some(Message::AuthResponse(resp)) = conn.read_msg().await.unwrap() else {
        panic!("expected AuthResponse");
    };
    assert!(resp.error_msg.is_empty());
    assert_eq!(resp.client_id, client_id);

    // The server primes the pool with one ProxyRequest right after auth.
    let Some(Message::ProxyRequest(_)) = conn.read_msg().await.unwrap() else {
        panic!("expected priming ProxyRequest");
    };

    conn
}

#[tokio::test]
async fn takeover_replaces_the_prior_control() {
    let (server, _http_port, tunnel_addr) = start_server().await;

    let mut first = raw_auth(tunnel_addr, "dup-client").await;
    first
        .write_msg(&Message::TunnelRequest(TunnelRequest {
            request_id: "r1".into(),
            protocol: "http".into(),
            sub_domain: "tk".into(),
            ..Default::default()
        }))
        .await
        .unwrap();
    let Some(Message::TunnelResponse(resp)) = first.read_msg().await.unwrap() else {
        panic!("expected TunnelResponse");
    };
    assert!(resp.error_msg.is_empty(), "first tunnel failed: {}", resp.error_msg);

    // Second control with the same client id: the first is drained and its
    // tunnel deregistered before this one registers, so the same subdomain
    // binds cleanly.
    let mut second = raw_auth(tunnel_addr, "dup-client").await;
    second
        .write_msg(&Message::TunnelRequest(TunnelRequest {
            request_id: "r2".into(),
            protocol: "http".into(),
            sub_domain: "tk".into(),
            ..Default::default()
        }))
        .await
        .unwrap();
    let Some(Message::TunnelResponse(resp)) = second.read_msg().await.unwrap() else {
        panic!("expected TunnelResponse");
    };
    assert!(resp.error_msg.is_empty(), "takeover raised: {}", resp.error_msg);

    // The displaced control's connection is closed by the server.
    let eof = loop {
        match first.read_msg().await {
            Ok(None) => break true,
            Err(burrow_core::BurrowError::Timeout) => break false,
            Err(_) => break true,
            Ok(Some(_)) => continue,
        }
    };
    assert!(eof, "the displaced control was not closed");

    server.exit().await;
}

#[tokio::test]
async fn duplicate_url_is_rejected_across_clients() {
    let (server, _http_port, tunnel_addr) = start_server().await;

    let mut first = raw_auth(tunnel_addr, "owner").await;
    first
        .write_msg(&Message::TunnelRequest(TunnelRequest {
            request_id: "r1".into(),
            protocol: "http".into(),
            sub_domain: "claimed".into(),
            ..Default::default()
        }))
        .await
        .unwrap();
    let Some(Message::TunnelResponse(resp)) = first.read_msg().await.unwrap() else {
        panic!("expected TunnelResponse");
    };
    assert!(resp.error_msg.is_empty());

    let mut second = raw_auth(tunnel_addr, "intruder").await;
    second
        .write_msg(&Message::TunnelRequest(TunnelRequest {
            request_id: "r2".into(),
            protocol: "http".into(),
            sub_domain: "claimed".into(),
            ..Default::default()
        }))
        .await
        .unwrap();
    let Some(Message::TunnelResponse(resp)) = second.read_msg().await.unwrap() else {
        panic!("expected TunnelResponse");
    };
    assert!(resp.error_msg.contains("already registered"), "got: {}", resp.error_msg);

    server.exit().await;
}

#[tokio::test]
async fn zero_tunnel_control_answers_pings() {
    let (server, _http_port, tunnel_addr) = start_server().await;

    let mut conn = raw_auth(tunnel_addr, "idle-client").await;
    conn.write_msg(&Message::Ping(Ping {})).await.unwrap();
    let Some(Message::Pong(_)) = conn.read_msg().await.unwrap() else {
        panic!("expected Pong");
    };

    server.exit().await;
}

#[tokio::test]
async fn eleventh_proxy_registration_is_closed() {
    let (server, _http_port, tunnel_addr) = start_server().await;

    let _control = raw_auth(tunnel_addr, "push").await;

    let mut legs = Vec::new();
    for _ in 0..11 {
        let mut leg = conn::dial(&tunnel_addr.to_string(), "proxy").await.unwrap();
        leg.write_msg(&Message::ProxyRegister(ProxyRegister {
            client_id: "push".into(),
        }))
        .await
        .unwrap();
        legs.push(leg);
    }

    // Give the server a moment to pool or reject every leg, then probe:
    // pooled legs stay open (read times out), the overflow leg is closed.
    time::sleep(Duration::from_millis(300)).await;

    let mut closed = 0;
    let mut open = 0;
    for mut leg in legs {
        leg.set_read_timeout(Some(Duration::from_millis(200)));
        match leg.read_msg().await {
            Err(burrow_core::BurrowError::Timeout) => open += 1,
            Ok(Some(msg)) => panic!("unexpected message on pooled leg: {}", msg.type_name()),
            Ok(None) | Err(_) => closed += 1,
        }
    }
    assert_eq!(closed, 1, "exactly the overflow leg should be closed");
    assert_eq!(open, 10, "the pool should hold ten legs");

    server.exit().await;
}

#[tokio::test]
async fn an_unsupported_protocol_does_not_kill_the_rest_of_the_request() {
    // One TunnelRequest carrying "gopher" and "http": the gopher attempt
    // comes back as an error response, the http attempt registers, and the
    // control stays up because it owns a tunnel.
    let (server, http_port, tunnel_addr) = start_server().await;
    let backend = start_hello_service().await;

    let mut tunnels = HashMap::new();
    tunnels.insert(
        "mixed".to_string(),
        TunnelSection {
            sub_domain: "sturdy".into(),
            protocols: HashMap::from([
                ("gopher".to_string(), backend.to_string()),
                ("http".to_string(), backend.to_string()),
            ]),
            ..Default::default()
        },
    );
    let client = Client::new(client_config(tunnel_addr, tunnels));
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    let tunnel = wait_for_tunnel(&client).await;
    assert_eq!(tunnel.protocol, "http");

    let response = http_get(http_port, &format!("sturdy.example.test:{http_port}"), None).await;
    assert!(response.ends_with("HELLO"), "got: {response}");

    client.exit().await;
    server.exit().await;
}

// ── Heartbeat loss and reconnect ─────────────────────────────────────

/// A byte-level relay between client and server. Muting drops server→client
/// bytes on the connections that exist at mute time (pongs vanish while the
/// client's pings still reach the server) and suppresses their upstream FIN
/// (the server keeps the dead session's control alive until it is taken
/// over). Connections opened after the mute relay normally.
struct Relay {
    addr: SocketAddr,
    seq: Arc<AtomicU64>,
    mute_below: Arc<AtomicU64>,
}

impl Relay {
    async fn start(upstream: SocketAddr) -> Relay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seq = Arc::new(AtomicU64::new(0));
        let mute_below = Arc::new(AtomicU64::new(0));

        let accept_seq = seq.clone();
        let accept_mute = mute_below.clone();
        tokio::spawn(async move {
            loop {
                let Ok((client_side, _)) = listener.accept().await else {
                    break;
                };
                let conn_seq = accept_seq.fetch_add(1, Ordering::SeqCst);
                let mute_below = accept_mute.clone();
                tokio::spawn(async move {
                    let Ok(server_side) = TcpStream::connect(upstream).await else {
                        return;
                    };
                    let (mut cr, mut cw) = client_side.into_split();
                    let (mut sr, mut sw) = server_side.into_split();

                    let up_mute = mute_below.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        loop {
                            match cr.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if sw.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        if conn_seq >= up_mute.load(Ordering::SeqCst) {
                            let _ = sw.shutdown().await;
                        } else {
                            // A muted connection must not deliver EOF
                            // upstream; hold the write half until the
                            // server closes its own side.
                            std::future::pending::<()>().await;
                        }
                    });

                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        loop {
                            match sr.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if conn_seq >= mute_below.load(Ordering::SeqCst)
                                        && cw.write_all(&buf[..n]).await.is_err()
                                    {
                                        break;
                                    }
                                }
                            }
                        }
                        let _ = cw.shutdown().await;
                    });
                });
            }
        });

        Relay {
            addr,
            seq,
            mute_below,
        }
    }

    /// Mute every connection established so far.
    fn mute_existing(&self) {
        self.mute_below
            .store(self.seq.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

#[tokio::test]
async fn client_reconnects_after_heartbeat_loss() {
    let (server, http_port, tunnel_addr) = start_server().await;
    let backend = start_hello_service().await;
    let relay = Relay::start(tunnel_addr).await;

    let mut tunnels = HashMap::new();
    tunnels.insert(
        "web".to_string(),
        TunnelSection {
            sub_domain: "phoenix".into(),
            protocols: HashMap::from([("http".to_string(), backend.to_string())]),
            ..Default::default()
        },
    );
    let client = Client::new(client_config(relay.addr, tunnels));
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    let tunnel = wait_for_tunnel(&client).await;
    let url = tunnel.public_url.clone();
    let client_id = client.client_id().await;
    assert!(!client_id.is_empty());

    let first_ctl = server
        .context()
        .controls
        .get(&client_id)
        .await
        .expect("control registered");

    // Stop delivering pongs. The client's pong check trips within two
    // check intervals and ends the session; the server still sees pings
    // until then, so the old control is alive when the client redials and
    // the reconnect goes through the takeover path.
    relay.mute_existing();

    let mut replaced = false;
    for _ in 0..600 {
        if let Some(ctl) = server.context().controls.get(&client_id).await {
            if !Arc::ptr_eq(&ctl, &first_ctl) {
                replaced = true;
                break;
            }
        }
        time::sleep(WAIT).await;
    }
    assert!(replaced, "server never replaced the lost session's control");

    // The prior control's tunnel was deregistered before the new session's
    // registration, so the same subdomain binds again under the same
    // client id.
    let mut reestablished = false;
    for _ in 0..TRIES {
        if client.tunnels().await.iter().any(|t| t.public_url == url) {
            reestablished = true;
            break;
        }
        time::sleep(WAIT).await;
    }
    assert!(reestablished, "tunnel was not reestablished after reconnect");
    assert_eq!(client.client_id().await, client_id);

    let response = http_get(http_port, &format!("phoenix.example.test:{http_port}"), None).await;
    assert!(response.ends_with("HELLO"), "got: {response}");

    client.exit().await;
    server.exit().await;
}
