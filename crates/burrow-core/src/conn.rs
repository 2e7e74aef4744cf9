//! Wrapped byte-stream connections and listeners.
//!
//! A [`WrappedConn`] carries a process-unique id, a type tag, and the peer
//! address alongside the underlying TCP or TLS stream, plus mutable read
//! and write deadlines and a replay buffer for bytes peeked off the stream
//! by the vhost parser. Listeners accept, wrap, optionally TLS-upgrade,
//! and publish connections on a channel.

use crate::codec;
use crate::error::{BurrowError, BurrowResult};
use crate::id;
use crate::messages::Message;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// The underlying byte stream (enum dispatch, not dyn).
#[derive(Debug)]
enum ConnStream {
    Tcp(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ConnStream::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ConnStream::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ConnStream::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ConnStream::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ConnStream::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A byte-stream connection with an identity and a type tag.
#[derive(Debug)]
pub struct WrappedConn {
    id: i64,
    typ: String,
    peer_addr: Option<SocketAddr>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    replay: Vec<u8>,
    replay_pos: usize,
    closed: bool,
    stream: ConnStream,
}

impl WrappedConn {
    /// Wrap a plain TCP stream, assigning it a fresh connection id.
    pub fn new(stream: TcpStream, typ: &str) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            id: id::next_id(),
            typ: typ.to_string(),
            peer_addr,
            read_timeout: None,
            write_timeout: None,
            replay: Vec::new(),
            replay_pos: 0,
            closed: false,
            stream: ConnStream::Tcp(stream),
        }
    }

    fn from_server_tls(
        stream: tokio_rustls::server::TlsStream<TcpStream>,
        typ: &str,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            id: id::next_id(),
            typ: typ.to_string(),
            peer_addr: Some(peer_addr),
            read_timeout: None,
            write_timeout: None,
            replay: Vec::new(),
            replay_pos: 0,
            closed: false,
            stream: ConnStream::TlsServer(Box::new(stream)),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn type_tag(&self) -> &str {
        &self.typ
    }

    pub fn set_type(&mut self, typ: &str) {
        self.typ = typ.to_string();
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Set or clear (`None`) the deadline applied to each framed read.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Set or clear (`None`) the deadline applied to each framed write.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Hand back bytes already consumed from the stream so that subsequent
    /// reads see them first, in order, before any fresh stream data.
    pub fn replay(&mut self, bytes: Vec<u8>) {
        if self.replay_pos < self.replay.len() {
            let mut rest = self.replay.split_off(self.replay_pos);
            self.replay = bytes;
            self.replay.append(&mut rest);
        } else {
            self.replay = bytes;
        }
        self.replay_pos = 0;
    }

    /// Upgrade the connection to client-side TLS.
    pub async fn start_tls(
        self,
        connector: &tokio_rustls::TlsConnector,
        domain: rustls::pki_types::ServerName<'static>,
    ) -> BurrowResult<Self> {
        let WrappedConn {
            id,
            typ,
            peer_addr,
            read_timeout,
            write_timeout,
            replay,
            replay_pos,
            closed,
            stream,
        } = self;

        let stream = match stream {
            ConnStream::Tcp(tcp) => {
                let tls = connector.connect(domain, tcp).await?;
                ConnStream::TlsClient(Box::new(tls))
            }
            _ => {
                return Err(BurrowError::Other(format!(
                    "connection {id} is already TLS"
                )));
            }
        };

        Ok(WrappedConn {
            id,
            typ,
            peer_addr,
            read_timeout,
            write_timeout,
            replay,
            replay_pos,
            closed,
            stream,
        })
    }

    /// Read one framed message, honoring the read deadline when set.
    pub async fn read_msg(&mut self) -> BurrowResult<Option<Message>> {
        match self.read_timeout {
            Some(t) => time::timeout(t, codec::read_message(self))
                .await
                .map_err(|_| BurrowError::Timeout)?,
            None => codec::read_message(self).await,
        }
    }

    /// Write one framed message, honoring the write deadline when set.
    pub async fn write_msg(&mut self, msg: &Message) -> BurrowResult<()> {
        match self.write_timeout {
            Some(t) => time::timeout(t, codec::write_message(self, msg))
                .await
                .map_err(|_| BurrowError::Timeout)?,
            None => codec::write_message(self, msg).await,
        }
    }

    /// Shut the connection down. Safe to call more than once; dropping the
    /// connection closes it as well.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }
}

impl AsyncRead for WrappedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.replay_pos < this.replay.len() {
            let n = std::cmp::min(buf.remaining(), this.replay.len() - this.replay_pos);
            buf.put_slice(&this.replay[this.replay_pos..this.replay_pos + n]);
            this.replay_pos += n;
            if this.replay_pos == this.replay.len() {
                this.replay = Vec::new();
                this.replay_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for WrappedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// A bound listener publishing accepted, wrapped connections on a channel.
pub struct Listener {
    pub local_addr: SocketAddr,
    pub conns: mpsc::Receiver<WrappedConn>,
}

/// Bind `addr` and start the accept loop.
///
/// Accepted connections are wrapped with `typ`, TLS-accepted when a server
/// config is supplied, and published on the returned listener's channel.
/// Accept errors are logged and the loop continues; the loop stops once
/// the [`Listener`] is dropped.
pub async fn listen(
    addr: &str,
    typ: &str,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> BurrowResult<Listener> {
    // Accept ":port" shorthand for all-interfaces addresses.
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    let tcp = TcpListener::bind(&addr).await?;
    let local_addr = tcp.local_addr()?;
    let (tx, rx) = mpsc::channel(64);
    let typ = typ.to_string();
    let acceptor = tls.map(TlsAcceptor::from);

    tokio::spawn(async move {
        loop {
            if tx.is_closed() {
                break;
            }
            match tcp.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, typ = %typ, "new connection");
                    match &acceptor {
                        Some(acceptor) => {
                            // Handshake per connection so a slow client
                            // cannot stall the accept loop.
                            let acceptor = acceptor.clone();
                            let tx = tx.clone();
                            let typ = typ.clone();
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        let conn = WrappedConn::from_server_tls(
                                            tls_stream, &typ, peer,
                                        );
                                        let _ = tx.send(conn).await;
                                    }
                                    Err(e) => {
                                        warn!(%peer, error = %e, "tls handshake failed");
                                    }
                                }
                            });
                        }
                        None => {
                            if tx.send(WrappedConn::new(stream, &typ)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
        debug!(addr = %local_addr, "listener closed");
    });

    Ok(Listener { local_addr, conns: rx })
}

/// Dial `addr` and wrap the resulting stream with `typ`.
pub async fn dial(addr: &str, typ: &str) -> BurrowResult<WrappedConn> {
    let stream = TcpStream::connect(addr).await?;
    let conn = WrappedConn::new(stream, typ);
    debug!(conn = conn.id(), %addr, typ = %typ, "dialed");
    Ok(conn)
}
