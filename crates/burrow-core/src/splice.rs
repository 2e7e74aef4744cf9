//! Bidirectional connection splicing.

use crate::conn::WrappedConn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes between `a` and `b` in both directions until either side
/// reaches EOF or fails, then close both connections. Half-close is not
/// supported: the first direction to finish tears the whole splice down,
/// so neither peer is left blocked on a dead counterpart.
///
/// Returns the byte counts copied a→b and b→a.
pub async fn join(a: WrappedConn, b: WrappedConn) -> (u64, u64) {
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);

    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let mut forward = tokio::spawn(pipe(ar, bw, a_to_b.clone()));
    let mut backward = tokio::spawn(pipe(br, aw, b_to_a.clone()));

    // Dropping the aborted task's halves closes both underlying streams.
    tokio::select! {
        _ = &mut forward => {
            backward.abort();
            let _ = backward.await;
        }
        _ = &mut backward => {
            forward.abort();
            let _ = forward.await;
        }
    }

    (a_to_b.load(Ordering::Relaxed), b_to_a.load(Ordering::Relaxed))
}

async fn pipe<R, W>(mut from: R, mut to: W, copied: Arc<AtomicU64>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = to.write_all(&buf[..n]).await {
                    debug!(error = %e, "splice write ended");
                    break;
                }
                copied.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(error = %e, "splice read ended");
                break;
            }
        }
    }
    let _ = to.shutdown().await;
}
