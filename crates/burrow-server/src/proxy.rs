//! Proxy-leg handshake: attach a fresh client connection to its control.

use crate::server::Context;
use burrow_core::messages::ProxyRegister;
use burrow_core::WrappedConn;
use std::sync::Arc;
use tracing::{info, warn};

/// Route a connection that opened with `ProxyRegister` to the control it
/// names. An unknown client id closes the connection; a stray registration
/// is a protocol condition, not a server bug.
pub async fn register(ctx: &Arc<Context>, mut conn: WrappedConn, reg: ProxyRegister) {
    conn.set_type("proxy");
    info!(conn = conn.id(), client = %reg.client_id, "new proxy connection");

    match ctx.controls.get(&reg.client_id).await {
        Some(ctl) => {
            if let Err(e) = ctl.register_proxy(conn).await {
                warn!(client = %reg.client_id, error = %e, "proxy registration rejected");
            }
        }
        None => {
            warn!(client = %reg.client_id, "no control for proxy registration");
            conn.close().await;
        }
    }
}
