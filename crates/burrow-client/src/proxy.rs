//! Proxy legs: one short-lived server connection per public request.

use crate::client::Client;
use crate::transport;
use burrow_core::messages::ProxyRegister;
use burrow_core::{conn, splice, BurrowError, BurrowResult, Message};
use std::sync::Arc;
use tracing::{debug, warn};

/// Dial a fresh proxy leg in response to a ProxyRequest. Errors abort the
/// leg without disturbing the control session.
pub(crate) async fn run_leg(client: Arc<Client>) {
    if let Err(e) = leg(&client).await {
        warn!(error = %e, "proxy leg failed");
    }
}

async fn leg(client: &Arc<Client>) -> BurrowResult<()> {
    let mut remote = transport::dial_server(&client.cfg, "proxy", client.tls.clone()).await?;

    let client_id = client.id.lock().await.clone();
    remote
        .write_msg(&Message::ProxyRegister(ProxyRegister { client_id }))
        .await?;

    // The leg now sits in the server's pool until a public connection
    // claims it.
    let start = match remote.read_msg().await? {
        Some(Message::ProxyStart(start)) => start,
        Some(other) => {
            return Err(BurrowError::InvalidMessage(format!(
                "expected ProxyStart, got {}",
                other.type_name()
            )));
        }
        None => {
            return Err(BurrowError::Transport(
                "server closed the proxy leg before use".into(),
            ));
        }
    };

    let Some(tunnel) = client.lookup_tunnel(&start.url).await else {
        return Err(BurrowError::Other(format!(
            "no tunnel for proxy url: {}",
            start.url
        )));
    };

    debug!(
        url = %start.url,
        public_client = %start.client_addr,
        local = %tunnel.local_addr,
        "proxy leg starting"
    );

    let local = conn::dial(&tunnel.local_addr, "private").await?;
    let (to_local, to_remote) = splice::join(remote, local).await;
    debug!(url = %start.url, to_local, to_remote, "proxy leg finished");

    Ok(())
}
