//! Registries mapping public URLs to tunnels and client ids to controls.
//!
//! These maps are the only shared mutable state in the server; their locks
//! are held for map access only, never across I/O.

use crate::control::Control;
use crate::tunnel::Tunnel;
use burrow_core::{BurrowError, BurrowResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Public URL → tunnel. URLs are unique.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel under its public URL, failing when the URL is
    /// already taken.
    pub async fn register(&self, url: &str, tunnel: Arc<Tunnel>) -> BurrowResult<()> {
        let mut tunnels = self.tunnels.lock().await;
        if tunnels.contains_key(url) {
            return Err(BurrowError::DuplicateUrl(url.to_string()));
        }
        tunnels.insert(url.to_string(), tunnel);
        debug!(%url, "tunnel registered");
        Ok(())
    }

    pub async fn get(&self, url: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().await.get(url).cloned()
    }

    /// Remove a URL. Removing an absent URL is a no-op.
    pub async fn remove(&self, url: &str) {
        if self.tunnels.lock().await.remove(url).is_some() {
            debug!(%url, "tunnel deregistered");
        }
    }

    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.lock().await.is_empty()
    }
}

/// Client id → control. Exactly one live control per client id.
#[derive(Default)]
pub struct ControlRegistry {
    controls: Mutex<HashMap<String, Arc<Control>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<Control>> {
        self.controls.lock().await.get(client_id).cloned()
    }

    /// Install `ctl` as the live control for `client_id`.
    ///
    /// The swap happens under the lock; any displaced control is then asked
    /// to exit, and this call returns only after it has fully drained, so
    /// the caller may treat itself as the sole owner of the client id.
    pub async fn add(&self, client_id: &str, ctl: Arc<Control>) {
        let displaced = {
            let mut controls = self.controls.lock().await;
            controls.insert(client_id.to_string(), ctl)
        };
        info!(client = %client_id, "control added");

        if let Some(old) = displaced {
            old.replace().await;
        }
    }

    /// Remove the entry for `client_id`, but only while it still points at
    /// `ctl`: a displaced control exiting late must not evict its
    /// successor. Removing an absent entry is a no-op.
    pub async fn remove(&self, client_id: &str, ctl: &Arc<Control>) {
        let mut controls = self.controls.lock().await;
        if let Some(current) = controls.get(client_id) {
            if Arc::ptr_eq(current, ctl) {
                controls.remove(client_id);
                info!(client = %client_id, "control removed");
            }
        }
    }

    /// Exit every registered control, awaiting each drain.
    pub async fn exit_all(&self) {
        let controls: Vec<Arc<Control>> = {
            let map = self.controls.lock().await;
            map.values().cloned().collect()
        };
        for ctl in controls {
            ctl.exit().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.controls.lock().await.len()
    }
}
