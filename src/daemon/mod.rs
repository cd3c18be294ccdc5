//! Daemon mode for the wgmeshd provisioning service
//!
//! Runs as a background service, accepting commands via REST API (HTTP).
//! The web UI and automation talk to this daemon to inspect, plan, and
//! apply mesh changes.

pub mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::runtime::WgRuntime;
use crate::service::ProvisioningService;
use crate::store::StateStore;

/// Default state file location, overridable via `WG_STATE_FILE`.
pub const DEFAULT_STATE_FILE: &str = "/etc/wireguard/wg-mesh-state.json";

/// Filesystem and binary paths the daemon operates with.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub state_file: PathBuf,
    /// Defaults to `<state_file>.lock`.
    pub lock_file: Option<PathBuf>,
    pub wg_bin: String,
    pub ip_bin: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            lock_file: None,
            wg_bin: "wg".to_string(),
            ip_bin: "ip".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Environment takes precedence over the built-in defaults; explicit
    /// CLI flags are applied by the caller on top.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("WG_STATE_FILE") {
            config.state_file = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("WG_LOCK_FILE") {
            config.lock_file = Some(PathBuf::from(path));
        }
        config
    }
}

/// Daemon service owning the provisioning core and its HTTP server.
pub struct DaemonService {
    service: Arc<ProvisioningService>,
}

impl DaemonService {
    pub fn new(config: &DaemonConfig, runtime: Arc<dyn WgRuntime>) -> Self {
        let store = StateStore::new(config.state_file.clone(), config.lock_file.clone());
        Self {
            service: Arc::new(ProvisioningService::new(store, runtime)),
        }
    }

    pub fn service(&self) -> Arc<ProvisioningService> {
        Arc::clone(&self.service)
    }

    /// Runs the REST API server until the listener fails or the task is
    /// cancelled.
    pub async fn run_http(&self, addr: SocketAddr) -> Result<()> {
        let app = routes::build_router(routes::AppState {
            service: self.service(),
        })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP daemon listening on http://{}", addr);

        axum::serve(listener, app).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_etc_wireguard() {
        let config = DaemonConfig::default();
        assert_eq!(config.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert!(config.lock_file.is_none());
        assert_eq!(config.wg_bin, "wg");
    }

    #[test]
    fn lock_path_defaults_to_state_sibling() {
        let store = StateStore::new("/tmp/x/state.json", None);
        assert_eq!(store.state_path(), PathBuf::from("/tmp/x/state.json"));
    }
}
