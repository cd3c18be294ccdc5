//! Runtime adapter: the contract for reading and mutating live
//! WireGuard interfaces
//!
//! The provisioning service only ever talks to this trait; the `wg`/`ip`
//! implementation lives in [`wg`], and tests inject fakes.

pub mod wg;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::RuntimeError;
use crate::store::Peer;

pub use wg::WgCli;

/// A peer as observed on a live interface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePeer {
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    /// Unix seconds of the most recent handshake, 0 when never.
    pub latest_handshake: u64,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

/// Interface-level live state.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInterface {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub listen_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fwmark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub peers: Vec<RuntimePeer>,
}

/// Parameters for bringing an interface up.
#[derive(Debug, Clone, Default)]
pub struct UpInterfaceOptions {
    pub private_key: Option<String>,
    pub listen_port: u16,
    /// Interface address in CIDR form.
    pub address: Option<String>,
}

/// Best-effort host identification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub version: String,
}

/// Control surface over live WireGuard interfaces.
#[async_trait]
pub trait WgRuntime: Send + Sync {
    /// Names of live WireGuard interfaces.
    async fn list_interfaces(&self) -> Result<Vec<String>, RuntimeError>;

    /// Full live view of one interface; `NotExists` when absent.
    async fn get_interface(&self, name: &str) -> Result<RuntimeInterface, RuntimeError>;

    /// Adds (or reconfigures) a peer. Idempotent in effect.
    async fn add_peer(&self, interface: &str, peer: &Peer) -> Result<(), RuntimeError>;

    /// Removes a peer by public key. With `ignore_if_missing`, a
    /// peer-not-found diagnostic is success.
    async fn remove_peer(
        &self,
        interface: &str,
        public_key: &str,
        ignore_if_missing: bool,
    ) -> Result<(), RuntimeError>;

    /// Reconfigures a peer; same runtime effect as [`Self::add_peer`].
    async fn update_peer(&self, interface: &str, peer: &Peer) -> Result<(), RuntimeError>;

    /// Brings the link up or down.
    async fn toggle_interface(&self, interface: &str, is_up: bool) -> Result<(), RuntimeError>;

    /// Ensures the link exists, applies key/port/address, sets it up.
    async fn up_interface(
        &self,
        interface: &str,
        options: &UpInterfaceOptions,
    ) -> Result<(), RuntimeError>;

    /// Host info; never fails, unknown fields fall back to "unknown".
    async fn get_system_info(&self) -> SystemInfo;
}
