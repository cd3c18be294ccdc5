//! Peer operation and rollback value types
//!
//! Requested mutations are a discriminated union; the runtime operations
//! they schedule are plain values so a rollback plan can be inspected and
//! logged after the fact.

use serde::{Deserialize, Serialize};

use crate::store::Peer;

fn default_true() -> bool {
    true
}

/// A peer as supplied by a caller. The id is optional; one is assigned
/// when absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInput {
    #[serde(default)]
    pub peer_id: Option<String>,
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub private_key: Option<String>,
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl PeerInput {
    /// Materializes the managed peer, pinned to `interface`.
    pub fn into_peer(self, interface: &str) -> Peer {
        Peer {
            peer_id: self
                .peer_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: self.name,
            public_key: self.public_key,
            private_key: self.private_key,
            allowed_ips: self.allowed_ips,
            endpoint: self.endpoint,
            persistent_keepalive: self.persistent_keepalive,
            preshared_key: self.preshared_key,
            is_active: self.is_active,
            interface: interface.to_string(),
        }
    }
}

/// Partial update applied to an existing peer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    #[serde(default)]
    pub preshared_key: Option<String>,
}

impl PeerPatch {
    pub fn apply_to(&self, peer: &mut Peer) {
        if let Some(name) = &self.name {
            peer.name = name.clone();
        }
        if let Some(public_key) = &self.public_key {
            peer.public_key = public_key.clone();
        }
        if let Some(private_key) = &self.private_key {
            peer.private_key = Some(private_key.clone());
        }
        if let Some(allowed_ips) = &self.allowed_ips {
            peer.allowed_ips = allowed_ips.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            peer.endpoint = Some(endpoint.clone());
        }
        if let Some(keepalive) = self.persistent_keepalive {
            peer.persistent_keepalive = Some(keepalive);
        }
        if let Some(preshared_key) = &self.preshared_key {
            peer.preshared_key = Some(preshared_key.clone());
        }
    }
}

/// One requested mutation of an interface's peer set.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerOperation {
    Add {
        peer: PeerInput,
    },
    Update {
        #[serde(rename = "peerId")]
        peer_id: String,
        patch: PeerPatch,
    },
    Toggle {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "isActive")]
        is_active: bool,
    },
    Remove {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

/// Per-kind counters for one apply batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpSummary {
    pub added: u32,
    pub updated: u32,
    pub toggled: u32,
    pub removed: u32,
}

/// A scheduled runtime mutation, kept as a value so the rollback plan
/// can be reported verbatim.
#[derive(Debug, Clone)]
pub enum RuntimeOp {
    Add(Peer),
    Remove {
        peer: Peer,
        ignore_if_missing: bool,
    },
    Update {
        next: Peer,
        previous: Peer,
    },
}

impl RuntimeOp {
    pub fn remove(peer: Peer) -> Self {
        Self::Remove {
            peer,
            ignore_if_missing: false,
        }
    }

    /// The value that undoes this op after it succeeded.
    pub fn compensation(&self) -> RuntimeOp {
        match self {
            Self::Add(peer) => Self::Remove {
                peer: peer.clone(),
                ignore_if_missing: true,
            },
            Self::Remove { peer, .. } => Self::Add(peer.clone()),
            Self::Update { next, previous } => Self::Update {
                next: previous.clone(),
                previous: next.clone(),
            },
        }
    }

    /// One dry-run plan line in `wg set` terms.
    pub fn plan_line(&self, interface: &str) -> String {
        match self {
            Self::Add(peer) => format!(
                "[ADD] wg set {} peer {} allowed-ips {}",
                interface,
                peer.public_key,
                peer.allowed_ips.join(",")
            ),
            Self::Remove { peer, .. } => {
                format!("[REMOVE] wg set {} peer {} remove", interface, peer.public_key)
            }
            Self::Update { next, .. } => format!(
                "[UPDATE] wg set {} peer {} allowed-ips {}",
                interface,
                next.public_key,
                next.allowed_ips.join(",")
            ),
        }
    }

    pub fn public_key(&self) -> &str {
        match self {
            Self::Add(peer) => &peer.public_key,
            Self::Remove { peer, .. } => &peer.public_key,
            Self::Update { next, .. } => &next.public_key,
        }
    }
}
