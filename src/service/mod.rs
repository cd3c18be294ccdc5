//! Provisioning service: the transactional reconciler
//!
//! Every mutating flow follows the same shape: read state and runtime,
//! assert the caller's revision, run runtime operations OUTSIDE the
//! store lock (with compensating rollback on partial failure), then enter
//! the store's update closure only to persist the already-successful
//! result, re-asserting the revision there.

pub mod audit;
pub mod ops;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::{Result, ServiceError, WgMeshError};
use crate::keys::{DeterministicPsk, PskCache};
use crate::mesh::render::format_endpoint;
use crate::mesh::{MeshSpec, ResolvedMesh};
use crate::runtime::{RuntimeInterface, RuntimePeer, UpInterfaceOptions, WgRuntime};
use crate::store::{InterfaceRecord, Peer, PersistedState, StateStore};

pub use audit::{AuditLog, AuditPage};
pub use ops::{OpSummary, PeerInput, PeerOperation, PeerPatch, RuntimeOp};

/// One row of the interface listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSummary {
    pub name: String,
    pub is_up: bool,
    pub listen_port: u16,
    pub peer_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
}

/// A peer in the merged interface view: managed peers carry live
/// counters, unmanaged runtime peers are synthesized as discovered.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    pub peer_id: String,
    pub name: String,
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
    pub is_active: bool,
    pub interface: String,
    pub latest_handshake: u64,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
    pub is_unmanaged: bool,
}

/// Merged persisted + runtime view of one interface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceDetails {
    pub name: String,
    pub is_up: bool,
    pub listen_port: u16,
    pub address_cidr: String,
    pub revision: u64,
    /// Masked; full key material never leaves the core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fwmark: Option<String>,
    pub peers: Vec<PeerView>,
}

/// Body of a peer-operations apply call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub revision: u64,
    #[serde(default)]
    pub dry_run: bool,
    pub operations: Vec<PeerOperation>,
}

/// Outcome of an apply call: a plan (dry-run) or a committed result.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ApplyResult {
    #[serde(rename_all = "camelCase")]
    DryRun {
        dry_run: bool,
        current_revision: u64,
        next_revision: u64,
        plan: Vec<String>,
        summary: OpSummary,
    },
    #[serde(rename_all = "camelCase")]
    Applied {
        applied: bool,
        revision: u64,
        summary: OpSummary,
    },
}

/// Body of an interface up/down toggle.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleRequest {
    pub revision: u64,
    pub is_up: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// Direction of a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    StateToRuntime,
    RuntimeToState,
}

/// Body of a reconcile call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub revision: u64,
    pub mode: ReconcileMode,
}

/// Drift report returned by reconcile.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    pub mode: ReconcileMode,
    pub drift_found: bool,
    pub missing_in_runtime: Vec<String>,
    pub zombies: Vec<String>,
    pub revision: u64,
}

/// Wholesale replacement of one interface from a resolved mesh.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub interface: String,
    pub listen_port: u16,
    pub address_cidr: String,
    pub private_key: Option<String>,
    pub peers: Vec<Peer>,
}

/// Outcome of a deploy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub interface: String,
    pub revision: u64,
    pub peer_count: usize,
    /// Runtime peers purged before the new set was installed; unmanaged
    /// peers on the interface are dropped by design of the full replace.
    pub purged: usize,
}

impl DeployRequest {
    /// Builds the deploy payload for one node of a resolved mesh: its
    /// neighbor tunnels plus, for gateways, one peer per client.
    pub fn for_node(spec: &MeshSpec, mesh: &ResolvedMesh, node_name: &str) -> Result<Self> {
        let index = mesh
            .nodes
            .iter()
            .position(|n| n.name == node_name)
            .ok_or_else(|| crate::error::MeshError::Validation {
                field: "nodeName".to_string(),
                message: format!("{node_name} is not a node of this mesh"),
            })?;
        let node = &mesh.nodes[index];
        let strategy = DeterministicPsk;
        let mut psk = PskCache::new(&strategy);

        let mut peers = Vec::new();
        for &j in &mesh.neighbors[index] {
            let neighbor = &mesh.nodes[j];
            peers.push(Peer {
                peer_id: uuid::Uuid::new_v4().to_string(),
                name: neighbor.name.clone(),
                public_key: neighbor.public_key.clone(),
                private_key: None,
                allowed_ips: vec![format!("{}/32", neighbor.address)],
                endpoint: Some(format_endpoint(
                    &neighbor.endpoint,
                    neighbor.listen_port,
                    spec.endpoint_version,
                )),
                persistent_keepalive: Some(spec.persistent_keepalive),
                preshared_key: Some(psk.get(&node.name, &neighbor.name)),
                is_active: true,
                interface: spec.interface_name.clone(),
            });
        }

        if spec.gateway_node_names.iter().any(|g| g == node_name) {
            for client in &mesh.clients {
                peers.push(Peer {
                    peer_id: uuid::Uuid::new_v4().to_string(),
                    name: client.name.clone(),
                    public_key: client.public_key.clone(),
                    private_key: None,
                    allowed_ips: vec![format!("{}/32", client.address)],
                    endpoint: None,
                    persistent_keepalive: None,
                    preshared_key: Some(psk.get(&client.name, &node.name)),
                    is_active: true,
                    interface: spec.interface_name.clone(),
                });
            }
        }

        Ok(Self {
            interface: spec.interface_name.clone(),
            listen_port: node.listen_port,
            address_cidr: format!("{}/32", node.address),
            private_key: Some(node.private_key.clone()),
            peers,
        })
    }
}

/// The transactional reconciler over one store and one runtime.
pub struct ProvisioningService {
    store: StateStore,
    runtime: Arc<dyn WgRuntime>,
    audit: AuditLog,
}

fn synthetic_record() -> InterfaceRecord {
    InterfaceRecord {
        listen_port: 0,
        address_cidr: "unknown/24".to_string(),
        revision: 0,
        is_up: true,
        private_key: None,
    }
}

fn resolve_record(
    state: &PersistedState,
    name: &str,
    runtime_present: bool,
) -> std::result::Result<InterfaceRecord, ServiceError> {
    state
        .interfaces
        .get(name)
        .cloned()
        .or_else(|| runtime_present.then(synthetic_record))
        .ok_or_else(|| ServiceError::InterfaceNotFound {
            name: name.to_string(),
        })
}

fn check_revision(record: &InterfaceRecord, received: u64) -> std::result::Result<(), ServiceError> {
    if record.revision != received {
        return Err(ServiceError::RevisionConflict {
            expected: record.revision,
            received,
        });
    }
    Ok(())
}

fn short(key: &str, n: usize) -> &str {
    &key[..n.min(key.len())]
}

fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        "...".to_string()
    } else {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    }
}

/// A runtime peer adopted into managed state.
fn peer_from_runtime(observed: &RuntimePeer, interface: &str) -> Peer {
    Peer {
        peer_id: uuid::Uuid::new_v4().to_string(),
        name: format!("runtime-{}", short(&observed.public_key, 8)),
        public_key: observed.public_key.clone(),
        private_key: None,
        // The state schema requires at least one allowed IP.
        allowed_ips: if observed.allowed_ips.is_empty() {
            vec!["0.0.0.0/32".to_string()]
        } else {
            observed.allowed_ips.clone()
        },
        endpoint: observed.endpoint.clone(),
        persistent_keepalive: observed.persistent_keepalive,
        preshared_key: None,
        is_active: true,
        interface: interface.to_string(),
    }
}

impl ProvisioningService {
    pub fn new(store: StateStore, runtime: Arc<dyn WgRuntime>) -> Self {
        Self {
            store,
            runtime,
            audit: AuditLog::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn WgRuntime> {
        &self.runtime
    }

    /// Live view of one interface; absence is `None`, other runtime
    /// failures propagate.
    async fn runtime_view(&self, name: &str) -> Result<Option<RuntimeInterface>> {
        match self.runtime.get_interface(name).await {
            Ok(view) => Ok(Some(view)),
            Err(e) if e.is_not_exists() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn execute_op(&self, interface: &str, op: &RuntimeOp) -> Result<()> {
        match op {
            RuntimeOp::Add(peer) => self.runtime.add_peer(interface, peer).await?,
            RuntimeOp::Remove {
                peer,
                ignore_if_missing,
            } => {
                self.runtime
                    .remove_peer(interface, &peer.public_key, *ignore_if_missing)
                    .await?
            }
            RuntimeOp::Update { next, .. } => self.runtime.update_peer(interface, next).await?,
        }
        Ok(())
    }

    /// Runs ops in order; on the first failure, compensates everything
    /// already done in strict LIFO and reports `ApplyFailed`.
    async fn execute_with_rollback(&self, interface: &str, ops: &[RuntimeOp]) -> Result<()> {
        let mut done: Vec<RuntimeOp> = Vec::new();
        for op in ops {
            match self.execute_op(interface, op).await {
                Ok(()) => done.push(op.clone()),
                Err(e) => {
                    self.roll_back(interface, &done).await;
                    return Err(ServiceError::ApplyFailed {
                        message: format!(
                            "runtime op on peer {} failed after {} ops: {e}",
                            op.public_key(),
                            done.len()
                        ),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Rollback failures are logged, never raised, so the original cause
    /// survives to the caller.
    async fn roll_back(&self, interface: &str, done: &[RuntimeOp]) {
        for op in done.iter().rev() {
            let compensation = op.compensation();
            if let Err(e) = self.execute_op(interface, &compensation).await {
                warn!(
                    "rollback of {} on {} failed: {}",
                    compensation.plan_line(interface),
                    interface,
                    e
                );
            }
        }
    }

    /// Union of persisted interfaces, live interfaces, and interfaces
    /// referenced by any persisted peer.
    pub async fn list_interfaces(&self) -> Result<Vec<InterfaceSummary>> {
        let state = self.store.load().await?;
        let runtime_names = match self.runtime.list_interfaces().await {
            Ok(names) => names,
            Err(e) => {
                warn!("runtime interface listing failed: {}", e);
                Vec::new()
            }
        };

        let mut names: BTreeSet<String> = state.interfaces.keys().cloned().collect();
        names.extend(runtime_names.iter().cloned());
        names.extend(state.peers.iter().map(|p| p.interface_name().to_string()));

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = state.interfaces.get(&name) {
                out.push(InterfaceSummary {
                    is_up: record.is_up,
                    listen_port: record.listen_port,
                    peer_count: state.peers_for(&name).count(),
                    last_sync_at: Some(state.updated_at.clone()),
                    name,
                });
            } else if runtime_names.contains(&name) {
                let peer_count = self
                    .runtime_view(&name)
                    .await?
                    .map(|i| i.peers.len())
                    .unwrap_or(0);
                out.push(InterfaceSummary {
                    is_up: true,
                    listen_port: 0,
                    peer_count,
                    last_sync_at: None,
                    name,
                });
            } else {
                // Referenced by peers only; no record and no live link.
                out.push(InterfaceSummary {
                    is_up: false,
                    listen_port: 0,
                    peer_count: state.peers_for(&name).count(),
                    last_sync_at: None,
                    name,
                });
            }
        }
        Ok(out)
    }

    /// Merged persisted + runtime view per the interface details contract.
    pub async fn interface_details(&self, name: &str) -> Result<InterfaceDetails> {
        let state = self.store.load().await?;
        let runtime_iface = self.runtime_view(name).await?;
        let persisted = state.interfaces.get(name).cloned();
        if persisted.is_none() && runtime_iface.is_none() {
            return Err(ServiceError::InterfaceNotFound {
                name: name.to_string(),
            }
            .into());
        }

        let record = persisted.clone().unwrap_or_else(synthetic_record);
        let runtime_peers: Vec<RuntimePeer> = runtime_iface
            .as_ref()
            .map(|i| i.peers.clone())
            .unwrap_or_default();

        let mut peers: Vec<PeerView> = Vec::new();
        let managed: Vec<Peer> = state.peers_for(name).cloned().collect();
        for peer in &managed {
            let live = runtime_peers
                .iter()
                .find(|r| r.public_key == peer.public_key);
            peers.push(PeerView {
                peer_id: peer.peer_id.clone(),
                name: peer.name.clone(),
                public_key: peer.public_key.clone(),
                allowed_ips: peer.allowed_ips.clone(),
                endpoint: peer.endpoint.clone(),
                persistent_keepalive: peer.persistent_keepalive,
                is_active: peer.is_active,
                interface: name.to_string(),
                latest_handshake: live.map(|r| r.latest_handshake).unwrap_or(0),
                transfer_rx: live.map(|r| r.transfer_rx).unwrap_or(0),
                transfer_tx: live.map(|r| r.transfer_tx).unwrap_or(0),
                is_unmanaged: false,
            });
        }
        for observed in &runtime_peers {
            if managed.iter().any(|p| p.public_key == observed.public_key) {
                continue;
            }
            peers.push(PeerView {
                peer_id: format!("discovered_{}", short(&observed.public_key, 12)),
                name: format!("discovered-{}", short(&observed.public_key, 8)),
                public_key: observed.public_key.clone(),
                allowed_ips: observed.allowed_ips.clone(),
                endpoint: observed.endpoint.clone(),
                persistent_keepalive: observed.persistent_keepalive,
                is_active: true,
                interface: name.to_string(),
                latest_handshake: observed.latest_handshake,
                transfer_rx: observed.transfer_rx,
                transfer_tx: observed.transfer_tx,
                is_unmanaged: true,
            });
        }

        let listen_port = if persisted.is_some() {
            record.listen_port
        } else {
            runtime_iface.as_ref().map(|i| i.listen_port).unwrap_or(0)
        };
        let private_key = record
            .private_key
            .as_deref()
            .or(runtime_iface
                .as_ref()
                .and_then(|i| i.private_key.as_deref()))
            .map(mask_key);

        Ok(InterfaceDetails {
            name: name.to_string(),
            is_up: record.is_up,
            listen_port,
            address_cidr: record.address_cidr,
            revision: record.revision,
            private_key,
            public_key: runtime_iface.as_ref().and_then(|i| i.public_key.clone()),
            fwmark: runtime_iface.as_ref().and_then(|i| i.fwmark.clone()),
            peers,
        })
    }

    /// Ordered peer mutations with dry-run planning and transactional
    /// runtime semantics.
    pub async fn apply_peer_operations(&self, name: &str, req: ApplyRequest) -> Result<ApplyResult> {
        let state = self.store.load().await?;
        let runtime_iface = self.runtime_view(name).await?;
        let record = resolve_record(&state, name, runtime_iface.is_some())?;
        check_revision(&record, req.revision)?;

        let mut peers: Vec<Peer> = state.peers_for(name).cloned().collect();
        let mut scheduled: Vec<RuntimeOp> = Vec::new();
        let mut summary = OpSummary::default();
        let mut events: Vec<(&'static str, serde_json::Value)> = Vec::new();

        for op in req.operations {
            match op {
                PeerOperation::Add { peer } => {
                    let peer = peer.into_peer(name);
                    if peer.is_active {
                        scheduled.push(RuntimeOp::Add(peer.clone()));
                    }
                    events.push((
                        "peer.add",
                        json!({ "peerId": peer.peer_id, "name": peer.name }),
                    ));
                    peers.push(peer);
                    summary.added += 1;
                }
                PeerOperation::Update { peer_id, patch } => {
                    // Unknown targets are skipped, not errors.
                    let Some(pos) = peers.iter().position(|p| p.peer_id == peer_id) else {
                        continue;
                    };
                    let previous = peers[pos].clone();
                    let mut next = previous.clone();
                    patch.apply_to(&mut next);
                    peers[pos] = next.clone();
                    if next.is_active {
                        scheduled.push(RuntimeOp::Update { next, previous });
                    }
                    events.push(("peer.update", json!({ "peerId": peer_id })));
                    summary.updated += 1;
                }
                PeerOperation::Toggle { peer_id, is_active } => {
                    let Some(pos) = peers.iter().position(|p| p.peer_id == peer_id) else {
                        continue;
                    };
                    peers[pos].is_active = is_active;
                    let peer = peers[pos].clone();
                    scheduled.push(if is_active {
                        RuntimeOp::Add(peer)
                    } else {
                        RuntimeOp::remove(peer)
                    });
                    events.push((
                        "peer.toggle",
                        json!({ "peerId": peer_id, "isActive": is_active }),
                    ));
                    summary.toggled += 1;
                }
                PeerOperation::Remove { peer_id } => {
                    let Some(pos) = peers.iter().position(|p| p.peer_id == peer_id) else {
                        continue;
                    };
                    let peer = peers.remove(pos);
                    events.push((
                        "peer.remove",
                        json!({ "peerId": peer_id, "name": peer.name }),
                    ));
                    scheduled.push(RuntimeOp::remove(peer));
                    summary.removed += 1;
                }
            }
        }

        if req.dry_run {
            return Ok(ApplyResult::DryRun {
                dry_run: true,
                current_revision: record.revision,
                next_revision: record.revision + 1,
                plan: scheduled.iter().map(|op| op.plan_line(name)).collect(),
                summary,
            });
        }

        self.execute_with_rollback(name, &scheduled).await?;

        let name_owned = name.to_string();
        let runtime_present = runtime_iface.is_some();
        let received = req.revision;
        let persisted = self
            .store
            .update(move |state| {
                let mut record = resolve_record(state, &name_owned, runtime_present)?;
                check_revision(&record, received)?;
                record.revision += 1;
                let revision = record.revision;
                state.interfaces.insert(name_owned.clone(), record);
                state.peers.retain(|p| p.interface_name() != name_owned);
                state.peers.extend(peers);
                state.touch();
                Ok(revision)
            })
            .await;

        let revision = match persisted {
            Ok(revision) => revision,
            Err(e @ WgMeshError::Service(ServiceError::RevisionConflict { .. })) => return Err(e),
            Err(e) => {
                // Runtime is now ahead of state; reconcile(runtime_to_state)
                // recovers.
                return Err(ServiceError::ApplyFailed {
                    message: format!("state persist failed after runtime success: {e}"),
                }
                .into());
            }
        };

        for (action, details) in events {
            self.audit.record(name, action, details);
        }

        Ok(ApplyResult::Applied {
            applied: true,
            revision,
            summary,
        })
    }

    /// Brings the interface up or down, state and runtime in step.
    pub async fn toggle_interface_state(
        &self,
        name: &str,
        req: ToggleRequest,
    ) -> Result<InterfaceDetails> {
        let state = self.store.load().await?;
        let runtime_iface = self.runtime_view(name).await?;
        let record = resolve_record(&state, name, runtime_iface.is_some())?;
        check_revision(&record, req.revision)?;

        if req.dry_run {
            return self.interface_details(name).await;
        }

        let previous_up = record.is_up;
        self.runtime.toggle_interface(name, req.is_up).await?;

        let name_owned = name.to_string();
        let runtime_present = runtime_iface.is_some();
        let received = req.revision;
        let is_up = req.is_up;
        let persisted = self
            .store
            .update(move |state| {
                let mut record = resolve_record(state, &name_owned, runtime_present)?;
                check_revision(&record, received)?;
                record.is_up = is_up;
                record.revision += 1;
                state.interfaces.insert(name_owned, record);
                state.touch();
                Ok(())
            })
            .await;

        if let Err(e) = persisted {
            if let Err(rb) = self.runtime.toggle_interface(name, previous_up).await {
                warn!("could not undo toggle of {} after state failure: {}", name, rb);
            }
            return match e {
                WgMeshError::Service(ServiceError::RevisionConflict { .. }) => Err(e),
                other => Err(ServiceError::ApplyFailed {
                    message: format!("state persist failed after runtime toggle: {other}"),
                }
                .into()),
            };
        }

        self.audit
            .record(name, "interface.toggle", json!({ "isUp": req.is_up }));
        self.interface_details(name).await
    }

    /// Drift detection and repair in either direction.
    pub async fn reconcile_interface(
        &self,
        name: &str,
        req: ReconcileRequest,
    ) -> Result<ReconcileResult> {
        let state = self.store.load().await?;
        let runtime_iface = self.runtime_view(name).await?;
        let record = resolve_record(&state, name, runtime_iface.is_some())?;
        check_revision(&record, req.revision)?;

        let runtime_peers: Vec<RuntimePeer> = runtime_iface
            .as_ref()
            .map(|i| i.peers.clone())
            .unwrap_or_default();
        let runtime_keys: HashSet<&str> =
            runtime_peers.iter().map(|p| p.public_key.as_str()).collect();
        let managed: Vec<Peer> = state.peers_for(name).cloned().collect();
        let managed_keys: HashSet<&str> = managed.iter().map(|p| p.public_key.as_str()).collect();

        let missing: Vec<Peer> = managed
            .iter()
            .filter(|p| p.is_active && !runtime_keys.contains(p.public_key.as_str()))
            .cloned()
            .collect();
        let zombies: Vec<RuntimePeer> = runtime_peers
            .iter()
            .filter(|r| !managed_keys.contains(r.public_key.as_str()))
            .cloned()
            .collect();

        let missing_keys: Vec<String> = missing.iter().map(|p| p.public_key.clone()).collect();
        let zombie_keys: Vec<String> = zombies.iter().map(|z| z.public_key.clone()).collect();
        let drift_found = !missing.is_empty() || !zombies.is_empty();

        let revision = match req.mode {
            ReconcileMode::StateToRuntime => {
                let mut fixes: Vec<RuntimeOp> = Vec::new();
                fixes.extend(missing.into_iter().map(RuntimeOp::Add));
                fixes.extend(
                    zombies
                        .iter()
                        .map(|z| RuntimeOp::remove(peer_from_runtime(z, name))),
                );

                if fixes.is_empty() {
                    record.revision
                } else {
                    self.execute_with_rollback(name, &fixes).await?;

                    let name_owned = name.to_string();
                    let runtime_present = runtime_iface.is_some();
                    let received = req.revision;
                    self.store
                        .update(move |state| {
                            let mut record = resolve_record(state, &name_owned, runtime_present)?;
                            check_revision(&record, received)?;
                            record.revision += 1;
                            let revision = record.revision;
                            state.interfaces.insert(name_owned, record);
                            state.touch();
                            Ok(revision)
                        })
                        .await?
                }
            }
            ReconcileMode::RuntimeToState => {
                if !drift_found {
                    record.revision
                } else {
                    let name_owned = name.to_string();
                    let runtime_present = runtime_iface.is_some();
                    let received = req.revision;
                    let runtime_key_set: HashSet<String> =
                        runtime_keys.iter().map(|k| k.to_string()).collect();
                    let adopted: Vec<Peer> = zombies
                        .iter()
                        .map(|z| peer_from_runtime(z, name))
                        .collect();
                    self.store
                        .update(move |state| {
                            let mut record = resolve_record(state, &name_owned, runtime_present)?;
                            check_revision(&record, received)?;

                            let mut changed = false;
                            for peer in state
                                .peers
                                .iter_mut()
                                .filter(|p| p.interface_name() == name_owned)
                            {
                                if peer.is_active && !runtime_key_set.contains(&peer.public_key) {
                                    peer.is_active = false;
                                    changed = true;
                                }
                            }
                            if !adopted.is_empty() {
                                state.peers.extend(adopted);
                                changed = true;
                            }

                            let revision = if changed {
                                record.revision += 1;
                                let revision = record.revision;
                                state.interfaces.insert(name_owned, record);
                                state.touch();
                                revision
                            } else {
                                record.revision
                            };
                            Ok(revision)
                        })
                        .await?
                }
            }
        };

        self.audit.record(
            name,
            "interface.reconcile",
            json!({
                "mode": req.mode,
                "missingInRuntime": missing_keys,
                "zombies": zombie_keys,
            }),
        );

        Ok(ReconcileResult {
            mode: req.mode,
            drift_found,
            missing_in_runtime: missing_keys,
            zombies: zombie_keys,
            revision,
        })
    }

    /// Full replace of one interface from a resolved mesh: persist, bring
    /// the link up, purge every runtime peer, install the new set.
    pub async fn deploy_mesh_config(&self, req: DeployRequest) -> Result<DeployResult> {
        let name = req.interface.clone();
        let peer_count = req.peers.len();

        let record_peers: Vec<Peer> = req
            .peers
            .iter()
            .cloned()
            .map(|mut p| {
                p.interface = name.clone();
                p.is_active = true;
                p
            })
            .collect();

        let name_for_update = name.clone();
        let listen_port = req.listen_port;
        let address_cidr = req.address_cidr.clone();
        let private_key = req.private_key.clone();
        let revision = self
            .store
            .update(move |state| {
                let revision = state
                    .interfaces
                    .get(&name_for_update)
                    .map(|r| r.revision)
                    .unwrap_or(0)
                    + 1;
                state.interfaces.insert(
                    name_for_update.clone(),
                    InterfaceRecord {
                        listen_port,
                        address_cidr,
                        revision,
                        is_up: true,
                        private_key,
                    },
                );
                state.peers.retain(|p| p.interface_name() != name_for_update);
                state.peers.extend(record_peers);
                state.touch();
                Ok(revision)
            })
            .await?;

        self.runtime
            .up_interface(
                &name,
                &UpInterfaceOptions {
                    private_key: req.private_key.clone(),
                    listen_port: req.listen_port,
                    address: Some(req.address_cidr.clone()),
                },
            )
            .await?;

        let mut purged = 0;
        if let Some(live) = self.runtime_view(&name).await? {
            for observed in &live.peers {
                self.runtime
                    .remove_peer(&name, &observed.public_key, true)
                    .await?;
                purged += 1;
            }
        }
        for peer in &req.peers {
            self.runtime.add_peer(&name, peer).await?;
        }

        self.audit.record(
            &name,
            "interface.deploy",
            json!({ "peerCount": peer_count, "purged": purged }),
        );

        Ok(DeployResult {
            interface: name,
            revision,
            peer_count,
            purged,
        })
    }

    /// Newest-first audit page for one interface.
    pub fn audit_page(&self, name: &str, limit: usize, cursor: Option<u64>) -> AuditPage {
        self.audit.page(name, limit, cursor)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::RuntimeError;
    use crate::runtime::{
        RuntimeInterface, RuntimePeer, SystemInfo, UpInterfaceOptions, WgRuntime,
    };
    use crate::store::Peer;

    /// Scripted in-memory runtime: interfaces with peer lists, optional
    /// per-public-key add failures, and a call journal.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub interfaces: Mutex<HashMap<String, Vec<RuntimePeer>>>,
        pub fail_add: Mutex<HashSet<String>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeRuntime {
        pub fn with_interface(name: &str, peers: Vec<RuntimePeer>) -> Self {
            let fake = Self::default();
            fake.interfaces
                .lock()
                .unwrap()
                .insert(name.to_string(), peers);
            fake
        }

        pub fn runtime_peer(public_key: &str) -> RuntimePeer {
            RuntimePeer {
                public_key: public_key.to_string(),
                preshared_key: None,
                endpoint: Some("5.5.5.5:51820".to_string()),
                allowed_ips: vec!["10.20.0.77/32".to_string()],
                latest_handshake: 1706600000,
                transfer_rx: 100,
                transfer_tx: 200,
                persistent_keepalive: Some(25),
            }
        }

        pub fn peer_keys(&self, interface: &str) -> Vec<String> {
            self.interfaces
                .lock()
                .unwrap()
                .get(interface)
                .map(|peers| peers.iter().map(|p| p.public_key.clone()).collect())
                .unwrap_or_default()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl WgRuntime for FakeRuntime {
        async fn list_interfaces(&self) -> Result<Vec<String>, RuntimeError> {
            Ok(self.interfaces.lock().unwrap().keys().cloned().collect())
        }

        async fn get_interface(&self, name: &str) -> Result<RuntimeInterface, RuntimeError> {
            let interfaces = self.interfaces.lock().unwrap();
            let Some(peers) = interfaces.get(name) else {
                return Err(RuntimeError::NotExists {
                    name: name.to_string(),
                });
            };
            Ok(RuntimeInterface {
                private_key: Some("livePrivateKey0000000000000000000000000=".to_string()),
                public_key: Some("livePublicKey00000000000000000000000000=".to_string()),
                listen_port: 51820,
                peers: peers.clone(),
                ..RuntimeInterface::default()
            })
        }

        async fn add_peer(&self, interface: &str, peer: &Peer) -> Result<(), RuntimeError> {
            self.log(format!("add {} {}", interface, peer.public_key));
            if self.fail_add.lock().unwrap().contains(&peer.public_key) {
                return Err(RuntimeError::Command {
                    message: "wg set failed".to_string(),
                    code: Some(1),
                    stderr: Some("injected failure".to_string()),
                });
            }
            let mut interfaces = self.interfaces.lock().unwrap();
            let peers = interfaces.entry(interface.to_string()).or_default();
            peers.retain(|p| p.public_key != peer.public_key);
            peers.push(RuntimePeer {
                public_key: peer.public_key.clone(),
                preshared_key: peer.preshared_key.clone(),
                endpoint: peer.endpoint.clone(),
                allowed_ips: peer.allowed_ips.clone(),
                latest_handshake: 0,
                transfer_rx: 0,
                transfer_tx: 0,
                persistent_keepalive: peer.persistent_keepalive,
            });
            Ok(())
        }

        async fn remove_peer(
            &self,
            interface: &str,
            public_key: &str,
            _ignore_if_missing: bool,
        ) -> Result<(), RuntimeError> {
            self.log(format!("remove {} {}", interface, public_key));
            if let Some(peers) = self.interfaces.lock().unwrap().get_mut(interface) {
                peers.retain(|p| p.public_key != public_key);
            }
            Ok(())
        }

        async fn update_peer(&self, interface: &str, peer: &Peer) -> Result<(), RuntimeError> {
            self.log(format!("update {} {}", interface, peer.public_key));
            self.add_peer(interface, peer).await
        }

        async fn toggle_interface(&self, interface: &str, is_up: bool) -> Result<(), RuntimeError> {
            self.log(format!("toggle {} {}", interface, is_up));
            Ok(())
        }

        async fn up_interface(
            &self,
            interface: &str,
            _options: &UpInterfaceOptions,
        ) -> Result<(), RuntimeError> {
            self.log(format!("up {}", interface));
            self.interfaces
                .lock()
                .unwrap()
                .entry(interface.to_string())
                .or_default();
            Ok(())
        }

        async fn get_system_info(&self) -> SystemInfo {
            SystemInfo {
                hostname: "test-host".to_string(),
                version: "wireguard-tools v1.0.0".to_string(),
            }
        }
    }
}
