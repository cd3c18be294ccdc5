//! Mesh resolution: address plan, key fill, neighbor adjacency

use crate::error::MeshError;
use crate::keys;
use crate::mesh::spec::MeshSpec;

/// A node with its assigned address and complete key material.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub id: String,
    pub name: String,
    /// Dotted address without prefix; rendered as /32.
    pub address: String,
    pub endpoint: String,
    pub listen_port: u16,
    pub private_key: String,
    pub public_key: String,
}

/// A client with its assigned address and complete key material.
#[derive(Debug, Clone)]
pub struct ResolvedClient {
    pub id: String,
    pub name: String,
    pub address: String,
    pub private_key: String,
    pub public_key: String,
}

/// The fully resolved mesh: inputs plus everything derived from them.
#[derive(Debug, Clone)]
pub struct ResolvedMesh {
    pub nodes: Vec<ResolvedNode>,
    pub clients: Vec<ResolvedClient>,
    /// Neighbor indices per node, sorted.
    pub neighbors: Vec<Vec<usize>>,
}

impl ResolvedMesh {
    pub fn node_by_name(&self, name: &str) -> Option<&ResolvedNode> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Resolves a validated spec into addresses, keys, and adjacency.
pub fn resolve(spec: &MeshSpec) -> Result<ResolvedMesh, MeshError> {
    let cidr = spec.validate()?;

    let mut nodes = Vec::with_capacity(spec.nodes.len());
    for (i, node) in spec.nodes.iter().enumerate() {
        let (private_key, public_key) = fill_keys(
            &node.name,
            node.private_key.as_deref(),
            node.public_key.as_deref(),
            spec.auto_generate_keys,
        )?;
        nodes.push(ResolvedNode {
            id: node.id.clone(),
            name: node.name.clone(),
            address: cidr.node_address_at(i)?,
            endpoint: node.endpoint.clone(),
            listen_port: node.listen_port,
            private_key,
            public_key,
        });
    }

    let mut clients = Vec::with_capacity(spec.clients.len());
    for (i, client) in spec.clients.iter().enumerate() {
        let (private_key, public_key) = fill_keys(
            &client.name,
            client.private_key.as_deref(),
            client.public_key.as_deref(),
            spec.auto_generate_keys,
        )?;
        clients.push(ResolvedClient {
            id: client.id.clone(),
            name: client.name.clone(),
            address: cidr.client_address_at(i)?,
            private_key,
            public_key,
        });
    }

    let n = nodes.len();
    let neighbors = (0..n).map(|i| neighbors_of(i, n)).collect();

    Ok(ResolvedMesh {
        nodes,
        clients,
        neighbors,
    })
}

/// Key fill rules: generate when auto and both absent, derive the public
/// half from a supplied private key, otherwise both must be present.
fn fill_keys(
    peer: &str,
    private: Option<&str>,
    public: Option<&str>,
    auto_generate: bool,
) -> Result<(String, String), MeshError> {
    match (private, public) {
        (None, None) if auto_generate => Ok(keys::generate_keypair()),
        (Some(private), None) => {
            let public = keys::derive_public(private).map_err(|_| MeshError::MissingKey {
                peer: peer.to_string(),
            })?;
            Ok((private.to_string(), public))
        }
        (Some(private), Some(public)) => Ok((private.to_string(), public.to_string())),
        _ => Err(MeshError::MissingKey {
            peer: peer.to_string(),
        }),
    }
}

/// Closed-form ring adjacency.
///
/// Small meshes are fully connected; rings of six or more add a +/-3
/// chord so the diameter stays low without full-mesh fanout.
pub fn neighbors_of(i: usize, n: usize) -> Vec<usize> {
    if n <= 1 {
        return Vec::new();
    }
    if n == 2 {
        return vec![1 - i];
    }
    if n == 3 {
        return (0..3).filter(|&j| j != i).collect();
    }

    let offsets: &[usize] = if n < 6 { &[1] } else { &[1, 3] };
    let mut out: Vec<usize> = Vec::new();
    for &d in offsets {
        out.push((i + d) % n);
        out.push((i + n - d) % n);
    }
    out.sort_unstable();
    out.dedup();
    out
}
