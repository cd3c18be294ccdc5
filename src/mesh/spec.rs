//! Declarative mesh description and boundary validation

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::MeshError;
use crate::ipam::{Ipv4Cidr, CLIENT_OFFSET, NODE_OFFSET};
use crate::keys;

/// Upper bound on nodes/clients per spec. Far above what any supported
/// CIDR can address; bounds synthesis memory for hostile payloads.
pub const MAX_PEERS: usize = 1000;

/// Interface names: non-empty, at most 32 chars, `[A-Za-z0-9_.-]`.
pub const MAX_INTERFACE_NAME_LEN: usize = 32;

/// IP version used when formatting peer endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointVersion {
    #[default]
    Ipv4,
    Ipv6,
}

/// A long-lived mesh member with a public endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInput {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Host only, no port.
    pub endpoint: String,
    pub listen_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
}

/// A peer that only connects out to gateway nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInput {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Declarative description of a mesh network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshSpec {
    pub network_cidr: String,
    pub interface_name: String,
    #[serde(default)]
    pub endpoint_version: EndpointVersion,
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
    #[serde(default)]
    pub include_ip_forwarding: bool,
    #[serde(default)]
    pub enable_babel: bool,
    #[serde(default = "default_true")]
    pub auto_generate_keys: bool,
    #[serde(default)]
    pub nodes: Vec<NodeInput>,
    #[serde(default)]
    pub clients: Vec<ClientInput>,
    #[serde(default)]
    pub gateway_node_names: Vec<String>,
}

fn default_keepalive() -> u16 {
    25
}

fn default_true() -> bool {
    true
}

impl MeshSpec {
    /// Validates the spec invariants and returns the parsed network.
    ///
    /// Checks CIDR shape and capacity, interface-name charset, name
    /// uniqueness, gateway membership, payload bounds, and that every
    /// supplied key decodes to 32 bytes.
    pub fn validate(&self) -> Result<Ipv4Cidr, MeshError> {
        let cidr = Ipv4Cidr::parse(&self.network_cidr)?;

        validate_interface_name(&self.interface_name)?;

        if self.nodes.len() > MAX_PEERS {
            return Err(MeshError::Validation {
                field: "nodes".to_string(),
                message: format!("at most {MAX_PEERS} nodes supported"),
            });
        }
        if self.clients.len() > MAX_PEERS {
            return Err(MeshError::Validation {
                field: "clients".to_string(),
                message: format!("at most {MAX_PEERS} clients supported"),
            });
        }

        cidr.check_capacity(NODE_OFFSET, self.nodes.len())?;
        cidr.check_capacity(CLIENT_OFFSET, self.clients.len())?;

        let node_names = unique_names("nodes", self.nodes.iter().map(|n| n.name.as_str()))?;
        unique_names("clients", self.clients.iter().map(|c| c.name.as_str()))?;

        for gateway in &self.gateway_node_names {
            if !node_names.contains(gateway.as_str()) {
                return Err(MeshError::UnknownGateway {
                    name: gateway.clone(),
                });
            }
        }

        for node in &self.nodes {
            if node.endpoint.trim().is_empty() {
                return Err(MeshError::Validation {
                    field: format!("nodes.{}.endpoint", node.name),
                    message: "endpoint host is required".to_string(),
                });
            }
            check_keys(&node.name, node.private_key.as_deref(), node.public_key.as_deref())?;
        }
        for client in &self.clients {
            check_keys(
                &client.name,
                client.private_key.as_deref(),
                client.public_key.as_deref(),
            )?;
        }

        Ok(cidr)
    }
}

fn validate_interface_name(name: &str) -> Result<(), MeshError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(MeshError::Validation {
            field: "interfaceName".to_string(),
            message: format!("must be 1..={MAX_INTERFACE_NAME_LEN} chars of [A-Za-z0-9_.-]"),
        })
    }
}

fn unique_names<'a>(
    field: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>, MeshError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(MeshError::Validation {
                field: field.to_string(),
                message: "names must be non-empty".to_string(),
            });
        }
        if !seen.insert(name) {
            return Err(MeshError::Validation {
                field: field.to_string(),
                message: format!("duplicate name {name}"),
            });
        }
    }
    Ok(seen)
}

/// Any key that is present must decode to 32 bytes, whatever the
/// auto-generate setting; the fill rules run later in the resolver.
fn check_keys(peer: &str, private: Option<&str>, public: Option<&str>) -> Result<(), MeshError> {
    for key in [private, public].into_iter().flatten() {
        keys::validate_key(key).map_err(|_| MeshError::Validation {
            field: format!("{peer}.key"),
            message: "keys must be base64 of exactly 32 bytes".to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub fn node(name: &str, endpoint: &str) -> NodeInput {
        NodeInput {
            id: format!("id-{name}"),
            name: name.to_string(),
            private_key: None,
            public_key: None,
            endpoint: endpoint.to_string(),
            listen_port: 51820,
            ssh_user: None,
            ssh_port: None,
        }
    }

    pub fn client(name: &str) -> ClientInput {
        ClientInput {
            id: format!("id-{name}"),
            name: name.to_string(),
            private_key: None,
            public_key: None,
        }
    }

    pub fn basic_spec() -> MeshSpec {
        MeshSpec {
            network_cidr: "10.20.0.0/24".to_string(),
            interface_name: "wg0".to_string(),
            endpoint_version: EndpointVersion::Ipv4,
            persistent_keepalive: 25,
            include_ip_forwarding: true,
            enable_babel: true,
            auto_generate_keys: true,
            nodes: vec![
                node("N1", "1.1.1.1"),
                node("N2", "2.2.2.2"),
                node("N3", "3.3.3.3"),
            ],
            clients: vec![client("C1")],
            gateway_node_names: vec!["N1".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;

    #[test]
    fn basic_spec_validates() {
        assert!(basic_spec().validate().is_ok());
    }

    #[test]
    fn unknown_gateway_rejected() {
        let mut spec = basic_spec();
        spec.gateway_node_names = vec!["N9".to_string()];
        assert!(matches!(
            spec.validate(),
            Err(MeshError::UnknownGateway { name }) if name == "N9"
        ));
    }

    #[test]
    fn duplicate_node_names_rejected() {
        let mut spec = basic_spec();
        spec.nodes.push(node("N1", "4.4.4.4"));
        assert!(matches!(spec.validate(), Err(MeshError::Validation { .. })));
    }

    #[test]
    fn interface_name_charset_enforced() {
        let mut spec = basic_spec();
        spec.interface_name = "wg 0".to_string();
        assert!(spec.validate().is_err());

        spec.interface_name = "a".repeat(33);
        assert!(spec.validate().is_err());

        spec.interface_name = "wg-mesh.0".to_string();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn slash30_single_node_no_clients_fits() {
        let mut spec = basic_spec();
        spec.network_cidr = "192.168.7.0/30".to_string();
        spec.nodes.truncate(1);
        spec.clients.clear();
        spec.gateway_node_names.clear();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn slash30_with_clients_exceeds_capacity() {
        let mut spec = basic_spec();
        spec.network_cidr = "192.168.7.0/30".to_string();
        spec.nodes.truncate(1);
        spec.gateway_node_names.clear();
        spec.clients = vec![client("C1"), client("C2")];
        assert!(matches!(
            spec.validate(),
            Err(MeshError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn malformed_supplied_key_rejected() {
        let mut spec = basic_spec();
        spec.nodes[0].public_key = Some("AAAA".to_string());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spec_deserializes_from_camel_case() {
        let json = r#"{
            "networkCidr": "10.20.0.0/24",
            "interfaceName": "wg0",
            "endpointVersion": "ipv4",
            "persistentKeepalive": 25,
            "includeIpForwarding": true,
            "enableBabel": false,
            "autoGenerateKeys": true,
            "nodes": [{"id": "a", "name": "N1", "endpoint": "1.1.1.1", "listenPort": 51820}],
            "clients": [],
            "gatewayNodeNames": []
        }"#;
        let spec: MeshSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.nodes[0].listen_port, 51820);
        assert!(spec.validate().is_ok());
    }
}
