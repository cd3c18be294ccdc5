//! Config synthesis: per-peer `.conf` text, babeld fragment, manifest

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::MeshError;
use crate::keys::PskCache;
use crate::keys::PskStrategy;
use crate::mesh::resolver::ResolvedMesh;
use crate::mesh::spec::{EndpointVersion, MeshSpec};

/// One file of the generated bundle, path relative to the bundle root.
#[derive(Debug, Clone)]
pub struct BundleFile {
    pub path: String,
    pub contents: String,
}

/// The complete rendered bundle.
#[derive(Debug, Clone)]
pub struct MeshBundle {
    pub files: Vec<BundleFile>,
}

/// Summary document packaged with the generated configs.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    network_cidr: &'a str,
    interface_name: &'a str,
    endpoint_version: EndpointVersion,
    auto_generate_keys: bool,
    nodes: Vec<ManifestNode<'a>>,
    clients: Vec<ManifestClient<'a>>,
    neighbors: BTreeMap<&'a str, Vec<&'a str>>,
    psk_pairs: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestNode<'a> {
    name: &'a str,
    address: &'a str,
    endpoint: &'a str,
    listen_port: u16,
    public_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestClient<'a> {
    name: &'a str,
    address: &'a str,
    public_key: &'a str,
    gateways: Vec<&'a str>,
}

/// Renders every artifact of the resolved mesh: node configs (plus the
/// optional babeld fragment), client configs, and the manifest.
pub fn render_bundle(
    spec: &MeshSpec,
    mesh: &ResolvedMesh,
    psk: &dyn PskStrategy,
) -> Result<MeshBundle, MeshError> {
    let mut cache = PskCache::new(psk);
    let iface_file = format!("{}.conf", sanitize_filename(&spec.interface_name));
    let mut files = Vec::new();

    for (i, node) in mesh.nodes.iter().enumerate() {
        let dir = format!("nodes/{}", sanitize_filename(&node.name));
        files.push(BundleFile {
            path: format!("{dir}/{iface_file}"),
            contents: render_node_config(spec, mesh, i, &mut cache),
        });
        if spec.enable_babel {
            files.push(BundleFile {
                path: format!("{dir}/babeld.conf"),
                contents: render_babel_config(&spec.interface_name, &spec.network_cidr),
            });
        }
    }

    for (i, client) in mesh.clients.iter().enumerate() {
        files.push(BundleFile {
            path: format!("clients/{}/{iface_file}", sanitize_filename(&client.name)),
            contents: render_client_config(spec, mesh, i, &mut cache),
        });
    }

    files.push(BundleFile {
        path: "manifest.json".to_string(),
        contents: render_manifest(spec, mesh, &cache)?,
    });

    Ok(MeshBundle { files })
}

/// `[Interface]` plus one `[Peer]` per neighbor; gateways additionally
/// carry one `[Peer]` per client (no Endpoint or Keepalive).
pub fn render_node_config(
    spec: &MeshSpec,
    mesh: &ResolvedMesh,
    index: usize,
    psk: &mut PskCache<'_>,
) -> String {
    let node = &mesh.nodes[index];
    let mut lines = vec![
        "[Interface]".to_string(),
        format!("Address = {}/32", node.address),
        format!("ListenPort = {}", node.listen_port),
        format!("PrivateKey = {}", node.private_key),
    ];
    if spec.include_ip_forwarding {
        lines.push("PostUp = sysctl -w net.ipv4.ip_forward=1".to_string());
        lines.push("PostDown = sysctl -w net.ipv4.ip_forward=0".to_string());
    }

    for &j in &mesh.neighbors[index] {
        let peer = &mesh.nodes[j];
        lines.push(String::new());
        lines.push(format!("# {}", peer.name));
        lines.push("[Peer]".to_string());
        lines.push(format!("PublicKey = {}", peer.public_key));
        lines.push(format!("PresharedKey = {}", psk.get(&node.name, &peer.name)));
        lines.push(format!("AllowedIPs = {}/32", peer.address));
        lines.push(format!(
            "Endpoint = {}",
            format_endpoint(&peer.endpoint, peer.listen_port, spec.endpoint_version)
        ));
        lines.push(format!(
            "PersistentKeepalive = {}",
            spec.persistent_keepalive
        ));
    }

    if spec.gateway_node_names.iter().any(|g| g == &node.name) {
        for client in &mesh.clients {
            lines.push(String::new());
            lines.push(format!("# {}", client.name));
            lines.push("[Peer]".to_string());
            lines.push(format!("PublicKey = {}", client.public_key));
            lines.push(format!(
                "PresharedKey = {}",
                psk.get(&client.name, &node.name)
            ));
            lines.push(format!("AllowedIPs = {}/32", client.address));
        }
    }

    lines.join("\n") + "\n"
}

/// Client config: one `[Peer]` per gateway with the whole network as
/// AllowedIPs.
pub fn render_client_config(
    spec: &MeshSpec,
    mesh: &ResolvedMesh,
    index: usize,
    psk: &mut PskCache<'_>,
) -> String {
    let client = &mesh.clients[index];
    let mut lines = vec![
        "[Interface]".to_string(),
        format!("Address = {}/32", client.address),
        format!("PrivateKey = {}", client.private_key),
    ];

    for gateway_name in &spec.gateway_node_names {
        let Some(gateway) = mesh.node_by_name(gateway_name) else {
            continue;
        };
        lines.push(String::new());
        lines.push(format!("# {}", gateway.name));
        lines.push("[Peer]".to_string());
        lines.push(format!("PublicKey = {}", gateway.public_key));
        lines.push(format!(
            "PresharedKey = {}",
            psk.get(&client.name, &gateway.name)
        ));
        lines.push(format!("AllowedIPs = {}", spec.network_cidr));
        lines.push(format!(
            "Endpoint = {}",
            format_endpoint(&gateway.endpoint, gateway.listen_port, spec.endpoint_version)
        ));
        lines.push(format!(
            "PersistentKeepalive = {}",
            spec.persistent_keepalive
        ));
    }

    lines.join("\n") + "\n"
}

/// Routing-daemon fragment redistributing the mesh network.
pub fn render_babel_config(interface: &str, cidr: &str) -> String {
    format!("interface {interface}\nredistribute local\nredistribute ip {cidr}\n")
}

fn render_manifest(
    spec: &MeshSpec,
    mesh: &ResolvedMesh,
    psk: &PskCache<'_>,
) -> Result<String, MeshError> {
    let gateways: Vec<&str> = spec.gateway_node_names.iter().map(String::as_str).collect();
    let manifest = Manifest {
        network_cidr: &spec.network_cidr,
        interface_name: &spec.interface_name,
        endpoint_version: spec.endpoint_version,
        auto_generate_keys: spec.auto_generate_keys,
        nodes: mesh
            .nodes
            .iter()
            .map(|n| ManifestNode {
                name: &n.name,
                address: &n.address,
                endpoint: &n.endpoint,
                listen_port: n.listen_port,
                public_key: &n.public_key,
            })
            .collect(),
        clients: mesh
            .clients
            .iter()
            .map(|c| ManifestClient {
                name: &c.name,
                address: &c.address,
                public_key: &c.public_key,
                gateways: gateways.clone(),
            })
            .collect(),
        neighbors: mesh
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                (
                    n.name.as_str(),
                    mesh.neighbors[i]
                        .iter()
                        .map(|&j| mesh.nodes[j].name.as_str())
                        .collect(),
                )
            })
            .collect(),
        psk_pairs: psk.pairs().into_iter().collect(),
    };

    serde_json::to_string_pretty(&manifest).map_err(|e| MeshError::Validation {
        field: "manifest".to_string(),
        message: e.to_string(),
    })
}

/// Trims, then collapses every run of characters outside `[A-Za-z0-9_-]`
/// into a single underscore.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// `host:port`, with ipv6 hosts re-bracketed.
pub fn format_endpoint(host: &str, port: u16, version: EndpointVersion) -> String {
    match version {
        EndpointVersion::Ipv6 => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            format!("[{host}]:{port}")
        }
        EndpointVersion::Ipv4 => format!("{host}:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DeterministicPsk;
    use crate::mesh::resolver::resolve;
    use crate::mesh::spec::test_fixtures::basic_spec;

    fn rendered_basic() -> (MeshSpec, ResolvedMesh, MeshBundle) {
        let spec = basic_spec();
        let mesh = resolve(&spec).unwrap();
        let bundle = render_bundle(&spec, &mesh, &DeterministicPsk).unwrap();
        (spec, mesh, bundle)
    }

    fn file<'a>(bundle: &'a MeshBundle, path: &str) -> &'a str {
        &bundle
            .files
            .iter()
            .find(|f| f.path == path)
            .unwrap_or_else(|| panic!("missing bundle file {path}"))
            .contents
    }

    #[test]
    fn bundle_layout_matches_contract() {
        let (_, _, bundle) = rendered_basic();
        let paths: Vec<_> = bundle.files.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"nodes/N1/wg0.conf"));
        assert!(paths.contains(&"nodes/N1/babeld.conf"));
        assert!(paths.contains(&"nodes/N3/wg0.conf"));
        assert!(paths.contains(&"clients/C1/wg0.conf"));
        assert!(paths.contains(&"manifest.json"));
    }

    #[test]
    fn node_interface_section_is_complete() {
        let (_, _, bundle) = rendered_basic();
        let conf = file(&bundle, "nodes/N1/wg0.conf");
        assert!(conf.starts_with("[Interface]\nAddress = 10.20.0.1/32\nListenPort = 51820\n"));
        assert!(conf.contains("PostUp = sysctl -w net.ipv4.ip_forward=1"));
        assert!(conf.contains("PostDown = sysctl -w net.ipv4.ip_forward=0"));
    }

    #[test]
    fn gateway_carries_client_peer_section() {
        let (_, mesh, bundle) = rendered_basic();
        let conf = file(&bundle, "nodes/N1/wg0.conf");
        assert!(conf.contains("# C1"));
        assert!(conf.contains(&format!("PublicKey = {}", mesh.clients[0].public_key)));
        assert!(conf.contains("AllowedIPs = 10.20.0.101/32"));
        // Client sections have no endpoint or keepalive; N1 has two node
        // peers and one client peer, so exactly two Endpoint lines.
        assert_eq!(conf.matches("Endpoint = ").count(), 2);
    }

    #[test]
    fn non_gateway_has_no_client_sections() {
        let (_, _, bundle) = rendered_basic();
        let conf = file(&bundle, "nodes/N2/wg0.conf");
        assert!(!conf.contains("# C1"));
    }

    #[test]
    fn client_peers_gateway_with_network_allowed_ips() {
        let (_, mesh, bundle) = rendered_basic();
        let conf = file(&bundle, "clients/C1/wg0.conf");
        assert!(conf.contains("Address = 10.20.0.101/32"));
        assert!(conf.contains(&format!("PublicKey = {}", mesh.nodes[0].public_key)));
        assert!(conf.contains("AllowedIPs = 10.20.0.0/24"));
        assert!(conf.contains("Endpoint = 1.1.1.1:51820"));
        assert!(conf.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn psk_agrees_between_both_sides_of_a_tunnel() {
        let (_, _, bundle) = rendered_basic();
        let n1 = file(&bundle, "nodes/N1/wg0.conf");
        let n2 = file(&bundle, "nodes/N2/wg0.conf");
        let psk_of = |conf: &str| {
            conf.lines()
                .filter(|l| l.starts_with("PresharedKey = "))
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        // N1's first neighbor peer is N2 and vice versa; their PSK lines
        // must intersect.
        assert!(psk_of(n1).iter().any(|l| psk_of(n2).contains(l)));
    }

    #[test]
    fn babel_fragment_has_three_lines() {
        let conf = render_babel_config("wg0", "10.20.0.0/24");
        assert_eq!(
            conf,
            "interface wg0\nredistribute local\nredistribute ip 10.20.0.0/24\n"
        );
    }

    #[test]
    fn manifest_is_deterministic_with_fixed_keys() {
        let mut spec = basic_spec();
        spec.auto_generate_keys = false;
        for node in &mut spec.nodes {
            let (private, public) = crate::keys::generate_keypair();
            node.private_key = Some(private);
            node.public_key = Some(public);
        }
        for client in &mut spec.clients {
            let (private, public) = crate::keys::generate_keypair();
            client.private_key = Some(private);
            client.public_key = Some(public);
        }

        let render = |spec: &MeshSpec| {
            let mesh = resolve(spec).unwrap();
            let bundle = render_bundle(spec, &mesh, &DeterministicPsk).unwrap();
            bundle
                .files
                .iter()
                .find(|f| f.path == "manifest.json")
                .unwrap()
                .contents
                .clone()
        };
        assert_eq!(render(&spec), render(&spec));
    }

    #[test]
    fn manifest_records_topology() {
        let (_, _, bundle) = rendered_basic();
        let manifest: serde_json::Value =
            serde_json::from_str(file(&bundle, "manifest.json")).unwrap();
        assert_eq!(manifest["networkCidr"], "10.20.0.0/24");
        let n1_neighbors: Vec<_> = manifest["neighbors"]["N1"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(n1_neighbors, vec!["N2", "N3"]);
        assert_eq!(manifest["clients"][0]["gateways"][0], "N1");
        assert!(manifest["pskPairs"].as_object().unwrap().len() >= 4);
    }

    #[test]
    fn sanitize_collapses_runs() {
        assert_eq!(sanitize_filename("  my node #1!  "), "my_node_1_");
        assert_eq!(sanitize_filename("wg0"), "wg0");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
    }

    #[test]
    fn ipv6_endpoints_are_bracketed() {
        assert_eq!(
            format_endpoint("2001:db8::1", 51820, EndpointVersion::Ipv6),
            "[2001:db8::1]:51820"
        );
        assert_eq!(
            format_endpoint("[2001:db8::1]", 51820, EndpointVersion::Ipv6),
            "[2001:db8::1]:51820"
        );
        assert_eq!(
            format_endpoint("1.1.1.1", 51820, EndpointVersion::Ipv4),
            "1.1.1.1:51820"
        );
    }
}
