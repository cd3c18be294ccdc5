//! `wg`/`ip` subprocess implementation of the runtime adapter

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::store::Peer;

use super::{RuntimeInterface, RuntimePeer, SystemInfo, UpInterfaceOptions, WgRuntime};

/// Adapter shelling out to the `wg` and `ip` tools.
#[derive(Debug, Clone)]
pub struct WgCli {
    wg_bin: String,
    ip_bin: String,
}

impl Default for WgCli {
    fn default() -> Self {
        Self::new("wg", "ip")
    }
}

impl WgCli {
    pub fn new(wg_bin: impl Into<String>, ip_bin: impl Into<String>) -> Self {
        Self {
            wg_bin: wg_bin.into(),
            ip_bin: ip_bin.into(),
        }
    }

    async fn run(
        &self,
        program: &str,
        args: &[&str],
        interface: Option<&str>,
    ) -> Result<String, RuntimeError> {
        debug!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.contains("No such device") || stderr.contains("Unable to access interface") {
            return Err(RuntimeError::NotExists {
                name: interface.unwrap_or_default().to_string(),
            });
        }

        Err(RuntimeError::Command {
            message: format!("{} {} failed", program, args.first().unwrap_or(&"")),
            code: output.status.code(),
            stderr: Some(stderr),
        })
    }

    async fn wg(&self, interface: Option<&str>, args: &[&str]) -> Result<String, RuntimeError> {
        self.run(&self.wg_bin, args, interface).await
    }

    async fn ip(&self, interface: Option<&str>, args: &[&str]) -> Result<String, RuntimeError> {
        self.run(&self.ip_bin, args, interface).await
    }
}

#[async_trait]
impl WgRuntime for WgCli {
    async fn list_interfaces(&self) -> Result<Vec<String>, RuntimeError> {
        let out = self.wg(None, &["show", "interfaces"]).await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    async fn get_interface(&self, name: &str) -> Result<RuntimeInterface, RuntimeError> {
        let out = self.wg(Some(name), &["show", name, "dump"]).await?;
        parse_dump(&out)
    }

    async fn add_peer(&self, interface: &str, peer: &Peer) -> Result<(), RuntimeError> {
        // The PSK travels through a 0600 file, never argv.
        let psk_file = peer
            .preshared_key
            .as_deref()
            .map(TempSecretFile::create)
            .transpose()?;

        let mut args: Vec<String> = vec![
            "set".into(),
            interface.into(),
            "peer".into(),
            peer.public_key.clone(),
            "allowed-ips".into(),
            peer.allowed_ips.join(","),
        ];
        if let Some(endpoint) = &peer.endpoint {
            args.push("endpoint".into());
            args.push(endpoint.clone());
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            args.push("persistent-keepalive".into());
            args.push(keepalive.to_string());
        }
        if let Some(file) = &psk_file {
            args.push("preshared-key".into());
            args.push(file.path_str().to_string());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.wg(Some(interface), &arg_refs).await?;
        Ok(())
    }

    async fn remove_peer(
        &self,
        interface: &str,
        public_key: &str,
        ignore_if_missing: bool,
    ) -> Result<(), RuntimeError> {
        let result = self
            .wg(Some(interface), &["set", interface, "peer", public_key, "remove"])
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if ignore_if_missing && is_missing_peer(&e) => {
                debug!("peer {} already gone from {}", public_key, interface);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn update_peer(&self, interface: &str, peer: &Peer) -> Result<(), RuntimeError> {
        // wg set is a reconfigure; an update is the same invocation.
        self.add_peer(interface, peer).await
    }

    async fn toggle_interface(&self, interface: &str, is_up: bool) -> Result<(), RuntimeError> {
        let verb = if is_up { "up" } else { "down" };
        self.ip(Some(interface), &["link", "set", interface, verb]).await?;
        Ok(())
    }

    async fn up_interface(
        &self,
        interface: &str,
        options: &UpInterfaceOptions,
    ) -> Result<(), RuntimeError> {
        if let Err(e) = self
            .ip(Some(interface), &["link", "add", "dev", interface, "type", "wireguard"])
            .await
        {
            if !is_already_exists(&e) {
                return Err(e);
            }
        }

        if let Some(private_key) = &options.private_key {
            let key_file = TempSecretFile::create(private_key)?;
            let port = options.listen_port.to_string();
            self.wg(Some(interface), &[
                "set",
                interface,
                "private-key",
                key_file.path_str(),
                "listen-port",
                &port,
            ])
            .await?;
        }

        if let Some(address) = &options.address {
            if let Err(e) = self.ip(Some(interface), &["addr", "add", address, "dev", interface]).await {
                if !is_already_exists(&e) {
                    return Err(e);
                }
            }
        }

        self.ip(Some(interface), &["link", "set", interface, "up"]).await?;
        Ok(())
    }

    async fn get_system_info(&self) -> SystemInfo {
        let hostname = match self.run("hostname", &[], None).await {
            Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
            _ => "unknown".to_string(),
        };
        let version = match self.wg(None, &["--version"]).await {
            Ok(out) if !out.trim().is_empty() => out.lines().next().unwrap_or("unknown").to_string(),
            _ => "unknown".to_string(),
        };
        SystemInfo { hostname, version }
    }
}

/// Parses `wg show <iface> dump`: one interface line with 4 fields, then
/// one peer line with 8 fields each, tab-separated.
fn parse_dump(dump: &str) -> Result<RuntimeInterface, RuntimeError> {
    let mut lines = dump.lines().filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| RuntimeError::BadOutput("empty dump".to_string()))?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() != 4 {
        return Err(RuntimeError::BadOutput(format!(
            "interface line has {} fields",
            fields.len()
        )));
    }

    let mut iface = RuntimeInterface {
        private_key: none_if_unset(fields[0]),
        public_key: none_if_unset(fields[1]),
        listen_port: fields[2].parse().unwrap_or(0),
        fwmark: (fields[3] != "off").then(|| fields[3].to_string()),
        ..RuntimeInterface::default()
    };

    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 8 {
            return Err(RuntimeError::BadOutput(format!(
                "peer line has {} fields",
                fields.len()
            )));
        }
        iface.peers.push(RuntimePeer {
            public_key: fields[0].to_string(),
            preshared_key: none_if_unset(fields[1]),
            endpoint: none_if_unset(fields[2]),
            allowed_ips: fields[3]
                .split(',')
                .filter(|s| !s.is_empty() && *s != "(none)")
                .map(str::to_string)
                .collect(),
            latest_handshake: fields[4].parse().unwrap_or(0),
            transfer_rx: fields[5].parse().unwrap_or(0),
            transfer_tx: fields[6].parse().unwrap_or(0),
            persistent_keepalive: fields[7].parse().ok(),
        });
    }

    Ok(iface)
}

fn none_if_unset(field: &str) -> Option<String> {
    (field != "(none)" && !field.is_empty()).then(|| field.to_string())
}

fn is_missing_peer(err: &RuntimeError) -> bool {
    if err.is_not_exists() {
        return true;
    }
    match err {
        RuntimeError::Command { stderr, .. } => stderr
            .as_deref()
            .map(|s| s.to_lowercase().contains("not found"))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_already_exists(err: &RuntimeError) -> bool {
    match err {
        RuntimeError::Command { stderr, .. } => stderr
            .as_deref()
            .map(|s| s.contains("File exists") || s.contains("already exists"))
            .unwrap_or(false),
        _ => false,
    }
}

/// Secret written to a private temp file, unlinked on drop.
struct TempSecretFile {
    path: PathBuf,
}

impl TempSecretFile {
    fn create(secret: &str) -> Result<Self, RuntimeError> {
        let path = std::env::temp_dir().join(format!("wgmeshd-{}.key", uuid::Uuid::new_v4()));
        write_private(&path, secret)?;
        Ok(Self { path })
    }

    fn path_str(&self) -> &str {
        self.path.to_str().unwrap_or_default()
    }
}

impl Drop for TempSecretFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove secret temp file {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(unix)]
fn write_private(path: &PathBuf, secret: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(secret.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &PathBuf, secret: &str) -> std::io::Result<()> {
    std::fs::write(path, secret)
}
