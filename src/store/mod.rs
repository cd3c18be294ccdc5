//! On-disk interface state store
//!
//! A single JSON document describes every managed interface and peer. All
//! access goes through the sibling lock file, and writes land via an
//! atomic replace so readers only ever observe a complete document.

pub mod lock;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use lock::StateLock;

/// Peers persisted before interface tracking existed carry an empty
/// interface name and belong to this one.
pub const DEFAULT_INTERFACE: &str = "wg0";

/// Current schema version of the state document.
pub const STATE_VERSION: u32 = 1;

/// A managed interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InterfaceRecord {
    pub listen_port: u16,
    pub address_cidr: String,
    pub revision: u64,
    pub is_up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// A managed peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Peer {
    pub peer_id: String,
    pub name: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub allowed_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
    /// Tunnel PSK, carried only for peers provisioned from a mesh spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub interface: String,
}

impl Peer {
    /// Interface this peer belongs to, applying the empty-name rule.
    pub fn interface_name(&self) -> &str {
        if self.interface.is_empty() {
            DEFAULT_INTERFACE
        } else {
            &self.interface
        }
    }
}

/// The persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PersistedState {
    pub version: u32,
    pub updated_at: String,
    pub interfaces: BTreeMap<String, InterfaceRecord>,
    pub peers: Vec<Peer>,
}

impl PersistedState {
    /// Fresh empty state for a host with no state file yet.
    pub fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: unix_now_string(),
            interfaces: BTreeMap::new(),
            peers: Vec::new(),
        }
    }

    /// Refreshes the document timestamp.
    pub fn touch(&mut self) {
        self.updated_at = unix_now_string();
    }

    /// Peers of one interface, applying the empty-name rule.
    pub fn peers_for<'a>(&'a self, interface: &'a str) -> impl Iterator<Item = &'a Peer> {
        self.peers.iter().filter(move |p| p.interface_name() == interface)
    }

    fn validate(&self) -> std::result::Result<(), StateError> {
        if self.version != STATE_VERSION {
            return Err(StateError::CorruptState {
                reason: format!("unsupported version {}", self.version),
            });
        }
        for peer in &self.peers {
            if peer.allowed_ips.is_empty() {
                return Err(StateError::CorruptState {
                    reason: format!("peer {} has no allowed IPs", peer.peer_id),
                });
            }
        }
        Ok(())
    }
}

/// Unix-epoch seconds as a string, the document's timestamp format.
pub fn unix_now_string() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lock-guarded store over the persisted document.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl StateStore {
    pub fn new(state_path: impl Into<PathBuf>, lock_path: Option<PathBuf>) -> Self {
        let state_path = state_path.into();
        let lock_path = lock_path.unwrap_or_else(|| {
            let mut os = state_path.clone().into_os_string();
            os.push(".lock");
            PathBuf::from(os)
        });
        Self {
            state_path,
            lock_path,
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Loads the current state under the lock. A missing file is a fresh
    /// empty state.
    pub async fn load(&self) -> Result<PersistedState> {
        let _lock = StateLock::acquire(&self.lock_path).await?;
        Ok(self.read_unlocked()?)
    }

    /// Runs `f` against the loaded state under the lock and persists the
    /// result atomically. Nothing is written when `f` fails, and the
    /// document on disk is only ever the full old or full new state.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut PersistedState) -> Result<R>,
    ) -> Result<R> {
        let _lock = StateLock::acquire(&self.lock_path).await?;
        let mut state = self.read_unlocked()?;
        let out = f(&mut state)?;
        self.persist_unlocked(&state)?;
        Ok(out)
    }

    fn read_unlocked(&self) -> std::result::Result<PersistedState, StateError> {
        let json = match std::fs::read_to_string(&self.state_path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::empty());
            }
            Err(e) => return Err(StateError::Io(e)),
        };

        let state: PersistedState =
            serde_json::from_str(&json).map_err(|e| StateError::CorruptState {
                reason: e.to_string(),
            })?;
        state.validate()?;
        Ok(state)
    }

    /// Atomic replace: temp file, fsync, rename, best-effort dir fsync.
    fn persist_unlocked(&self, state: &PersistedState) -> std::result::Result<(), StateError> {
        use std::io::Write;

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::Io(std::io::Error::other(e)))?;

        let mut tmp_os = self.state_path.clone().into_os_string();
        tmp_os.push(format!(".tmp.{}", unix_millis()));
        let tmp_path = PathBuf::from(tmp_os);

        let result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &self.state_path)?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(StateError::Io(e));
        }

        if let Some(dir) = self.state_path.parent() {
            if let Ok(dir_file) = std::fs::File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub fn peer(interface: &str, name: &str, public_key: &str) -> Peer {
        Peer {
            peer_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            public_key: public_key.to_string(),
            private_key: None,
            allowed_ips: vec!["10.20.0.50/32".to_string()],
            endpoint: None,
            persistent_keepalive: Some(25),
            preshared_key: None,
            is_active: true,
            interface: interface.to_string(),
        }
    }

    pub fn record(revision: u64) -> InterfaceRecord {
        InterfaceRecord {
            listen_port: 51820,
            address_cidr: "10.20.0.1/24".to_string(),
            revision,
            is_up: true,
            private_key: None,
        }
    }
}
