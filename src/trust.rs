use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

const STORE_VERSION: u32 = 1;

/// A device that completed pairing at least once. `trusted` devices skip
/// the PIN challenge on later connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedDevice {
    pub device_id: String,
    pub name: String,
    pub first_connected: i64,
    pub last_connected: i64,
    #[serde(default)]
    pub connection_count: u64,
    #[serde(default)]
    pub trusted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    devices: Vec<AuthorizedDevice>,
}

/// Persistent whitelist of authorized devices.
///
/// Every mutation writes through to disk so the registry survives restarts;
/// a corrupt or unreadable file degrades to an empty store instead of
/// failing startup.
#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    devices: HashMap<String, AuthorizedDevice>,
}

impl TrustStore {
    pub fn load(path: PathBuf) -> Self {
        let devices = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoreFile>(&raw) {
                Ok(file) => file
                    .devices
                    .into_iter()
                    .map(|d| (d.device_id.clone(), d))
                    .collect(),
                Err(err) => {
                    tracing::warn!(
                        target: "breakwater::trust",
                        path = %path.display(),
                        error = %err,
                        "device whitelist corrupt; starting empty"
                    );
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                tracing::warn!(
                    target: "breakwater::trust",
                    path = %path.display(),
                    error = %err,
                    "device whitelist unreadable; starting empty"
                );
                HashMap::new()
            }
        };
        Self { path, devices }
    }

    pub fn is_known(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.devices
            .get(device_id)
            .map(|d| d.trusted)
            .unwrap_or(false)
    }

    /// Upserts the device after a successful pairing or reconnection. The
    /// in-memory record is updated even when the write-through fails; the
    /// caller decides whether a persistence failure is worth more than a log
    /// line.
    pub fn record_success(
        &mut self,
        device_id: &str,
        name: &str,
        now: i64,
    ) -> Result<(), SecurityError> {
        match self.devices.get_mut(device_id) {
            Some(device) => {
                device.last_connected = now;
                device.connection_count += 1;
                // name may change between connections
                device.name = name.to_string();
            }
            None => {
                self.devices.insert(
                    device_id.to_string(),
                    AuthorizedDevice {
                        device_id: device_id.to_string(),
                        name: name.to_string(),
                        first_connected: now,
                        last_connected: now,
                        connection_count: 1,
                        trusted: false,
                    },
                );
            }
        }
        self.save()
    }

    /// Returns `false` when the device is unknown.
    pub fn set_trusted(&mut self, device_id: &str, trusted: bool) -> Result<bool, SecurityError> {
        match self.devices.get_mut(device_id) {
            Some(device) => {
                device.trusted = trusted;
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes the device outright. Returns `false` when it was unknown.
    pub fn revoke(&mut self, device_id: &str) -> Result<bool, SecurityError> {
        if self.devices.remove(device_id).is_some() {
            self.save()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn devices(&self) -> Vec<AuthorizedDevice> {
        let mut list: Vec<AuthorizedDevice> = self.devices.values().cloned().collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    fn save(&self) -> Result<(), SecurityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = StoreFile {
            version: STORE_VERSION,
            devices: self.devices(),
        };
        let serialized = serde_json::to_string_pretty(&file)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options.open(&self.path)?;
        handle.write_all(serialized.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("breakwater-trust-{}", Uuid::new_v4()))
            .join("authorized_devices.json")
    }

    #[test]
    fn record_success_upserts_and_persists() {
        let path = scratch_path();
        let mut store = TrustStore::load(path.clone());
        store.record_success("dev-1", "Pixel 8", 100).expect("save");
        store.record_success("dev-1", "Pixel 8 Pro", 200).expect("save");

        let reloaded = TrustStore::load(path);
        let devices = reloaded.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Pixel 8 Pro");
        assert_eq!(devices[0].connection_count, 2);
        assert_eq!(devices[0].first_connected, 100);
        assert_eq!(devices[0].last_connected, 200);
        assert!(!devices[0].trusted);
    }

    #[test]
    fn trust_flag_round_trips() {
        let path = scratch_path();
        let mut store = TrustStore::load(path.clone());
        store.record_success("dev-1", "Tablet", 100).expect("save");
        assert!(!store.is_trusted("dev-1"));
        assert!(store.set_trusted("dev-1", true).expect("save"));
        assert!(store.is_trusted("dev-1"));
        assert!(!store.set_trusted("missing", true).expect("no-op"));

        let reloaded = TrustStore::load(path);
        assert!(reloaded.is_trusted("dev-1"));
        assert!(reloaded.is_known("dev-1"));
    }

    #[test]
    fn revoke_removes_device() {
        let path = scratch_path();
        let mut store = TrustStore::load(path.clone());
        store.record_success("dev-1", "Tablet", 100).expect("save");
        assert!(store.revoke("dev-1").expect("save"));
        assert!(!store.revoke("dev-1").expect("no-op"));

        let reloaded = TrustStore::load(path);
        assert!(!reloaded.is_known("dev-1"));
    }

    #[test]
    fn corrupt_file_degrades_to_empty_store() {
        let path = scratch_path();
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{not json").expect("write garbage");
        let store = TrustStore::load(path);
        assert!(store.devices().is_empty());
    }
}
