//! Device identity and known-peer records.
//!
//! Each installation creates one `Device` record (uuid v4) on first use and
//! keeps it for the lifetime of the install. Peer devices reported by the
//! remote at login are cached locally so conflict copies and logs can name
//! the device that produced a version. No trust decisions flow from these
//! records; authoritative revocation lives in the account service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::KvStore;
use crate::fingerprint::{device_fingerprint, hostname};

const DEVICE_KEY: &str = "sync.device";
const KNOWN_DEVICES_KEY: &str = "sync.known_devices";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Corrupted device record: {0}")]
    Corrupted(String),

    #[error("Config store error: {0}")]
    Store(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub display_name: String,
    /// Hex fingerprint of host signals. Identifying, not secret.
    pub public_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

pub fn platform() -> &'static str {
    #[cfg(target_os = "windows")]
    return "windows";
    #[cfg(target_os = "macos")]
    return "macos";
    #[cfg(target_os = "linux")]
    return "linux";
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    return "unknown";
}

pub struct DeviceManager<S: KvStore> {
    store: S,
}

impl<S: KvStore> DeviceManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Register this installation, returning the existing record if one was
    /// already created. An unreadable stored record is replaced rather than
    /// kept poisoning every sync attempt.
    pub fn register_device(&self) -> Result<Device> {
        if let Some(raw) = self.store.get(DEVICE_KEY) {
            match serde_json::from_str::<Device>(&raw) {
                Ok(device) => return Ok(device),
                Err(e) => {
                    warn!("Stored device record unreadable ({e}); regenerating identity");
                }
            }
        }

        let now = Utc::now();
        let device = Device {
            id: Uuid::new_v4().to_string(),
            display_name: format!("{} ({})", hostname(), platform()),
            public_fingerprint: device_fingerprint(),
            created_at: now,
            last_seen_at: now,
        };
        self.persist_own(&device)?;
        info!(device_id = %device.id, "Created device identity");
        Ok(device)
    }

    /// This installation's device record.
    pub fn current_device(&self) -> Result<Device> {
        self.register_device()
    }

    /// Bump this device's `last_seen_at` to now.
    pub fn touch(&self) -> Result<Device> {
        let mut device = self.current_device()?;
        device.last_seen_at = Utc::now();
        self.persist_own(&device)?;
        Ok(device)
    }

    /// Peer devices on the account, as last reported by the remote.
    pub fn list_known_devices(&self) -> Result<Vec<Device>> {
        let Some(raw) = self.store.get(KNOWN_DEVICES_KEY) else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw).map_err(|e| DeviceError::Corrupted(e.to_string()))
    }

    /// Upsert peers from a login response. Our own record is skipped, and a
    /// stored peer only moves forward in `last_seen_at`.
    pub fn merge_remote_devices(&self, remote: &[Device]) -> Result<()> {
        let own_id = self.current_device()?.id;
        let mut known = self.list_known_devices()?;

        for device in remote {
            if device.id == own_id {
                continue;
            }
            match known.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => {
                    if device.last_seen_at > existing.last_seen_at {
                        *existing = device.clone();
                    }
                }
                None => known.push(device.clone()),
            }
        }

        known.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.persist_known(&known)
    }

    /// Forget a peer locally. Returns whether a record was removed.
    pub fn revoke_device(&self, id: &str) -> Result<bool> {
        let mut known = self.list_known_devices()?;
        let before = known.len();
        known.retain(|d| d.id != id);
        let removed = known.len() != before;
        if removed {
            self.persist_known(&known)?;
            info!(device_id = %id, "Removed peer device record");
        }
        Ok(removed)
    }

    /// Display label for a device id, for conflict copies and logs.
    pub fn label_for(&self, id: &str) -> Result<String> {
        let own = self.current_device()?;
        if own.id == id {
            return Ok(format!("{} (this device)", own.display_name));
        }
        Ok(self
            .list_known_devices()?
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.display_name.clone())
            .unwrap_or_else(|| format!("unknown device {id}")))
    }

    fn persist_own(&self, device: &Device) -> Result<()> {
        let json =
            serde_json::to_string(device).map_err(|e| DeviceError::Corrupted(e.to_string()))?;
        self.store.set(DEVICE_KEY, &json)?;
        Ok(())
    }

    fn persist_known(&self, devices: &[Device]) -> Result<()> {
        let json =
            serde_json::to_string(devices).map_err(|e| DeviceError::Corrupted(e.to_string()))?;
        self.store.set(KNOWN_DEVICES_KEY, &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryKvStore;
    use std::sync::Arc;

    fn manager() -> DeviceManager<Arc<MemoryKvStore>> {
        DeviceManager::new(Arc::new(MemoryKvStore::new()))
    }

    fn peer(id: &str, name: &str) -> Device {
        let now = Utc::now();
        Device {
            id: id.to_string(),
            display_name: name.to_string(),
            public_fingerprint: "fp".to_string(),
            created_at: now,
            last_seen_at: now,
        }
    }

    #[test]
    fn test_registration_is_idempotent() {
        let mgr = manager();

        let first = mgr.register_device().unwrap();
        let second = mgr.register_device().unwrap();

        assert_eq!(first.id, second.id);
        assert!(!first.display_name.is_empty());
        assert_eq!(first.public_fingerprint.len(), 64);
        assert_eq!(mgr.current_device().unwrap().id, first.id);
    }

    #[test]
    fn test_corrupted_record_regenerates() {
        let mgr = manager();
        mgr.store.set(DEVICE_KEY, "not json").unwrap();

        let device = mgr.current_device().unwrap();
        assert!(Uuid::parse_str(&device.id).is_ok());

        // The replacement was persisted
        assert_eq!(mgr.current_device().unwrap().id, device.id);
    }

    #[test]
    fn test_touch_advances_last_seen() {
        let mgr = manager();
        let before = mgr.current_device().unwrap();

        let after = mgr.touch().unwrap();
        assert_eq!(before.id, after.id);
        assert!(after.last_seen_at >= before.last_seen_at);
    }

    #[test]
    fn test_merge_skips_own_record() {
        let mgr = manager();
        let own = mgr.current_device().unwrap();

        mgr.merge_remote_devices(&[own.clone(), peer("p1", "Laptop")])
            .unwrap();

        let known = mgr.list_known_devices().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].id, "p1");
    }

    #[test]
    fn test_merge_upserts_and_keeps_newer() {
        let mgr = manager();
        mgr.current_device().unwrap();

        let mut old = peer("p1", "Laptop");
        old.last_seen_at = Utc::now() - chrono::Duration::hours(1);
        mgr.merge_remote_devices(&[old.clone()]).unwrap();

        // Stale report does not roll the record back
        let mut stale = old.clone();
        stale.display_name = "Renamed".to_string();
        stale.last_seen_at = old.last_seen_at - chrono::Duration::hours(1);
        mgr.merge_remote_devices(&[stale]).unwrap();
        assert_eq!(mgr.list_known_devices().unwrap()[0].display_name, "Laptop");

        // Fresh report does
        let mut fresh = old;
        fresh.display_name = "Renamed".to_string();
        fresh.last_seen_at = Utc::now();
        mgr.merge_remote_devices(&[fresh]).unwrap();
        assert_eq!(mgr.list_known_devices().unwrap()[0].display_name, "Renamed");
    }

    #[test]
    fn test_revoke_removes_peer() {
        let mgr = manager();
        mgr.current_device().unwrap();
        mgr.merge_remote_devices(&[peer("p1", "Laptop"), peer("p2", "Phone")])
            .unwrap();

        assert!(mgr.revoke_device("p1").unwrap());
        assert!(!mgr.revoke_device("p1").unwrap());

        let known = mgr.list_known_devices().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].id, "p2");
    }

    #[test]
    fn test_label_for() {
        let mgr = manager();
        let own = mgr.current_device().unwrap();
        mgr.merge_remote_devices(&[peer("p1", "Laptop")]).unwrap();

        assert!(mgr.label_for(&own.id).unwrap().contains("this device"));
        assert_eq!(mgr.label_for("p1").unwrap(), "Laptop");
        assert!(mgr.label_for("nope").unwrap().contains("unknown device"));
    }
}
