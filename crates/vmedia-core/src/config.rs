//! Daemon configuration.
//!
//! Read once at startup from a JSON document; an invalid configuration makes
//! the daemon exit non-zero before any interface is exported.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::nbd::NbdDevice;

/// Slot operating mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum Mode {
    /// Image data arrives on the slot's unix socket from an external producer.
    Proxy,
    /// The daemon sources the image itself from a CIFS or HTTPS URL.
    Legacy,
}

/// Immutable per-slot configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct MountPointConfig {
    #[serde(rename = "Mode")]
    pub mode: Mode,
    #[serde(rename = "NBDDevice")]
    pub nbd_device: NbdDevice,
    #[serde(rename = "UnixSocket")]
    pub unix_socket: PathBuf,
    #[serde(rename = "EndpointId")]
    pub endpoint_id: String,
    /// NBD client connection timeout, seconds.
    #[serde(rename = "Timeout", default)]
    pub timeout: Option<u32>,
    /// NBD block size hint, bytes.
    #[serde(rename = "BlockSize", default)]
    pub block_size: Option<u32>,
    /// Pass `--verbose` to the userspace NBD server. Swarm of logs.
    #[serde(rename = "VerboseNbdLogs", default)]
    pub verbose_nbd_logs: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Configuration {
    #[serde(rename = "MountPoints")]
    pub mount_points: BTreeMap<String, MountPointConfig>,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("read configuration {}", path.display()))?;
        let config: Configuration = serde_json::from_slice(&data)
            .with_context(|| format!("decode configuration {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-slot validation: the NBD device table and the unix socket paths
    /// are partitioned between slots, so duplicates are configuration errors.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.mount_points.is_empty(),
            "configuration declares no mount points"
        );
        let mut devices = HashSet::new();
        let mut sockets = HashSet::new();
        for (name, mp) in &self.mount_points {
            ensure!(!name.is_empty(), "mount point with empty name");
            ensure!(
                !mp.endpoint_id.is_empty(),
                "mount point {name} has an empty EndpointId"
            );
            ensure!(
                devices.insert(mp.nbd_device),
                "mount point {name} reuses NBD device {}",
                mp.nbd_device
            );
            ensure!(
                sockets.insert(mp.unix_socket.clone()),
                "mount point {name} reuses unix socket {}",
                mp.unix_socket.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(doc: &str) -> Result<Configuration> {
        let config: Configuration = serde_json::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn parses_proxy_and_legacy_slots() {
        let config = parse(
            r#"{
                "MountPoints": {
                    "Slot_0": {
                        "Mode": "Proxy",
                        "NBDDevice": "/dev/nbd0",
                        "UnixSocket": "/run/virtual-media/nbd0.sock",
                        "EndpointId": "/nbd/0",
                        "Timeout": 30,
                        "BlockSize": 512
                    },
                    "Slot_1": {
                        "Mode": "Legacy",
                        "NBDDevice": "/dev/nbd1",
                        "UnixSocket": "/run/virtual-media/nbd1.sock",
                        "EndpointId": "/nbd/1",
                        "VerboseNbdLogs": true
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mount_points.len(), 2);
        let slot0 = &config.mount_points["Slot_0"];
        assert_eq!(slot0.mode, Mode::Proxy);
        assert_eq!(slot0.nbd_device, NbdDevice::new(0));
        assert_eq!(slot0.timeout, Some(30));
        assert!(config.mount_points["Slot_1"].verbose_nbd_logs);
    }

    #[test]
    fn rejects_duplicate_devices() {
        let err = parse(
            r#"{
                "MountPoints": {
                    "A": {"Mode": "Proxy", "NBDDevice": "/dev/nbd0",
                          "UnixSocket": "/run/a.sock", "EndpointId": "/nbd/0"},
                    "B": {"Mode": "Proxy", "NBDDevice": "/dev/nbd0",
                          "UnixSocket": "/run/b.sock", "EndpointId": "/nbd/1"}
                }
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reuses NBD device"));
    }

    #[test]
    fn rejects_duplicate_sockets_and_empty_config() {
        assert!(parse(r#"{"MountPoints": {}}"#).is_err());
        let err = parse(
            r#"{
                "MountPoints": {
                    "A": {"Mode": "Proxy", "NBDDevice": "/dev/nbd0",
                          "UnixSocket": "/run/a.sock", "EndpointId": "/nbd/0"},
                    "B": {"Mode": "Legacy", "NBDDevice": "/dev/nbd1",
                          "UnixSocket": "/run/a.sock", "EndpointId": "/nbd/1"}
                }
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reuses unix socket"));
    }

    #[test]
    fn rejects_bad_device_node() {
        let err = parse(
            r#"{
                "MountPoints": {
                    "A": {"Mode": "Proxy", "NBDDevice": "/dev/sda",
                          "UnixSocket": "/run/a.sock", "EndpointId": "/nbd/0"}
                }
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("NBD"));
    }
}
