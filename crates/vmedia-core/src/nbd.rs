use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of one `/dev/nbdN` block device.
///
/// Slots are keyed by this identity: uevent fan-out and the gadget
/// controller both match on it, so two slots must never share one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NbdDevice {
    index: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("not an NBD device node: {0}")]
pub struct InvalidNbdDevice(String);

impl NbdDevice {
    pub fn new(index: u8) -> Self {
        Self { index }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Device node path, e.g. `/dev/nbd0`.
    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/nbd{}", self.index))
    }

    /// Kernel name as it appears in sysfs and uevent `DEVNAME`, e.g. `nbd0`.
    pub fn sys_name(&self) -> String {
        format!("nbd{}", self.index)
    }
}

impl fmt::Display for NbdDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/dev/nbd{}", self.index)
    }
}

impl FromStr for NbdDevice {
    type Err = InvalidNbdDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("/dev/").unwrap_or(s);
        let digits = name
            .strip_prefix("nbd")
            .ok_or_else(|| InvalidNbdDevice(s.to_string()))?;
        if digits.is_empty() {
            return Err(InvalidNbdDevice(s.to_string()));
        }
        let index = digits
            .parse::<u8>()
            .map_err(|_| InvalidNbdDevice(s.to_string()))?;
        Ok(Self { index })
    }
}

impl TryFrom<String> for NbdDevice {
    type Error = InvalidNbdDevice;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NbdDevice> for String {
    fn from(value: NbdDevice) -> Self {
        value.to_string()
    }
}
