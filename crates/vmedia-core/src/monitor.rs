//! Kernel uevent monitor for the configured NBD devices.
//!
//! One netlink subscription per daemon, opened at startup. Incoming uevents
//! are filtered down to block-device events for registered NBD devices and
//! fanned out to every slot; delivery per device is FIFO because a single
//! task reads the socket and dispatches inline.

use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{Context, Result};
use nix::sys::socket::{
    bind, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace, warn};

use crate::nbd::NbdDevice;

/// Device state change as observed from the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceChange {
    Inserted,
    Removed,
}

const KERNEL_MCAST_GROUP: u32 = 1;
const UEVENT_BUF_LEN: usize = 8192;

#[derive(Debug, Default, PartialEq, Eq)]
struct Uevent {
    action: String,
    subsystem: Option<String>,
    devname: Option<String>,
}

/// Parse a kernel uevent datagram: `action@devpath\0KEY=VALUE\0…`.
fn parse_uevent(data: &[u8]) -> Option<Uevent> {
    let mut fields = data.split(|b| *b == 0);
    let header = std::str::from_utf8(fields.next()?).ok()?;
    let (action, _devpath) = header.split_once('@')?;
    let mut event = Uevent {
        action: action.to_string(),
        ..Uevent::default()
    };
    for field in fields {
        let Ok(field) = std::str::from_utf8(field) else {
            continue;
        };
        if let Some(value) = field.strip_prefix("SUBSYSTEM=") {
            event.subsystem = Some(value.to_string());
        } else if let Some(value) = field.strip_prefix("DEVNAME=") {
            event.devname = Some(value.to_string());
        }
    }
    Some(event)
}

/// NBD nodes exist from boot; attach and detach manifest as `change` events,
/// distinguished by whether the device currently has a non-zero size.
fn probe_size(device: &NbdDevice) -> Option<u64> {
    let path = format!("/sys/class/block/{}/size", device.sys_name());
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

pub struct DeviceMonitor {
    fd: AsyncFd<OwnedFd>,
    devices: HashSet<NbdDevice>,
}

impl DeviceMonitor {
    /// Subscribe to the kernel uevent multicast group.
    pub fn new() -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .context("open netlink uevent socket")?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, KERNEL_MCAST_GROUP))
            .context("bind netlink uevent socket")?;
        Ok(Self {
            fd: AsyncFd::new(fd).context("register netlink socket with the runtime")?,
            devices: HashSet::new(),
        })
    }

    /// Register a device of interest. Call before [`run`](Self::run).
    pub fn add_device(&mut self, device: NbdDevice) {
        debug!(device = %device, "monitoring NBD device");
        self.devices.insert(device);
    }

    /// Read uevents forever, dispatching matching state changes.
    pub async fn run<F>(self, mut dispatch: F) -> Result<()>
    where
        F: FnMut(NbdDevice, DeviceChange),
    {
        let mut buf = [0u8; UEVENT_BUF_LEN];
        loop {
            let len = {
                let mut guard = self.fd.readable().await.context("await uevent socket")?;
                match guard.try_io(|fd| {
                    nix::sys::socket::recv(fd.get_ref().as_raw_fd(), &mut buf, MsgFlags::empty())
                        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
                }) {
                    Ok(Ok(len)) => len,
                    Ok(Err(err)) => return Err(err).context("read uevent datagram"),
                    Err(_would_block) => continue,
                }
            };
            let Some(event) = parse_uevent(&buf[..len]) else {
                trace!("unparseable uevent datagram");
                continue;
            };
            if event.subsystem.as_deref() != Some("block") {
                continue;
            }
            let Some(devname) = event.devname.as_deref() else {
                continue;
            };
            let Some(device) = self
                .devices
                .iter()
                .find(|dev| dev.sys_name() == devname)
                .copied()
            else {
                continue;
            };
            let change = match event.action.as_str() {
                "add" => DeviceChange::Inserted,
                "remove" => DeviceChange::Removed,
                "change" => match probe_size(&device) {
                    Some(size) if size > 0 => DeviceChange::Inserted,
                    Some(_) => DeviceChange::Removed,
                    None => {
                        warn!(device = %device, "size probe failed on change event");
                        continue;
                    }
                },
                other => {
                    trace!(device = %device, action = other, "ignoring uevent action");
                    continue;
                }
            };
            debug!(device = %device, ?change, "device state change");
            dispatch(device, change);
        }
    }
}

/// Ask the kernel to replay the current state of `device`.
///
/// The monitor subscribes after boot, so a device that came up earlier would
/// otherwise never report; a synthesized `change` event closes the gap.
pub fn force_udev_change(device: &NbdDevice) -> io::Result<()> {
    let path = format!("/sys/class/block/{}/uevent", device.sys_name());
    std::fs::write(path, b"change")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(parts: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in parts {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn parses_block_add_event() {
        let data = datagram(&[
            "add@/devices/virtual/block/nbd0",
            "ACTION=add",
            "DEVPATH=/devices/virtual/block/nbd0",
            "SUBSYSTEM=block",
            "DEVNAME=nbd0",
            "SEQNUM=4711",
        ]);
        let event = parse_uevent(&data).unwrap();
        assert_eq!(event.action, "add");
        assert_eq!(event.subsystem.as_deref(), Some("block"));
        assert_eq!(event.devname.as_deref(), Some("nbd0"));
    }

    #[test]
    fn ignores_garbage_and_headerless_datagrams() {
        assert_eq!(parse_uevent(b"\xff\xfe\x00"), None);
        assert_eq!(parse_uevent(b"libudev\0stuff\0"), None);
        assert_eq!(parse_uevent(b""), None);
    }

    #[test]
    fn missing_fields_stay_none() {
        let data = datagram(&["remove@/devices/virtual/block/nbd1", "ACTION=remove"]);
        let event = parse_uevent(&data).unwrap();
        assert_eq!(event.action, "remove");
        assert_eq!(event.subsystem, None);
        assert_eq!(event.devname, None);
    }
}
