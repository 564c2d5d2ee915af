//! Core of the virtual media daemon.
//!
//! Exposes remote storage images as locally-attached USB mass-storage
//! devices: each configured slot ties an NBD device, a userspace NBD
//! subprocess, a USB gadget, and a management IPC object tree together
//! through a per-slot state machine.

pub mod config;
pub mod credentials;
pub mod gadget;
pub mod ipc;
pub mod machine;
pub mod monitor;
pub mod nbd;
pub mod nbdkit;
pub mod process;
pub mod redfish;
pub mod smb;

pub use config::{Configuration, Mode, MountPointConfig};
pub use credentials::{Credentials, VolatileFile};
pub use gadget::{ConfigfsGadget, GadgetController};
pub use ipc::{IpcRequest, IpcResponse, IpcServer, SlotHandle, VirtualMediaService};
pub use machine::{
    run_slot, ErrorKind, MountPointController, MountRequest, SlotActors, SlotError, SlotEvent,
    SlotSnapshot, StateKind,
};
pub use monitor::{DeviceChange, DeviceMonitor};
pub use nbd::NbdDevice;
pub use process::{Executor, HostExecutor, ProcessExit, ProcessHandle};
pub use redfish::{RedfishNotifier, ResourceEvents};
pub use smb::{CifsMounter, ShareMounter};
