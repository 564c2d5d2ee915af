//! Per-slot mount state machine.
//!
//! Each slot is owned by a single task that applies one event at a time, so
//! transitions never race and need no internal locking. Applying an event
//! mutates state, starts I/O, and returns; completions of that I/O come back
//! as later events. After every application the machine publishes a snapshot
//! for the IPC facade to poll.

use std::path::Path;
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::config::{Mode, MountPointConfig};
use crate::credentials::{Credentials, VolatileFile};
use crate::gadget::GadgetController;
use crate::monitor::{self, DeviceChange};
use crate::nbd::NbdDevice;
use crate::nbdkit;
use crate::process::{Executor, ProcessExit, ProcessHandle};
use crate::redfish::ResourceEvents;
use crate::smb::ShareMounter;

pub const OBJECT_ROOT: &str = "/xyz/openbmc_project/VirtualMedia";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    IoError,
    DeviceOrResourceBusy,
    OperationCanceled,
    OperationNotSupported,
    PermissionDenied,
}

impl ErrorKind {
    pub fn errno(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::IoError => libc::EIO,
            ErrorKind::DeviceOrResourceBusy => libc::EBUSY,
            ErrorKind::OperationCanceled => libc::ECANCELED,
            ErrorKind::OperationNotSupported => libc::EOPNOTSUPP,
            ErrorKind::PermissionDenied => libc::EPERM,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::IoError => "io_error",
            ErrorKind::DeviceOrResourceBusy => "device_or_resource_busy",
            ErrorKind::OperationCanceled => "operation_canceled",
            ErrorKind::OperationNotSupported => "operation_not_supported",
            ErrorKind::PermissionDenied => "permission_denied",
        }
    }
}

/// Error carried by `Ready` after a failed cycle, and surfaced verbatim to
/// the IPC caller that initiated the cycle.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SlotError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SlotError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Mount parameters delivered by the IPC facade.
#[derive(Debug, Default)]
pub struct MountRequest {
    pub image_url: String,
    pub rw: bool,
    pub credentials: Option<Credentials>,
}

/// Target of the in-use lifecycle. Present iff the slot is between
/// `Activating` and the next return to `Ready`.
struct MountTarget {
    image_url: String,
    rw: bool,
    mount_dir: Option<std::path::PathBuf>,
    credentials: Option<Credentials>,
}

pub enum SlotState {
    Initial,
    Ready { error: Option<SlotError> },
    Activating,
    WaitingForGadget { process: Weak<dyn ProcessHandle> },
    Active { process: Weak<dyn ProcessHandle> },
    WaitingForProcessEnd { process: Weak<dyn ProcessHandle> },
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Initial => "Initial",
            SlotState::Ready { .. } => "Ready",
            SlotState::Activating => "Activating",
            SlotState::WaitingForGadget { .. } => "WaitingForGadget",
            SlotState::Active { .. } => "Active",
            SlotState::WaitingForProcessEnd { .. } => "WaitingForProcessEnd",
        }
    }
}

/// Coarse state tag for snapshots and property reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateKind {
    Initial,
    Ready,
    Activating,
    WaitingForGadget,
    Active,
    WaitingForProcessEnd,
}

/// Observable slot state, refreshed on every transition.
#[derive(Clone, Debug)]
pub struct SlotSnapshot {
    pub state: StateKind,
    pub error: Option<SlotError>,
    /// Image URL, populated only while the device is visible to the host.
    pub image_url: String,
    /// Authenticated user, populated only while the device is visible.
    pub user: String,
    pub write_protected: bool,
    pub exit_code: i32,
}

impl SlotSnapshot {
    fn initial() -> Self {
        Self {
            state: StateKind::Initial,
            error: None,
            image_url: String::new(),
            user: String::new(),
            write_protected: true,
            exit_code: -1,
        }
    }
}

pub type Ack = oneshot::Sender<Result<(), SlotError>>;

pub enum SlotEvent {
    Register,
    Mount { request: MountRequest, ack: Ack },
    Unmount { ack: Ack },
    ActivationStarted,
    SubprocessStopped { exit: ProcessExit },
    UdevStateChange { device: NbdDevice, change: DeviceChange },
}

impl SlotEvent {
    fn name(&self) -> &'static str {
        match self {
            SlotEvent::Register => "Register",
            SlotEvent::Mount { .. } => "Mount",
            SlotEvent::Unmount { .. } => "Unmount",
            SlotEvent::ActivationStarted => "ActivationStarted",
            SlotEvent::SubprocessStopped { .. } => "SubprocessStopped",
            SlotEvent::UdevStateChange { .. } => "UdevStateChange",
        }
    }
}

/// Shared actor handles injected into every slot.
#[derive(Clone)]
pub struct SlotActors {
    pub executor: Arc<dyn Executor>,
    pub gadget: Arc<dyn GadgetController>,
    pub shares: Arc<dyn ShareMounter>,
    pub events: Arc<dyn ResourceEvents>,
}

pub struct MountPointController {
    name: String,
    config: MountPointConfig,
    actors: SlotActors,
    state: SlotState,
    target: Option<MountTarget>,
    exit_code: i32,
    self_tx: mpsc::UnboundedSender<SlotEvent>,
    snapshot_tx: watch::Sender<SlotSnapshot>,
}

impl MountPointController {
    pub fn new(
        name: String,
        config: MountPointConfig,
        actors: SlotActors,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<SlotEvent>,
        watch::Receiver<SlotSnapshot>,
    ) {
        let (self_tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SlotSnapshot::initial());
        let controller = Self {
            name,
            config,
            actors,
            state: SlotState::Initial,
            target: None,
            exit_code: -1,
            self_tx,
            snapshot_tx,
        };
        (controller, rx, snapshot_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<SlotEvent> {
        self.self_tx.clone()
    }

    pub fn object_path(&self) -> String {
        object_path(&self.name, self.config.mode)
    }

    /// Apply one event. Never suspends; all I/O started here completes as a
    /// future event on the slot's queue.
    pub fn apply(&mut self, event: SlotEvent) {
        debug!(
            slot = %self.name,
            state = self.state.name(),
            event = event.name(),
            "applying event"
        );
        match event {
            SlotEvent::Register => self.on_register(),
            SlotEvent::Mount { request, ack } => {
                let result = self.on_mount(request);
                let _ = ack.send(result);
            }
            SlotEvent::Unmount { ack } => {
                let result = self.on_unmount();
                let _ = ack.send(result);
            }
            SlotEvent::ActivationStarted => self.on_activation_started(),
            SlotEvent::SubprocessStopped { exit } => self.on_subprocess_stopped(exit),
            SlotEvent::UdevStateChange { device, change } => {
                if device != self.config.nbd_device {
                    debug!(slot = %self.name, device = %device, "ignoring other device");
                } else {
                    self.on_udev_state_change(change);
                }
            }
        }
        self.publish();
    }

    // --- transitions -----------------------------------------------------

    fn transition(&mut self, next: SlotState) {
        debug!(
            slot = %self.name,
            from = self.state.name(),
            to = next.name(),
            "state changed"
        );
        self.state = next;
        self.publish();
        self.on_enter();
    }

    fn on_enter(&mut self) {
        match &self.state {
            SlotState::Ready { .. } => self.cleanup_target(),
            SlotState::Activating => {
                self.exit_code = -1;
                let _ = self.self_tx.send(SlotEvent::ActivationStarted);
            }
            _ => {}
        }
        self.publish();
    }

    fn go_ready(&mut self) {
        self.transition(SlotState::Ready { error: None });
    }

    fn go_ready_with(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let err = SlotError::new(kind, message);
        error!(
            slot = %self.name,
            errno = err.kind.errno(),
            kind = err.kind.as_str(),
            message = %err.message,
            "cycle failed"
        );
        self.transition(SlotState::Ready { error: Some(err) });
    }

    /// Cleanup after a previously mounted device: scratch mount, scratch
    /// dir, target, credentials. Every exit path from the in-use states
    /// funnels through here.
    fn cleanup_target(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };
        if let Some(dir) = &target.mount_dir {
            if let Err(err) = self.actors.shares.unmount(dir) {
                error!(slot = %self.name, dir = %dir.display(), error = %err, "scratch unmount failed");
            }
            self.actors.shares.remove_mount_dir(dir);
        }
        // Credentials zeroize on drop with the target.
    }

    // --- event handlers --------------------------------------------------

    fn on_register(&mut self) {
        if !matches!(self.state, SlotState::Initial) {
            self.protocol_violation("Register");
            // The interfaces stay exported; only the lifecycle resets.
            self.transition(SlotState::Initial);
            return;
        }
        if let Err(err) = monitor::force_udev_change(&self.config.nbd_device) {
            debug!(slot = %self.name, error = %err, "udev re-scan request failed");
        }
        info!(slot = %self.name, device = %self.config.nbd_device, "slot registered");
        self.go_ready();
    }

    fn on_mount(&mut self, request: MountRequest) -> Result<(), SlotError> {
        match self.state {
            SlotState::Ready { .. } => {
                self.target = Some(MountTarget {
                    image_url: request.image_url,
                    rw: request.rw,
                    mount_dir: None,
                    credentials: request.credentials,
                });
                self.transition(SlotState::Activating);
                Ok(())
            }
            _ => Err(SlotError::new(
                ErrorKind::PermissionDenied,
                "Could not mount on not empty slot",
            )),
        }
    }

    fn on_unmount(&mut self) -> Result<(), SlotError> {
        match &self.state {
            SlotState::Activating => {
                // No subprocess yet; straight back to idle.
                self.go_ready();
                Ok(())
            }
            SlotState::WaitingForGadget { process } => {
                let process = process.clone();
                self.stop_process(&process);
                self.transition(SlotState::WaitingForProcessEnd { process });
                Ok(())
            }
            SlotState::Active { process } => {
                let process = process.clone();
                if self
                    .actors
                    .gadget
                    .remove(&self.name, &self.config.nbd_device)
                    .is_err()
                {
                    self.stop_process(&process);
                    self.go_ready_with(
                        ErrorKind::DeviceOrResourceBusy,
                        "Unable to unmount gadget",
                    );
                    return Ok(());
                }
                self.actors.events.resource_deleted(&self.object_path());
                self.stop_process(&process);
                self.transition(SlotState::WaitingForProcessEnd { process });
                Ok(())
            }
            _ => Err(SlotError::new(
                ErrorKind::PermissionDenied,
                "Could not unmount on empty slot",
            )),
        }
    }

    fn on_activation_started(&mut self) {
        if !matches!(self.state, SlotState::Activating) {
            self.protocol_violation("ActivationStarted");
            return;
        }
        match self.config.mode {
            Mode::Proxy => self.activate_proxy(),
            Mode::Legacy => self.activate_legacy(),
        }
    }

    fn on_subprocess_stopped(&mut self, exit: ProcessExit) {
        self.exit_code = exit.code;
        match &self.state {
            // Unreachable by construction (no subprocess exists yet), kept
            // as a safety net.
            SlotState::Activating => self.go_ready(),
            SlotState::WaitingForGadget { process } => {
                let process = process.clone();
                self.stop_process(&process);
                self.go_ready_with(ErrorKind::IoError, "Process ended prematurely");
            }
            SlotState::Active { .. } => {
                if self
                    .actors
                    .gadget
                    .remove(&self.name, &self.config.nbd_device)
                    .is_err()
                {
                    self.go_ready_with(
                        ErrorKind::DeviceOrResourceBusy,
                        "Unable to unmount gadget",
                    );
                } else {
                    self.go_ready();
                }
            }
            SlotState::WaitingForProcessEnd { .. } => self.go_ready(),
            _ => self.protocol_violation("SubprocessStopped"),
        }
    }

    fn on_udev_state_change(&mut self, change: DeviceChange) {
        match (&self.state, change) {
            (SlotState::WaitingForGadget { process }, DeviceChange::Inserted) => {
                let process = process.clone();
                let rw = self.target.as_ref().map(|t| t.rw).unwrap_or(false);
                match self
                    .actors
                    .gadget
                    .configure(&self.name, &self.config.nbd_device, rw)
                {
                    Ok(()) => {
                        self.actors.events.resource_created(&self.object_path());
                        self.transition(SlotState::Active { process });
                    }
                    Err(err) => {
                        error!(slot = %self.name, error = %err, "gadget configuration failed");
                        self.stop_process(&process);
                        self.go_ready_with(
                            ErrorKind::DeviceOrResourceBusy,
                            "Unable to configure gadget",
                        );
                    }
                }
            }
            (SlotState::WaitingForGadget { process }, DeviceChange::Removed) => {
                let process = process.clone();
                self.stop_process(&process);
                self.go_ready_with(
                    ErrorKind::OperationNotSupported,
                    "Unexpected udev event: removed",
                );
            }
            (SlotState::Ready { .. }, DeviceChange::Removed) => {
                // Acceptable: udev often notifies after the server process
                // was already killed.
                debug!(slot = %self.name, "spurious removal after teardown");
            }
            _ => self.protocol_violation("UdevStateChange"),
        }
    }

    // --- activation ------------------------------------------------------

    fn activate_proxy(&mut self) {
        let args = nbdkit::nbd_client_args(&self.config);
        match self.spawn(Path::new(nbdkit::NBD_CLIENT), &args, None) {
            Ok(process) => self.transition(SlotState::WaitingForGadget { process }),
            Err(err) => {
                error!(slot = %self.name, error = %err, "client spawn failed");
                self.go_ready_with(ErrorKind::OperationCanceled, "Failed to spawn process");
            }
        }
    }

    fn activate_legacy(&mut self) {
        let Some(target) = &self.target else {
            self.go_ready_with(ErrorKind::InvalidArgument, "URL not recognized");
            return;
        };
        let url = target.image_url.clone();
        let rw = target.rw;
        debug!(slot = %self.name, url = %url, rw, "mount requested");
        if url.starts_with("smb://") {
            self.mount_cifs_share(&url, rw);
        } else if url.starts_with("https://") {
            self.mount_https_share(&url, rw);
        } else {
            self.go_ready_with(ErrorKind::InvalidArgument, "URL not recognized");
        }
    }

    fn mount_cifs_share(&mut self, url: &str, rw: bool) {
        let Some((remote_parent, file_name)) = split_cifs_url(url) else {
            self.go_ready_with(ErrorKind::InvalidArgument, "URL not recognized");
            return;
        };
        let mount_dir = match self.actors.shares.create_mount_dir(&self.name) {
            Ok(dir) => dir,
            Err(err) => {
                error!(slot = %self.name, error = %err, "scratch dir creation failed");
                self.go_ready_with(ErrorKind::IoError, "Failed to create mount directory");
                return;
            }
        };
        let credentials = self.target.as_ref().and_then(|t| t.credentials.as_ref());
        if let Err(err) = self
            .actors
            .shares
            .mount(&mount_dir, &remote_parent, rw, credentials)
        {
            error!(slot = %self.name, remote = %remote_parent, error = %err, "CIFS mount failed");
            self.actors.shares.remove_mount_dir(&mount_dir);
            self.go_ready_with(ErrorKind::IoError, "Failed to mount CIFS share");
            return;
        }
        let local_file = mount_dir.join(&file_name);
        debug!(
            slot = %self.name,
            remote = %remote_parent,
            local = %local_file.display(),
            "CIFS share mounted"
        );
        match self.spawn_nbd_server(rw, nbdkit::file_backend(&local_file), None) {
            Ok(process) => {
                if let Some(target) = self.target.as_mut() {
                    target.mount_dir = Some(mount_dir);
                }
                self.transition(SlotState::WaitingForGadget { process });
            }
            Err(err) => {
                error!(slot = %self.name, error = %err, "NBD server setup failed");
                if let Err(err) = self.actors.shares.unmount(&mount_dir) {
                    error!(slot = %self.name, error = %err, "scratch unmount failed");
                }
                self.actors.shares.remove_mount_dir(&mount_dir);
                self.go_ready_with(ErrorKind::OperationCanceled, "Unable to setup NBD server");
            }
        }
    }

    fn mount_https_share(&mut self, url: &str, rw: bool) {
        let credentials = self.target.as_ref().and_then(|t| t.credentials.as_ref());
        let secret = match credentials {
            Some(creds) => {
                let packed = creds.pack(|_, secret, buf| buf.extend_from_slice(secret));
                match VolatileFile::new(packed) {
                    Ok(file) => Some(file),
                    Err(err) => {
                        error!(slot = %self.name, error = %err, "secret file setup failed");
                        self.go_ready_with(
                            ErrorKind::OperationCanceled,
                            "Unable to setup NBD server",
                        );
                        return;
                    }
                }
            }
            None => None,
        };
        let params = nbdkit::curl_backend(url, credentials, secret.as_ref().map(|s| s.path()));
        match self.spawn_nbd_server(rw, params, secret) {
            Ok(process) => self.transition(SlotState::WaitingForGadget { process }),
            Err(err) => {
                error!(slot = %self.name, error = %err, "NBD server setup failed");
                self.go_ready_with(ErrorKind::OperationCanceled, "Unable to setup NBD server");
            }
        }
    }

    fn spawn_nbd_server(
        &self,
        rw: bool,
        params: Vec<String>,
        secret: Option<VolatileFile>,
    ) -> anyhow::Result<Weak<dyn ProcessHandle>> {
        nbdkit::remove_stale_socket(&self.config.unix_socket)?;
        let args = nbdkit::nbdkit_args(&self.config, rw, &params);
        self.spawn(Path::new(nbdkit::NBDKIT), &args, secret)
    }

    fn spawn(
        &self,
        binary: &Path,
        args: &[String],
        secret: Option<VolatileFile>,
    ) -> anyhow::Result<Weak<dyn ProcessHandle>> {
        let tx = self.self_tx.clone();
        self.actors.executor.spawn(
            &self.name,
            binary,
            args,
            Box::new(move |exit| {
                // The secret file travels with the child and is unlinked
                // here, once the child can no longer read it.
                drop(secret);
                let _ = tx.send(SlotEvent::SubprocessStopped { exit });
            }),
        )
    }

    // --- helpers ---------------------------------------------------------

    fn stop_process(&self, process: &Weak<dyn ProcessHandle>) {
        match process.upgrade() {
            Some(handle) => handle.stop(),
            None => debug!(slot = %self.name, "no process to stop"),
        }
    }

    fn protocol_violation(&self, event: &str) {
        error!(
            slot = %self.name,
            state = self.state.name(),
            event,
            "unexpected event for current state; review state transitions"
        );
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> SlotSnapshot {
        let state = match self.state {
            SlotState::Initial => StateKind::Initial,
            SlotState::Ready { .. } => StateKind::Ready,
            SlotState::Activating => StateKind::Activating,
            SlotState::WaitingForGadget { .. } => StateKind::WaitingForGadget,
            SlotState::Active { .. } => StateKind::Active,
            SlotState::WaitingForProcessEnd { .. } => StateKind::WaitingForProcessEnd,
        };
        let error = match &self.state {
            SlotState::Ready { error } => error.clone(),
            _ => None,
        };
        let active = matches!(self.state, SlotState::Active { .. });
        let target = self.target.as_ref();
        SlotSnapshot {
            state,
            error,
            image_url: if active {
                target.map(|t| t.image_url.clone()).unwrap_or_default()
            } else {
                String::new()
            },
            user: if active {
                target
                    .and_then(|t| t.credentials.as_ref())
                    .map(|c| c.user().to_string())
                    .unwrap_or_default()
            } else {
                String::new()
            },
            write_protected: !(active && target.map(|t| t.rw).unwrap_or(false)),
            exit_code: self.exit_code,
        }
    }
}

/// Run a slot to completion: apply events in arrival order until every
/// sender is gone.
pub async fn run_slot(
    mut controller: MountPointController,
    mut events: mpsc::UnboundedReceiver<SlotEvent>,
) {
    while let Some(event) = events.recv().await {
        controller.apply(event);
    }
    debug!(slot = %controller.name, "slot event queue closed");
}

pub fn object_path(slot: &str, mode: Mode) -> String {
    let kind = match mode {
        Mode::Proxy => "Proxy",
        Mode::Legacy => "Legacy",
    };
    format!("{OBJECT_ROOT}/{kind}/{slot}")
}

/// Split `smb://host/share/dir/file` into (`//host/share/dir`, `file`).
fn split_cifs_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("smb://")?;
    let (parent, file) = rest.rsplit_once('/')?;
    if parent.is_empty() || file.is_empty() || !parent.contains('/') {
        return None;
    }
    Some((format!("//{parent}"), file.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cifs_url_splits_into_parent_and_file() {
        assert_eq!(
            split_cifs_url("smb://host/share/sub/file.iso"),
            Some(("//host/share/sub".to_string(), "file.iso".to_string()))
        );
        assert_eq!(
            split_cifs_url("smb://host/share/file.iso"),
            Some(("//host/share".to_string(), "file.iso".to_string()))
        );
    }

    #[test]
    fn cifs_url_requires_share_and_file() {
        assert_eq!(split_cifs_url("smb://host/file.iso"), None);
        assert_eq!(split_cifs_url("smb://host/share/"), None);
        assert_eq!(split_cifs_url("https://host/share/file.iso"), None);
        assert_eq!(split_cifs_url("smb://"), None);
    }

    #[test]
    fn object_paths_follow_mode() {
        assert_eq!(
            object_path("Slot_0", Mode::Proxy),
            "/xyz/openbmc_project/VirtualMedia/Proxy/Slot_0"
        );
        assert_eq!(
            object_path("Slot_1", Mode::Legacy),
            "/xyz/openbmc_project/VirtualMedia/Legacy/Slot_1"
        );
    }

    #[test]
    fn error_kinds_map_to_errnos() {
        assert_eq!(ErrorKind::InvalidArgument.errno(), libc::EINVAL);
        assert_eq!(ErrorKind::IoError.errno(), libc::EIO);
        assert_eq!(ErrorKind::DeviceOrResourceBusy.errno(), libc::EBUSY);
        assert_eq!(ErrorKind::PermissionDenied.errno(), libc::EPERM);
    }
}
