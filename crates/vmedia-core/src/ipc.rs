//! Management IPC for the virtual media slots.
//!
//! Typed request/reply methods and property reads per slot, served as
//! line-delimited JSON over a unix domain socket. `Mount` and `Unmount` are
//! blocking calls: they emit the slot event, then poll the slot state until
//! a terminal condition or timeout. Success is only reported once the
//! device is actually visible to the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{Mode, MountPointConfig};
use crate::credentials::Credentials;
use crate::machine::{
    object_path, ErrorKind, MountRequest, SlotEvent, SlotSnapshot, StateKind,
};

pub const SERVICE_NAME: &str = "xyz.openbmc_project.VirtualMedia";

/// Completion polling: 120 polls of 100 ms, 12 s overall.
const COMPLETION_POLL: Duration = Duration::from_millis(100);
const COMPLETION_POLL_COUNT: u32 = 120;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum IpcRequest {
    Mount {
        slot: String,
        #[serde(default)]
        image_url: Option<String>,
        #[serde(default)]
        rw: Option<bool>,
        /// Credential payload, exactly `user\0pass\0`.
        #[serde(default)]
        extra_data: Option<Vec<u8>>,
    },
    Unmount {
        slot: String,
    },
    MountPoint {
        slot: String,
    },
    Process {
        slot: String,
    },
    SetCdInstance {
        slot: String,
        value: i32,
    },
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Result {
        value: bool,
    },
    MountPoint {
        path: String,
        device: String,
        endpoint_id: String,
        socket: PathBuf,
        image_url: String,
        user: String,
        write_protected: bool,
    },
    Process {
        active: bool,
        exit_code: i32,
        cd_instance: i32,
    },
    Error {
        code: i32,
        kind: String,
        message: String,
    },
}

impl IpcResponse {
    fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            code: kind.errno(),
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }
}

/// Per-slot handle held by the facade: event sender, live snapshot, and the
/// settable CDInstance hint (no side effects).
pub struct SlotHandle {
    pub name: String,
    pub config: MountPointConfig,
    pub events: mpsc::UnboundedSender<SlotEvent>,
    pub snapshot: watch::Receiver<SlotSnapshot>,
    cd_instance: AtomicI32,
}

impl SlotHandle {
    pub fn new(
        name: String,
        config: MountPointConfig,
        events: mpsc::UnboundedSender<SlotEvent>,
        snapshot: watch::Receiver<SlotSnapshot>,
    ) -> Self {
        Self {
            name,
            config,
            events,
            snapshot,
            cd_instance: AtomicI32::new(2),
        }
    }

    fn snapshot(&self) -> SlotSnapshot {
        self.snapshot.borrow().clone()
    }
}

pub struct VirtualMediaService {
    slots: HashMap<String, SlotHandle>,
}

impl VirtualMediaService {
    pub fn new(slots: impl IntoIterator<Item = SlotHandle>) -> Self {
        Self {
            slots: slots
                .into_iter()
                .map(|handle| (handle.name.clone(), handle))
                .collect(),
        }
    }

    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Mount {
                slot,
                image_url,
                rw,
                extra_data,
            } => self.mount(&slot, image_url, rw, extra_data).await,
            IpcRequest::Unmount { slot } => self.unmount(&slot).await,
            IpcRequest::MountPoint { slot } => self.mount_point(&slot),
            IpcRequest::Process { slot } => self.process(&slot),
            IpcRequest::SetCdInstance { slot, value } => self.set_cd_instance(&slot, value),
        }
    }

    fn slot(&self, name: &str) -> Result<&SlotHandle, IpcResponse> {
        self.slots.get(name).ok_or_else(|| {
            IpcResponse::error(ErrorKind::InvalidArgument, format!("unknown slot {name}"))
        })
    }

    async fn mount(
        &self,
        slot: &str,
        image_url: Option<String>,
        rw: Option<bool>,
        extra_data: Option<Vec<u8>>,
    ) -> IpcResponse {
        let handle = match self.slot(slot) {
            Ok(handle) => handle,
            Err(resp) => return resp,
        };
        info!(slot, path = %object_path(slot, handle.config.mode), "Mount called");

        let request = match handle.config.mode {
            Mode::Proxy => {
                if image_url.is_some() || rw.is_some() || extra_data.is_some() {
                    return IpcResponse::error(
                        ErrorKind::InvalidArgument,
                        "proxy mount takes no arguments",
                    );
                }
                MountRequest::default()
            }
            Mode::Legacy => {
                let Some(image_url) = image_url else {
                    return IpcResponse::error(ErrorKind::InvalidArgument, "image URL required");
                };
                let credentials = match extra_data {
                    Some(payload) => {
                        debug!(slot, "credential payload present");
                        match Credentials::from_extra_data(payload) {
                            Ok(creds) => Some(creds),
                            Err(err) => {
                                return IpcResponse::error(
                                    ErrorKind::InvalidArgument,
                                    err.to_string(),
                                );
                            }
                        }
                    }
                    None => None,
                };
                MountRequest {
                    image_url,
                    rw: rw.unwrap_or(false),
                    credentials,
                }
            }
        };

        let (ack, ack_rx) = oneshot::channel();
        if handle
            .events
            .send(SlotEvent::Mount { request, ack })
            .is_err()
        {
            return IpcResponse::error(ErrorKind::OperationCanceled, "slot is gone");
        }
        match ack_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return IpcResponse::error(ErrorKind::PermissionDenied, err.message),
            Err(_) => return IpcResponse::error(ErrorKind::OperationCanceled, "slot is gone"),
        }

        for _ in 0..COMPLETION_POLL_COUNT {
            let snapshot = handle.snapshot();
            match snapshot.state {
                StateKind::Active => return IpcResponse::Result { value: true },
                StateKind::Ready => {
                    return match snapshot.error {
                        Some(err) => IpcResponse::error(err.kind, err.message),
                        None => IpcResponse::Result { value: false },
                    };
                }
                _ => {}
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
        // The activation keeps going; the caller just stops waiting.
        IpcResponse::Result { value: false }
    }

    async fn unmount(&self, slot: &str) -> IpcResponse {
        let handle = match self.slot(slot) {
            Ok(handle) => handle,
            Err(resp) => return resp,
        };
        info!(slot, path = %object_path(slot, handle.config.mode), "Unmount called");

        let (ack, ack_rx) = oneshot::channel();
        if handle.events.send(SlotEvent::Unmount { ack }).is_err() {
            return IpcResponse::error(ErrorKind::OperationCanceled, "slot is gone");
        }
        match ack_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return IpcResponse::error(ErrorKind::PermissionDenied, err.message),
            Err(_) => return IpcResponse::error(ErrorKind::OperationCanceled, "slot is gone"),
        }

        for _ in 0..COMPLETION_POLL_COUNT {
            if handle.snapshot().state == StateKind::Ready {
                return IpcResponse::Result { value: true };
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
        // Teardown may still be in flight; report success regardless.
        IpcResponse::Result { value: true }
    }

    fn mount_point(&self, slot: &str) -> IpcResponse {
        let handle = match self.slot(slot) {
            Ok(handle) => handle,
            Err(resp) => return resp,
        };
        let snapshot = handle.snapshot();
        IpcResponse::MountPoint {
            path: object_path(slot, handle.config.mode),
            device: handle.config.nbd_device.to_string(),
            endpoint_id: handle.config.endpoint_id.clone(),
            socket: handle.config.unix_socket.clone(),
            image_url: snapshot.image_url,
            user: snapshot.user,
            write_protected: snapshot.write_protected,
        }
    }

    fn process(&self, slot: &str) -> IpcResponse {
        let handle = match self.slot(slot) {
            Ok(handle) => handle,
            Err(resp) => return resp,
        };
        let snapshot = handle.snapshot();
        IpcResponse::Process {
            active: snapshot.state == StateKind::Active,
            exit_code: snapshot.exit_code,
            cd_instance: handle.cd_instance.load(Ordering::Relaxed),
        }
    }

    fn set_cd_instance(&self, slot: &str, value: i32) -> IpcResponse {
        let handle = match self.slot(slot) {
            Ok(handle) => handle,
            Err(resp) => return resp,
        };
        handle.cd_instance.store(value, Ordering::Relaxed);
        IpcResponse::Result { value: true }
    }
}

/// Unix-socket server fronting the service. The socket file is removed on
/// drop so restarts do not trip over a stale node.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    service: Arc<VirtualMediaService>,
}

impl IpcServer {
    pub fn bind(path: &Path, service: Arc<VirtualMediaService>) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(socket = %path.display(), "removed stale control socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove stale {}", path.display()))
            }
        }
        let listener =
            UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))?;
        info!(service = SERVICE_NAME, socket = %path.display(), "control socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            service,
        })
    }

    pub async fn serve(&self) -> Result<()> {
        loop {
            let (stream, _addr) = self.listener.accept().await.context("accept connection")?;
            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, service).await {
                    debug!(error = %err, "connection closed with error");
                }
            });
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    stream: tokio::net::UnixStream,
    service: Arc<VirtualMediaService>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await.context("read request line")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => service.handle(request).await,
            Err(err) => {
                warn!(error = %err, "invalid request");
                IpcResponse::error(ErrorKind::InvalidArgument, format!("invalid request: {err}"))
            }
        };
        let mut payload = serde_json::to_string(&response).context("encode response")?;
        payload.push('\n');
        writer
            .write_all(payload.as_bytes())
            .await
            .context("write response")?;
    }
    Ok(())
}
