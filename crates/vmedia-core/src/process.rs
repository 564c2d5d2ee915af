//! Async subprocess handles.
//!
//! The strong reference to a running child lives inside its driver task and
//! is released only once the OS reports termination; the state machine holds
//! a weak handle good for nothing but requesting a stop. Stop is
//! best-effort; the definitive signal is the exit notification.

use std::path::Path;
use std::sync::Arc;
use std::sync::Weak;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Grace between SIGTERM and the SIGKILL escalation.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// A child that outlives this window is considered to have started up.
const STARTUP_WINDOW: Duration = Duration::from_millis(250);

/// Termination report delivered exactly once per spawned child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: i32,
    pub ready_after_startup: bool,
}

pub type ExitHandler = Box<dyn FnOnce(ProcessExit) + Send + 'static>;

pub trait ProcessHandle: Send + Sync {
    /// Request termination. Asynchronous; completion arrives via the exit
    /// handler passed at spawn time.
    fn stop(&self);
}

pub trait Executor: Send + Sync {
    /// Spawn `binary` with `args`; `on_exit` fires once when the child is
    /// reaped. The returned weak handle can only request a stop.
    fn spawn(
        &self,
        slot: &str,
        binary: &Path,
        args: &[String],
        on_exit: ExitHandler,
    ) -> Result<Weak<dyn ProcessHandle>>;
}

struct HostProcess {
    slot: String,
    pid: Pid,
}

impl ProcessHandle for HostProcess {
    fn stop(&self) {
        info!(slot = %self.slot, pid = %self.pid, "stopping process");
        if let Err(err) = kill(self.pid, Signal::SIGTERM) {
            debug!(slot = %self.slot, pid = %self.pid, error = %err, "SIGTERM failed");
            return;
        }
        let pid = self.pid;
        let slot = self.slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_GRACE).await;
            // ESRCH here just means the child already went away.
            if kill(pid, Signal::SIGKILL).is_ok() {
                warn!(slot = %slot, pid = %pid, "process ignored SIGTERM, sent SIGKILL");
            }
        });
    }
}

/// Executor running real children on the host.
pub struct HostExecutor;

impl Executor for HostExecutor {
    fn spawn(
        &self,
        slot: &str,
        binary: &Path,
        args: &[String],
        on_exit: ExitHandler,
    ) -> Result<Weak<dyn ProcessHandle>> {
        debug!(slot, binary = %binary.display(), ?args, "spawning process");
        let mut child = Command::new(binary)
            .args(args)
            .stdin(std::process::Stdio::null())
            .spawn()
            .with_context(|| format!("spawn {}", binary.display()))?;
        let pid = child
            .id()
            .context("child exited before its pid was recorded")?;

        let handle: Arc<dyn ProcessHandle> = Arc::new(HostProcess {
            slot: slot.to_string(),
            pid: Pid::from_raw(pid as libc::pid_t),
        });
        let weak = Arc::downgrade(&handle);
        let slot = slot.to_string();
        tokio::spawn(async move {
            let started = Instant::now();
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(err) => {
                    warn!(slot = %slot, error = %err, "wait for child failed");
                    -1
                }
            };
            info!(slot = %slot, code, "process ended");
            // The strong reference dies with this task, after the child.
            drop(handle);
            on_exit(ProcessExit {
                code,
                ready_after_startup: started.elapsed() >= STARTUP_WINDOW,
            });
        });
        Ok(weak)
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}
