use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vmedia_core::{
    run_slot, CifsMounter, ConfigfsGadget, Configuration, DeviceMonitor, HostExecutor, IpcServer,
    MountPointController, RedfishNotifier, SlotActors, SlotEvent, SlotHandle, VirtualMediaService,
};

#[derive(Debug, Parser)]
#[command(name = "vmediad")]
#[command(about = "Expose remote storage images as USB mass-storage gadgets", long_about = None)]
struct Args {
    /// Path to the mount point configuration.
    #[arg(long, value_name = "PATH", default_value = "/etc/virtual-media.json")]
    config: PathBuf,
    /// Unix socket for the management IPC.
    #[arg(
        long,
        value_name = "PATH",
        default_value = "/run/virtual-media/control.sock"
    )]
    control_socket: PathBuf,
    /// Base directory for CIFS scratch mounts.
    #[arg(long, value_name = "PATH", default_value = "/run/virtual-media")]
    scratch_dir: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Configuration::load(&args.config).context("load configuration")?;
    info!(
        config = %args.config.display(),
        slots = config.mount_points.len(),
        "configuration loaded"
    );

    let actors = SlotActors {
        executor: Arc::new(HostExecutor),
        gadget: Arc::new(ConfigfsGadget::new()),
        shares: Arc::new(CifsMounter::new(&args.scratch_dir)),
        events: Arc::new(RedfishNotifier),
    };

    let mut monitor = DeviceMonitor::new().context("subscribe to kernel uevents")?;
    let mut handles = Vec::new();
    let mut slot_txs = Vec::new();
    for (name, mp) in &config.mount_points {
        monitor.add_device(mp.nbd_device);
        let (mut controller, events, snapshot) =
            MountPointController::new(name.clone(), mp.clone(), actors.clone());
        let tx = controller.sender();
        // Export the slot exactly once, before any request can arrive.
        controller.apply(SlotEvent::Register);
        handles.push(SlotHandle::new(name.clone(), mp.clone(), tx.clone(), snapshot));
        slot_txs.push(tx);
        tokio::spawn(run_slot(controller, events));
    }

    let service = Arc::new(VirtualMediaService::new(handles));
    let server = IpcServer::bind(&args.control_socket, service).context("bind control socket")?;

    let monitor_task = tokio::spawn(monitor.run(move |device, change| {
        // Every slot sees every change; slots filter by device identity.
        for tx in &slot_txs {
            let _ = tx.send(SlotEvent::UdevStateChange { device, change });
        }
    }));

    let mut sigterm = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        res = server.serve() => {
            res.context("control socket server failed")?;
        }
        res = monitor_task => {
            match res {
                Ok(inner) => inner.context("device monitor failed")?,
                Err(err) => warn!(error = %err, "device monitor task aborted"),
            }
        }
        _ = signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }

    // Shutdown does not drain the slots: outstanding subprocesses are left
    // to the service manager, gadget state persists until the next start.
    Ok(())
}
