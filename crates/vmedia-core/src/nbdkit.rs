//! Argv construction for the NBD subprocesses.
//!
//! Proxy slots run the kernel-side `nbd-client` against the slot's unix
//! socket; legacy slots run the userspace `nbdkit` server with a backend
//! plugin and let it `--run` the client once the socket is listening.

use std::io;
use std::path::Path;

use tracing::debug;

use crate::config::MountPointConfig;
use crate::credentials::Credentials;

pub const NBD_CLIENT: &str = "/usr/sbin/nbd-client";
pub const NBDKIT: &str = "/usr/sbin/nbdkit";

/// `nbd-client` argv connecting the slot's unix socket to its device node.
pub fn nbd_client_args(config: &MountPointConfig) -> Vec<String> {
    let mut args = vec![
        "-unix".to_string(),
        config.unix_socket.display().to_string(),
        config.nbd_device.path().display().to_string(),
    ];
    if let Some(timeout) = config.timeout {
        args.push("-timeout".to_string());
        args.push(timeout.to_string());
    }
    if let Some(block_size) = config.block_size {
        args.push("-block-size".to_string());
        args.push(block_size.to_string());
    }
    args.push("-nofork".to_string());
    args
}

/// `nbdkit` argv: listen on the slot socket, run the client against it, then
/// hand off to the backend plugin selected by `params`.
pub fn nbdkit_args(config: &MountPointConfig, rw: bool, params: &[String]) -> Vec<String> {
    let client = format!("{} {}", NBD_CLIENT, nbd_client_args(config).join(" "));
    let mut args = vec![
        "--unix".to_string(),
        config.unix_socket.display().to_string(),
        "--run".to_string(),
        client,
    ];
    if config.verbose_nbd_logs {
        args.push("--verbose".to_string());
    }
    if !rw {
        args.push("--readonly".to_string());
    }
    args.extend(params.iter().cloned());
    args
}

/// File backend params for an image reachable on the local filesystem.
pub fn file_backend(path: &Path) -> Vec<String> {
    vec!["file".to_string(), format!("file={}", path.display())]
}

/// Curl backend params for an HTTPS image, optionally authenticated via a
/// secret file (`password=+<path>` makes the plugin read it from disk).
pub fn curl_backend(
    url: &str,
    credentials: Option<&Credentials>,
    secret_path: Option<&Path>,
) -> Vec<String> {
    let mut params = vec![
        "curl".to_string(),
        "sslverify=false".to_string(),
        format!("url={url}"),
    ];
    if let (Some(creds), Some(secret)) = (credentials, secret_path) {
        params.push(format!("user={}", creds.user()));
        params.push(format!("password=+{}", secret.display()));
    }
    params
}

/// Remove a socket file left behind by a previous server instance.
pub fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "removed stale unix socket");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::nbd::NbdDevice;
    use std::path::PathBuf;

    fn config() -> MountPointConfig {
        MountPointConfig {
            mode: Mode::Legacy,
            nbd_device: NbdDevice::new(1),
            unix_socket: PathBuf::from("/run/virtual-media/nbd1.sock"),
            endpoint_id: "/nbd/1".to_string(),
            timeout: Some(30),
            block_size: Some(512),
            verbose_nbd_logs: false,
        }
    }

    #[test]
    fn client_args_carry_tuning_knobs() {
        let args = nbd_client_args(&config());
        assert_eq!(
            args,
            [
                "-unix",
                "/run/virtual-media/nbd1.sock",
                "/dev/nbd1",
                "-timeout",
                "30",
                "-block-size",
                "512",
                "-nofork",
            ]
        );
    }

    #[test]
    fn server_args_wrap_client_and_backend() {
        let params = file_backend(Path::new("/run/virtual-media/scratch/image.iso"));
        let args = nbdkit_args(&config(), false, &params);
        assert_eq!(args[0], "--unix");
        assert_eq!(args[1], "/run/virtual-media/nbd1.sock");
        assert_eq!(args[2], "--run");
        assert!(args[3].starts_with("/usr/sbin/nbd-client -unix"));
        assert!(args.contains(&"--readonly".to_string()));
        assert_eq!(args[args.len() - 2], "file");
        assert_eq!(
            args[args.len() - 1],
            "file=/run/virtual-media/scratch/image.iso"
        );
    }

    #[test]
    fn rw_drops_readonly_and_verbose_is_opt_in() {
        let mut cfg = config();
        cfg.verbose_nbd_logs = true;
        let args = nbdkit_args(&cfg, true, &[]);
        assert!(!args.contains(&"--readonly".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn curl_backend_authenticates_via_secret_file() {
        let creds = Credentials::new("alice".to_string(), b"pw".to_vec());
        let params = curl_backend(
            "https://imgs.example/disk.iso",
            Some(&creds),
            Some(Path::new("/tmp/vm-secret-0")),
        );
        assert_eq!(
            params,
            [
                "curl",
                "sslverify=false",
                "url=https://imgs.example/disk.iso",
                "user=alice",
                "password=+/tmp/vm-secret-0",
            ]
        );
        let anon = curl_backend("https://imgs.example/disk.iso", None, None);
        assert_eq!(anon.len(), 3);
    }

    #[test]
    fn stale_socket_removal_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost.sock");
        remove_stale_socket(&path).unwrap();
        std::fs::write(&path, b"").unwrap();
        remove_stale_socket(&path).unwrap();
        assert!(!path.exists());
    }
}
