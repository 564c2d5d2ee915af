//! CIFS scratch mounts for legacy image sources.
//!
//! The daemon only ever mounts into scratch directories it created itself;
//! the state machine owns removal of the directory on every exit path.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::credentials::Credentials;

pub trait ShareMounter: Send + Sync {
    /// Create a unique scratch directory for `slot` and return its path.
    fn create_mount_dir(&self, slot: &str) -> Result<PathBuf>;
    /// Mount `remote_parent` (e.g. `//host/share/dir`) onto `dir`.
    fn mount(
        &self,
        dir: &Path,
        remote_parent: &str,
        rw: bool,
        credentials: Option<&Credentials>,
    ) -> Result<()>;
    /// Unmount a previously mounted scratch directory.
    fn unmount(&self, dir: &Path) -> Result<()>;
    /// Best-effort removal of the scratch directory itself.
    fn remove_mount_dir(&self, dir: &Path);
}

/// `mount(2)`-based CIFS mounter.
pub struct CifsMounter {
    base: PathBuf,
}

impl CifsMounter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl ShareMounter for CifsMounter {
    fn create_mount_dir(&self, slot: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.base)
            .with_context(|| format!("create {}", self.base.display()))?;
        let dir = self
            .base
            .join(format!("{slot}-{:08x}", OsRng.next_u32()));
        std::fs::create_dir(&dir)
            .with_context(|| format!("create scratch dir {}", dir.display()))?;
        Ok(dir)
    }

    fn mount(
        &self,
        dir: &Path,
        remote_parent: &str,
        rw: bool,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let src = CString::new(remote_parent).context("remote share path contains NUL")?;
        let target = CString::new(dir.as_os_str().as_bytes()).context("mount dir contains NUL")?;
        let fstype = CString::new("cifs").context("filesystem type")?;

        // The option string embeds the password; keep it in a wiped buffer
        // and NUL-terminate it by hand instead of copying through CString.
        let mut options = Zeroizing::new(Vec::with_capacity(128));
        options.extend_from_slice(b"vers=3.0,seal,nosetuids");
        match credentials {
            Some(creds) => {
                options.extend_from_slice(b",username=");
                options.extend_from_slice(creds.user().as_bytes());
                options.extend_from_slice(b",password=");
                options.extend_from_slice(creds.secret());
            }
            None => options.extend_from_slice(b",guest"),
        }
        options.push(0);
        if options[..options.len() - 1].contains(&0) {
            return Err(anyhow!("mount options contain NUL"));
        }

        let mut flags = (libc::MS_NOSUID | libc::MS_NODEV) as libc::c_ulong;
        if !rw {
            flags |= libc::MS_RDONLY as libc::c_ulong;
        }

        debug!(
            remote = remote_parent,
            dir = %dir.display(),
            rw,
            "mounting CIFS share"
        );
        let rc = unsafe {
            libc::mount(
                src.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                flags,
                options.as_ptr() as *const libc::c_void,
            )
        };
        if rc != 0 {
            return Err(anyhow!(
                "mount(2) failed for {}: {}",
                remote_parent,
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    fn unmount(&self, dir: &Path) -> Result<()> {
        let target = CString::new(dir.as_os_str().as_bytes()).context("mount dir contains NUL")?;
        let rc = unsafe { libc::umount2(target.as_ptr(), 0) };
        if rc != 0 {
            return Err(anyhow!(
                "umount2 failed for {}: {}",
                dir.display(),
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    fn remove_mount_dir(&self, dir: &Path) {
        if let Err(err) = std::fs::remove_dir_all(dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %err, "failed to remove scratch dir");
            }
        }
    }
}
