//! Credential handling for legacy mounts.
//!
//! Secrets live either in a [`Credentials`] buffer (wiped before its storage
//! is released) or in a [`VolatileFile`] handed to the NBD server subprocess
//! (unlinked as soon as the owning closure is dropped). Neither form is ever
//! placed in a container that may reallocate without zeroizing.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsError {
    /// The extra-data payload did not contain exactly `user\0pass\0`.
    #[error("Malformed extra data")]
    MalformedExtraData,
}

/// Owned user/password pair with guaranteed zeroization.
#[derive(PartialEq, Eq)]
pub struct Credentials {
    user: String,
    secret: Zeroizing<Vec<u8>>,
}

impl Credentials {
    pub fn new(user: String, secret: Vec<u8>) -> Self {
        Self {
            user,
            secret: Zeroizing::new(secret),
        }
    }

    /// Parse a credential payload of the exact form `user\0pass\0`.
    ///
    /// The payload must contain exactly two NUL bytes; any other count is
    /// rejected. The input buffer is wiped before this returns, on success
    /// and on failure alike.
    pub fn from_extra_data(data: Vec<u8>) -> Result<Self, CredentialsError> {
        let data = Zeroizing::new(data);
        let nul_count = data.iter().filter(|b| **b == 0).count();
        if nul_count != 2 {
            return Err(CredentialsError::MalformedExtraData);
        }
        let mut parts = data.split(|b| *b == 0);
        let user = String::from_utf8(parts.next().unwrap_or_default().to_vec())
            .map_err(|_| CredentialsError::MalformedExtraData)?;
        let secret = parts.next().unwrap_or_default().to_vec();
        Ok(Self {
            user,
            secret: Zeroizing::new(secret),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Serialize the pair into a fresh zeroizing buffer.
    ///
    /// The formatter decides the layout; the curl backend only wants the
    /// password bytes, the CIFS option string wants both.
    pub fn pack<F>(&self, f: F) -> Zeroizing<Vec<u8>>
    where
        F: FnOnce(&str, &[u8], &mut Vec<u8>),
    {
        let mut buf = Zeroizing::new(Vec::new());
        f(&self.user, &self.secret, &mut buf);
        buf
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.user.zeroize();
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A secret written to a short-lived 0600 file, unlinked on drop.
///
/// Ownership travels with the subprocess exit closure, so the file lives
/// exactly as long as the child that reads it.
pub struct VolatileFile {
    path: PathBuf,
}

impl VolatileFile {
    pub fn new(content: Zeroizing<Vec<u8>>) -> Result<Self> {
        Self::new_in(&std::env::temp_dir(), content)
    }

    pub fn new_in(dir: &Path, content: Zeroizing<Vec<u8>>) -> Result<Self> {
        let path = dir.join(format!("vm-secret-{:016x}", OsRng.next_u64()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("create secret file {}", path.display()))?;
        file.write_all(&content)
            .with_context(|| format!("write secret file {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for VolatileFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to unlink secret file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_nul_payload() {
        let creds = Credentials::from_extra_data(b"alice\0s3cret\0".to_vec()).unwrap();
        assert_eq!(creds.user(), "alice");
        assert_eq!(creds.secret(), b"s3cret");
    }

    #[test]
    fn rejects_wrong_nul_counts() {
        assert_eq!(
            Credentials::from_extra_data(b"alice\0".to_vec()),
            Err(CredentialsError::MalformedExtraData)
        );
        assert_eq!(
            Credentials::from_extra_data(b"a\0b\0c\0".to_vec()),
            Err(CredentialsError::MalformedExtraData)
        );
        assert_eq!(
            Credentials::from_extra_data(b"no delimiters".to_vec()),
            Err(CredentialsError::MalformedExtraData)
        );
    }

    #[test]
    fn empty_password_is_accepted() {
        let creds = Credentials::from_extra_data(b"bob\0\0".to_vec()).unwrap();
        assert_eq!(creds.user(), "bob");
        assert!(creds.secret().is_empty());
    }

    #[test]
    fn pack_collects_into_zeroizing_buffer() {
        let creds = Credentials::new("carol".into(), b"pw".to_vec());
        let packed = creds.pack(|_, secret, buf| buf.extend_from_slice(secret));
        assert_eq!(&packed[..], b"pw");
    }

    #[test]
    fn volatile_file_unlinked_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let secret = Zeroizing::new(b"hunter2".to_vec());
        let file = VolatileFile::new_in(dir.path(), secret).unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"hunter2");
        drop(file);
        assert!(!path.exists());
    }
}
