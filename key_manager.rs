//! Key material supplied by the caller.
//!
//! This module provides [`KeyMaterial`], the raw bytes a stream key is
//! derived from: either a password or the entire contents of a key file.
//!
//! ## Security Features
//!
//! - Bytes live in `Zeroizing` buffers and are wiped on drop
//! - `Debug` output never shows the bytes
//! - Key files readable by group/other produce a warning on Unix

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{CryptError, CryptResult};

pub struct KeyMaterial {
    bytes: Zeroizing<Vec<u8>>,
}

impl KeyMaterial {
    pub fn from_password(password: impl Into<String>) -> CryptResult<Self> {
        let password = Zeroizing::new(password.into());
        if password.is_empty() {
            return Err(CryptError::key("password cannot be empty"));
        }
        Ok(Self {
            bytes: Zeroizing::new(password.as_bytes().to_vec()),
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> CryptResult<Self> {
        let bytes = Zeroizing::new(bytes);
        if bytes.is_empty() {
            return Err(CryptError::key("key material cannot be empty"));
        }
        Ok(Self { bytes })
    }

    /// Uses the whole file as key material.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading key file");

        let data = Zeroizing::new(
            fs::read(path)
                .await
                .with_context(|| format!("reading key from {}", path.display()))?,
        );
        if data.is_empty() {
            warn!(path = %path.display(), "key file is empty");
            bail!("key file {} is empty", path.display());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path)
                .await
                .with_context(|| format!("reading metadata of {}", path.display()))?
                .permissions()
                .mode();
            if mode & 0o077 != 0 {
                warn!(
                    path = %path.display(),
                    mode = %format!("{:o}", mode & 0o777),
                    "key file is accessible by other users"
                );
            }
        }

        Ok(Self {
            bytes: Zeroizing::new(data.to_vec()),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}
