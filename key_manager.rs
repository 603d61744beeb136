//! Page-encryption key generation and secure storage.
//!
//! [`KeyManager`] loads or creates the 256-bit key that seals every page of
//! every encrypted file in a store.
//!
//! ## Security Features
//!
//! - Keys are zeroized on drop (via `Zeroize` trait)
//! - Unix file permissions set to 0600 (owner read/write only)
//! - Cryptographically secure random generation via `OsRng`

use anyhow::{bail, Context, Result};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use rand_core::OsRng;
use rand_core::RngCore;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;

/// Handles key generation and persistence.
pub struct KeyManager {
    key_bytes: [u8; KEY_LEN],
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl KeyManager {
    /// Load the key at `cfg.key_path`, generating it on first use.
    pub async fn new(cfg: &crate::config::Config) -> Result<Self> {
        let path = Path::new(&cfg.key_path);
        let exists = fs::try_exists(path)
            .await
            .with_context(|| format!("checking existence of {}", path.display()))?;

        let key_bytes = if exists {
            info!(path = %path.display(), "loading existing page key");
            load_key(path).await?
        } else {
            info!(path = %path.display(), "generating new page key");
            let mut key = [0u8; KEY_LEN];
            OsRng.fill_bytes(&mut key);
            if let Err(e) = store_key(path, key).await {
                key.zeroize();
                return Err(e);
            }
            key
        };

        Ok(Self { key_bytes })
    }

    /// Build a manager around key material that is already in memory.
    pub fn from_bytes(mut key: [u8; KEY_LEN]) -> Self {
        let km = Self { key_bytes: key };
        key.zeroize();
        km
    }

    /// A fresh cipher instance for the page codec.
    pub fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.key_bytes).into())
    }
}

async fn load_key(path: &Path) -> Result<[u8; KEY_LEN]> {
    let mut data = fs::read(path)
        .await
        .with_context(|| format!("reading key from {}", path.display()))?;
    let found = data.len();
    let key = <[u8; KEY_LEN]>::try_from(data.as_slice()).ok();
    data.zeroize();

    match key {
        Some(key) => Ok(key),
        None => {
            warn!(path = %path.display(), found_bytes = found, "invalid key size");
            bail!(
                "expected {}-byte key at {} but found {} bytes",
                KEY_LEN,
                path.display(),
                found
            )
        }
    }
}

/// Write a new key; refuses to replace an existing file.
#[cfg(unix)]
async fn store_key(path: &Path, key: [u8; KEY_LEN]) -> Result<()> {
    let path_buf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::fs::OpenOptions;
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut key = key;
        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path_buf)
            .and_then(|mut f| f.write_all(&key));
        key.zeroize();
        result
    })
    .await?
    .with_context(|| format!("writing key to {}", path.display()))
}

#[cfg(not(unix))]
async fn store_key(path: &Path, mut key: [u8; KEY_LEN]) -> Result<()> {
    let result = fs::write(path, &key)
        .await
        .with_context(|| format!("writing key to {}", path.display()));
    key.zeroize();
    result
}
