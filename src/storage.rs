//! Persistent blob storage
//!
//! The stack needs a handful of small persistent blobs: the service identity
//! keys, the published hostname, the RSA link-auth material and the guard
//! set. The [`BlobStore`] trait is the whole contract; writes are atomic
//! from the caller's perspective.

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Well-known blob keys.
pub const KEY_HOSTNAME: &str = "hostname";
pub const KEY_ED25519_PRIVATE: &str = "private_key_ed25519";
pub const KEY_ED25519_PUBLIC: &str = "public_key_ed25519";
pub const KEY_RSA_IDENTITY: &str = "identity_rsa_key";
pub const KEY_RSA_IDENTITY_DER: &str = "identity_rsa_key_der";
pub const KEY_RSA_IDENTITY_CERT_DER: &str = "identity_rsa_cert_der";
pub const KEY_USED_GUARDS: &str = "used_guards";

/// Whole-blob key/value storage.
pub trait BlobStore: Send {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Filesystem-backed store: one file per key under a directory.
///
/// Writes go through a temp file and rename so a torn write never leaves a
/// half-written key behind.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| TorError::Storage(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TorError::Storage(e.to_string())),
        }
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", key));
        std::fs::write(&tmp, value).map_err(|e| TorError::Storage(e.to_string()))?;
        std::fs::rename(&tmp, self.path_for(key)).map_err(|e| TorError::Storage(e.to_string()))
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TorError::Storage(e.to_string())),
        }
    }
}

/// In-memory store for tests and diskless deployments.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.blobs.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

/// Persisted guard set, stored as JSON under [`KEY_USED_GUARDS`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardState {
    /// Hex-encoded RSA identity fingerprints of guards we have used.
    pub guards: Vec<String>,
}

impl GuardState {
    pub fn load(store: &dyn BlobStore) -> Result<Self> {
        match store.get(KEY_USED_GUARDS)? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| TorError::Storage(format!("guard state corrupt: {}", e))),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, store: &mut dyn BlobStore) -> Result<()> {
        let raw = serde_json::to_vec(self).map_err(|e| TorError::Storage(e.to_string()))?;
        store.put(KEY_USED_GUARDS, &raw)
    }

    pub fn contains(&self, identity: &[u8; 20]) -> bool {
        let needle = hex::encode(identity);
        self.guards.iter().any(|g| *g == needle)
    }

    pub fn add(&mut self, identity: &[u8; 20]) {
        let id = hex::encode(identity);
        if !self.guards.contains(&id) {
            self.guards.push(id);
        }
    }
}
