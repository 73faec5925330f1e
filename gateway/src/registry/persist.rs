//! On-disk persistence of registry configuration files.
//!
//! Admin operations rewrite a registry JSON file with read-modify-write. Two
//! concurrent admin calls against the same file would lose one update, so
//! every file gets its own async mutex held across the whole cycle.
//!
//! # Invariants
//! - At most one read-modify-write per file is in flight at a time.
//! - Files are replaced atomically (write to a sibling, then rename).
//! - Raw descriptors are written as given; placeholders are preserved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::RegistryError;

/// Serializes writes to registry configuration files.
#[derive(Default)]
pub struct RegistryFiles {
    /// One mutex per file path, created on first use.
    locks: RwLock<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RegistryFiles {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `endpoint` to `raw_descriptor` in the file at `path`, creating the
    /// file if needed.
    pub async fn insert(
        &self,
        path: &Path,
        endpoint: &str,
        raw_descriptor: &str,
    ) -> Result<(), RegistryError> {
        self.modify(path, |entries| {
            entries.insert(
                endpoint.to_string(),
                Value::String(raw_descriptor.to_string()),
            );
            true
        })
        .await
        .map(|_| ())
    }

    /// Remove `endpoint` from the file at `path`.
    ///
    /// Returns `false` (and leaves the file untouched) if the endpoint was not
    /// present or the file does not exist.
    pub async fn remove(&self, path: &Path, endpoint: &str) -> Result<bool, RegistryError> {
        self.modify(path, |entries| entries.shift_remove(endpoint).is_some())
            .await
    }

    async fn modify<F>(&self, path: &Path, f: F) -> Result<bool, RegistryError>
    where
        F: FnOnce(&mut Map<String, Value>) -> bool,
    {
        let lock = self.lock_for(path)?;
        let _guard = lock.lock().await;

        let mut entries = read_entries(path).await?;
        if !f(&mut entries) {
            return Ok(false);
        }

        let mut text = serde_json::to_string_pretty(&Value::Object(entries)).map_err(|source| {
            RegistryError::MalformedJson {
                path: path.to_path_buf(),
                source,
            }
        })?;
        text.push('\n');

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| RegistryError::io(parent, source))?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, text)
            .await
            .map_err(|source| RegistryError::io(&staging, source))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|source| RegistryError::io(path, source))?;

        tracing::debug!(path = %path.display(), "persisted registry file");
        Ok(true)
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    fn lock_for(&self, path: &Path) -> Result<Arc<Mutex<()>>, RegistryError> {
        // Fast path: the lock already exists (read lock only)
        {
            let locks = self.locks.read().map_err(|_| RegistryError::LockPoisoned)?;
            if let Some(lock) = locks.get(path) {
                return Ok(Arc::clone(lock));
            }
        }

        let mut locks = self.locks.write().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(Arc::clone(
            locks.entry(path.to_path_buf()).or_default(),
        ))
    }
}

/// Read a registry file as a raw JSON object. A missing file reads as empty.
async fn read_entries(path: &Path) -> Result<Map<String, Value>, RegistryError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(source) => return Err(RegistryError::io(path, source)),
    };
    match serde_json::from_str(&text) {
        Ok(Value::Object(entries)) => Ok(entries),
        Ok(_) => Err(RegistryError::InvalidConfig {
            path: path.to_path_buf(),
            reason: "registry file must be a JSON object".to_string(),
        }),
        Err(source) => Err(RegistryError::MalformedJson {
            path: path.to_path_buf(),
            source,
        }),
    }
}
