//! Shared cluster store.
//!
//! The registry table and the live-token table are held in a store that every
//! worker observes consistently. The gateway only needs `get`, `set` and an
//! atomic compare-and-swap; `update` layers a retrying read-modify-write on
//! top of the swap so that concurrent mutations never lose each other.
//!
//! # Invariants
//! - `compare_and_swap` is atomic with respect to every other store call.
//! - `update` never commits a value computed from a stale read.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

/// Store key holding the API registry table.
pub const API_REGISTRY_KEY: &str = "gateway.apiregistry";

/// Store key holding the live-token table.
pub const TOKEN_TABLE_KEY: &str = "gateway.tokens";

/// Errors returned by a shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A lock guarding the store was poisoned by a panicking writer.
    LockPoisoned,
    /// The backing store is unreachable or rejected the operation.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockPoisoned => write!(f, "shared store lock poisoned"),
            Self::Unavailable(reason) => write!(f, "shared store unavailable: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A process-wide key/value store, consistent across workers.
pub trait SharedStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Unconditionally overwrite the value stored under `key`.
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Replace the value under `key` with `new` only if the current value
    /// equals `expected` (`None` meaning "absent").
    ///
    /// Returns `Ok(true)` if the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> Result<bool, StoreError>;
}

/// Serialized read-modify-write of a single key.
///
/// `f` receives the current value and returns the replacement. If another
/// writer changed the key in between, `f` is re-run against the fresh value.
/// Returns the value that was committed.
pub fn update<F>(store: &dyn SharedStore, key: &str, mut f: F) -> Result<Value, StoreError>
where
    F: FnMut(Option<&Value>) -> Value,
{
    loop {
        let current = store.get(key)?;
        let next = f(current.as_ref());
        if store.compare_and_swap(key, current.as_ref(), next.clone())? {
            return Ok(next);
        }
        tracing::trace!(key, "store update raced with another writer, retrying");
    }
}

/// In-process implementation of [`SharedStore`].
///
/// Suitable for single-process deployments and tests. Every worker thread of
/// the process shares the same instance through an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        if entries.get(key) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), new);
        Ok(true)
    }
}
