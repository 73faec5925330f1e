//! Accepted API keys.
//!
//! Loaded from an optional JSON array of strings, e.g. `["k1", "k2"]`.
//!
//! # Post-conditions
//! - An `ApiKeys` set is immutable once loaded.
//!
//! # Invariants
//! - Every accepted key is non-empty.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Error returned when the API key file is invalid.
#[derive(Debug)]
pub enum ApiKeysError {
    /// The file exists but could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not a JSON array of strings.
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// A configured key is empty.
    EmptyKey,
}

impl std::fmt::Display for ApiKeysError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read {}: {source}", path.display()),
            Self::Malformed { path, source } => {
                write!(f, "malformed API key list {}: {source}", path.display())
            }
            Self::EmptyKey => write!(f, "API keys must not be empty"),
        }
    }
}

impl std::error::Error for ApiKeysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Malformed { source, .. } => Some(source),
            Self::EmptyKey => None,
        }
    }
}

/// The set of API keys accepted by endpoints declaring `needsApiKey`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeys {
    keys: HashSet<String>,
}

impl ApiKeys {
    /// Build a key set.
    ///
    /// # Errors
    /// Returns `ApiKeysError::EmptyKey` if any key is empty.
    pub fn new<I, S>(keys: I) -> Result<Self, ApiKeysError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: HashSet<String> = keys.into_iter().map(Into::into).collect();
        if keys.iter().any(String::is_empty) {
            return Err(ApiKeysError::EmptyKey);
        }
        Ok(Self { keys })
    }

    /// Load the key set from `path`. A missing file yields an empty set.
    pub fn load_optional(path: &Path) -> Result<Self, ApiKeysError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ApiKeysError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let keys: Vec<String> =
            serde_json::from_str(&text).map_err(|source| ApiKeysError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(keys)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
