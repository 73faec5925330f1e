//! Token manager configuration.
//!
//! Read from an optional JSON file:
//!
//! ```json
//! { "expiryInterval": 600000, "tokenGCInterval": 1800000, "signingSecret": "…" }
//! ```
//!
//! Every field is optional. A missing file yields the defaults.
//!
//! # Invariants
//! - Both intervals are non-zero.
//! - A configured signing secret is non-empty.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::token::SigningKey;

/// Error returned when the token configuration is invalid.
#[derive(Debug)]
pub enum TokenConfigError {
    /// The file exists but could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid JSON of the expected shape.
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// An interval is zero.
    ZeroInterval(&'static str),
    /// The signing secret is empty.
    EmptySecret,
}

impl std::fmt::Display for TokenConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read {}: {source}", path.display()),
            Self::Malformed { path, source } => {
                write!(f, "malformed token configuration {}: {source}", path.display())
            }
            Self::ZeroInterval(name) => write!(f, "{name} must be greater than zero"),
            Self::EmptySecret => write!(f, "signingSecret must not be empty"),
        }
    }
}

impl std::error::Error for TokenConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Malformed { source, .. } => Some(source),
            Self::ZeroInterval(_) | Self::EmptySecret => None,
        }
    }
}

/// Token lifetime and sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Sliding expiry window in milliseconds.
    #[serde(rename = "expiryInterval")]
    pub expiry_interval: u64,
    /// Period of the background sweep in milliseconds.
    #[serde(rename = "tokenGCInterval")]
    pub token_gc_interval: u64,
    /// Persistent HMAC secret. When absent every token gets a random key.
    #[serde(rename = "signingSecret")]
    pub signing_secret: Option<String>,
}

impl TokenConfig {
    pub const DEFAULT_EXPIRY_INTERVAL_MS: u64 = 600_000;
    pub const DEFAULT_GC_INTERVAL_MS: u64 = 1_800_000;

    /// Load the configuration from `path`, falling back to the defaults when
    /// the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is malformed, or fails
    /// validation.
    pub fn load_optional(path: &Path) -> Result<Self, TokenConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(TokenConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config: Self =
            serde_json::from_str(&text).map_err(|source| TokenConfigError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants.
    ///
    /// # Errors
    /// Returns an error naming the first violated invariant.
    pub fn validate(&self) -> Result<(), TokenConfigError> {
        if self.expiry_interval == 0 {
            return Err(TokenConfigError::ZeroInterval("expiryInterval"));
        }
        if self.token_gc_interval == 0 {
            return Err(TokenConfigError::ZeroInterval("tokenGCInterval"));
        }
        if self.signing_secret.as_deref() == Some("") {
            return Err(TokenConfigError::EmptySecret);
        }
        Ok(())
    }

    /// The key policy implied by this configuration.
    #[must_use]
    pub fn signing_key(&self) -> SigningKey {
        self.signing_secret
            .as_ref()
            .map_or(SigningKey::PerToken, |secret| {
                SigningKey::Secret(secret.as_bytes().to_vec())
            })
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Self::DEFAULT_EXPIRY_INTERVAL_MS,
            token_gc_interval: Self::DEFAULT_GC_INTERVAL_MS,
            signing_secret: None,
        }
    }
}
