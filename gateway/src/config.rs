//! Gateway configuration module.
//!
//! Loads process configuration from environment variables.
//!
//! # Environment Variables
//!
//! - `GATEWAY_SERVER_ROOT`: Directory holding `conf/` and `lib/` (default: `.`)
//! - `GATEWAY_APPS_DIRECTORY`: Directory whose sub-directories are the
//!   installed applications (default: `<server root>/apps`)
//! - `GATEWAY_LISTEN_PORT`: Port to listen on (default: `9090`)
//! - `GATEWAY_REQUEST_TIMEOUT_MS`: Per-request deadline in milliseconds
//!   (default: `30000`)
//!
//! # Invariants
//!
//! - `listen_port` is always a valid port number (1-65535)
//! - `request_timeout` is never zero

use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration.
///
/// # Post-conditions
///
/// - `listen_port` is always in the valid range (1-65535)
/// - `request_timeout` is greater than zero
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Root directory of the server installation.
    pub server_root: PathBuf,
    /// Directory scanned for installed applications.
    pub apps_directory: PathBuf,
    /// Port to listen on for HTTP connections.
    pub listen_port: u16,
    /// Deadline for one request's whole pipeline.
    pub request_timeout: Duration,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl GatewayConfig {
    /// Default port for the gateway.
    pub const DEFAULT_PORT: u16 = 9090;
    /// Default server root.
    pub const DEFAULT_SERVER_ROOT: &'static str = ".";
    /// Default request deadline in milliseconds.
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `GATEWAY_LISTEN_PORT` is set but not a valid port number
    /// - `GATEWAY_REQUEST_TIMEOUT_MS` is set but not a positive integer
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_root = lookup("GATEWAY_SERVER_ROOT")
            .map_or_else(|| PathBuf::from(Self::DEFAULT_SERVER_ROOT), PathBuf::from);
        let apps_directory = lookup("GATEWAY_APPS_DIRECTORY")
            .map_or_else(|| server_root.join("apps"), PathBuf::from);
        let listen_port = Self::load_listen_port(lookup("GATEWAY_LISTEN_PORT"))?;
        let request_timeout = Self::load_request_timeout(lookup("GATEWAY_REQUEST_TIMEOUT_MS"))?;

        Ok(Self {
            server_root,
            apps_directory,
            listen_port,
            request_timeout,
        })
    }

    /// Directory holding the core configuration files.
    #[must_use]
    pub fn conf_dir(&self) -> PathBuf {
        self.server_root.join("conf")
    }

    /// Parse the listen port, defaulting when unset.
    fn load_listen_port(value: Option<String>) -> Result<u16, ConfigError> {
        let Some(value) = value else {
            return Ok(Self::DEFAULT_PORT);
        };
        match value.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ConfigError::InvalidValue {
                name: "GATEWAY_LISTEN_PORT".to_string(),
                message: format!("'{value}' is not a valid port number (must be 1-65535)"),
            }),
        }
    }

    fn load_request_timeout(value: Option<String>) -> Result<Duration, ConfigError> {
        let Some(value) = value else {
            return Ok(Duration::from_millis(Self::DEFAULT_REQUEST_TIMEOUT_MS));
        };
        match value.parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
            _ => Err(ConfigError::InvalidValue {
                name: "GATEWAY_REQUEST_TIMEOUT_MS".to_string(),
                message: format!("'{value}' is not a positive number of milliseconds"),
            }),
        }
    }
}
