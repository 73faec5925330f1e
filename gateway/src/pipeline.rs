//! Request pipeline contracts.
//!
//! Every request passes through four ordered chains of extensions:
//!
//! 1. security checkers (deny on first rejection)
//! 2. decoders (each transforms the inbound payload for the next)
//! 3. encoders (each transforms the outbound payload for the next)
//! 4. header managers (each may add response headers; no short-circuit)
//!
//! A single handler object may implement several capabilities; the token
//! manager is both a security checker and a header manager.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::Value;

use crate::registry::{RegistryEntry, RegistryTable};

/// Request and response bodies as they flow through the chains.
pub type Payload = Value;

/// HTTP status used for rejections that do not specify one.
pub const DEFAULT_REJECTION_CODE: u16 = 403;

/// Per-request information supplied by the HTTP server.
#[derive(Debug, Clone, Default)]
pub struct ServerContext {
    /// Address of the remote peer, when known.
    pub remote_addr: Option<SocketAddr>,
    /// HTTP method of the request.
    pub method: String,
}

/// Outcome of a failed security check.
///
/// The reason is a diagnostic string for logs and clients; it is not meant to
/// be machine-parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRejection {
    pub reason: String,
    pub code: u16,
}

impl SecurityRejection {
    /// A rejection with the default 403 code.
    #[must_use]
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            code: DEFAULT_REJECTION_CODE,
        }
    }

    #[must_use]
    pub fn with_code(reason: impl Into<String>, code: u16) -> Self {
        Self {
            reason: reason.into(),
            code,
        }
    }
}

impl std::fmt::Display for SecurityRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// Failure raised by a decoder or encoder.
///
/// Unlike a security rejection, this aborts the request: it cannot be
/// meaningfully completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionError {
    /// Diagnostic name of the failing extension.
    pub extension: String,
    pub message: String,
}

impl ExtensionError {
    #[must_use]
    pub fn new(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExtensionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "extension '{}' failed: {}", self.extension, self.message)
    }
}

impl std::error::Error for ExtensionError {}

/// Transforms inbound request payloads.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Called once at boot with the loaded registry table.
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        Ok(())
    }

    async fn decode_incoming_data(
        &self,
        entry: &RegistryEntry,
        url: &str,
        data: Payload,
        headers: &HeaderMap,
        ctx: &ServerContext,
    ) -> Result<Payload, ExtensionError>;
}

/// Transforms outbound response payloads.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        Ok(())
    }

    async fn encode_response(
        &self,
        entry: &RegistryEntry,
        url: &str,
        response: Payload,
        request_headers: &HeaderMap,
        response_headers: &mut HeaderMap,
        ctx: &ServerContext,
    ) -> Result<Payload, ExtensionError>;
}

/// Decides whether a request may proceed.
#[async_trait]
pub trait SecurityChecker: Send + Sync {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        Ok(())
    }

    async fn check_security(
        &self,
        entry: &RegistryEntry,
        url: &str,
        request: &Payload,
        headers: &HeaderMap,
        ctx: &ServerContext,
    ) -> Result<(), SecurityRejection>;
}

/// Adds headers to outbound responses.
#[async_trait]
pub trait HeaderManager: Send + Sync {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn inject_response_headers(
        &self,
        entry: &RegistryEntry,
        url: &str,
        response: &Payload,
        request_headers: &HeaderMap,
        response_headers: &mut HeaderMap,
        ctx: &ServerContext,
        request: &Payload,
    );
}
