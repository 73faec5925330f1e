//! Signed bearer tokens.
//!
//! Tokens use the HS256 JWT layout `header.claims.signature`, base64url
//! without padding. The header is always `{"typ":"JWT","alg":"HS256"}`.
//!
//! # Trust model
//! With [`SigningKey::PerToken`] every token is signed with a fresh random
//! key that is immediately discarded, so the signature cannot be verified by
//! anyone. Membership in the live-token table is then the sole trust anchor.
//! [`SigningKey::Secret`] signs with a persistent server key and validation
//! additionally verifies the HMAC.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde_json::{Map, Value};

use crate::store::StoreError;

use super::config::TokenConfigError;

/// Issuer claim stamped on every token.
pub const ISSUER: &str = "gateway";

/// Claim set of a token: standard claims plus caller-supplied ones.
pub type Claims = Map<String, Value>;

/// Key policy for signing new tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningKey {
    /// A fresh random 256-bit key per token.
    PerToken,
    /// A persistent server secret.
    Secret(Vec<u8>),
}

/// Why a token was not accepted.
///
/// Every variant surfaces to clients as the same 403 rejection; only the
/// diagnostic reason differs.
#[derive(Debug)]
pub enum TokenError {
    /// No `Authorization: Bearer <token>` header, or it is malformed.
    MissingHeader,
    /// The token is not three segments of base64url JSON.
    Malformed,
    /// The token is not in the live-token table (never issued, released or
    /// swept).
    NotFound,
    /// The token was not used within its expiry interval.
    Expired,
    /// The signature does not match the server secret.
    InvalidSignature,
    /// The token's subject is not in the endpoint's allow-list.
    Unauthorized,
    /// A claim named by `checkClaims` differs from the request.
    ClaimMismatch(String),
    /// The shared store failed.
    Store(StoreError),
    /// The token could not be signed.
    Signing(String),
    /// The token manager configuration is invalid.
    Config(TokenConfigError),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHeader => write!(f, "authorization header missing or malformed"),
            Self::Malformed => write!(f, "malformed token"),
            Self::NotFound => write!(f, "token not found"),
            Self::Expired => write!(f, "token expired"),
            Self::InvalidSignature => write!(f, "invalid token signature"),
            Self::Unauthorized => write!(f, "token subject not authorized for this endpoint"),
            Self::ClaimMismatch(name) => write!(f, "claim '{name}' does not match request"),
            Self::Store(e) => write!(f, "token store error: {e}"),
            Self::Signing(reason) => write!(f, "cannot sign token: {reason}"),
            Self::Config(e) => write!(f, "token manager configuration: {e}"),
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for TokenError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TokenConfigError> for TokenError {
    fn from(e: TokenConfigError) -> Self {
        Self::Config(e)
    }
}

/// Build the claim set for a new token.
///
/// Generated claims come first; `properties` override them.
#[must_use]
pub fn build_claims(now_ms: u64, expiry_interval_ms: u64, properties: &Claims) -> Claims {
    let iat = now_ms / 1000;
    let mut claims = Claims::new();
    claims.insert("iss".to_string(), Value::from(ISSUER));
    claims.insert("iat".to_string(), Value::from(iat));
    claims.insert("iatms".to_string(), Value::from(now_ms));
    claims.insert("nbf".to_string(), Value::from(iat));
    claims.insert(
        "exp".to_string(),
        Value::from(iat + expiry_interval_ms / 1000),
    );
    claims.insert(
        "jti".to_string(),
        Value::from(format!("{:032x}", rand::random::<u128>())),
    );
    claims.insert("expiryInterval".to_string(), Value::from(expiry_interval_ms));
    for (key, value) in properties {
        claims.insert(key.clone(), value.clone());
    }
    claims
}

/// Sign a claim set into a token string.
pub fn sign(claims: &Claims, key: &SigningKey) -> Result<String, TokenError> {
    let secret = match key {
        SigningKey::PerToken => rand::random::<[u8; 32]>().to_vec(),
        SigningKey::Secret(secret) => secret.clone(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(&secret),
    )
    .map_err(|e| TokenError::Signing(e.to_string()))
}

/// Read the claim set of a token without verifying its signature.
pub fn parse_claims(token: &str) -> Result<Claims, TokenError> {
    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::Malformed);
    };
    if header.is_empty() || signature.is_empty() {
        return Err(TokenError::Malformed);
    }

    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    match serde_json::from_slice(&payload) {
        Ok(Value::Object(claims)) => Ok(claims),
        _ => Err(TokenError::Malformed),
    }
}

/// Verify the HMAC of a token against a persistent secret.
///
/// Time-based claims are not checked here: expiry slides with use and is
/// enforced against the live-token table instead.
pub fn verify_signature(token: &str, secret: &[u8]) -> Result<(), TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|_| ())
        .map_err(map_jwt_error)
}

/// Maps jsonwebtoken errors to our `TokenError` type.
fn map_jwt_error(error: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;

    match error.kind() {
        ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        _ => TokenError::Malformed,
    }
}

/// The token's own expiry interval in milliseconds, if it carries one.
#[must_use]
pub fn expiry_interval(claims: &Claims) -> Option<u64> {
    match claims.get("expiryInterval")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The `sub` claim as text.
#[must_use]
pub fn subject(claims: &Claims) -> Option<String> {
    claims.get("sub").and_then(scalar_text)
}

/// Text form of a scalar JSON value; `None` for null, arrays and objects.
#[must_use]
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
