//! Authentication: bearer tokens and API keys.
//!
//! # Invariants
//! - Every issued token is in the live-token table until it is released or
//!   expires.
//! - All configured API keys are non-empty.

pub mod api_keys;
pub mod config;
pub mod gc;
pub mod manager;
pub mod template;
pub mod token;

pub use api_keys::{ApiKeys, ApiKeysError};
pub use config::{TokenConfig, TokenConfigError};
pub use manager::{ListenerId, TokenEvent, TokenListener, TokenManager};
pub use token::{Claims, TokenError};
