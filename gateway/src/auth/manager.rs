//! Token manager: issuance, validation, sliding expiry and sweeping of
//! bearer tokens.
//!
//! # Token lifecycle
//!
//! `ISSUED → ACTIVE → EXPIRED | REVOKED`
//!
//! - Issuing writes `token → lastAccess` into the live-token table.
//! - Every successful validation refreshes `lastAccess`.
//! - A token unused for longer than its `expiryInterval` is expired: removed
//!   on the next validation attempt or by the periodic sweep.
//! - `release_token` revokes immediately.
//!
//! There is no transition back out of `EXPIRED` or `REVOKED`.
//!
//! # Concurrency
//! The table lives in the shared store and every mutation goes through
//! [`store::update`], so a sweep running concurrently with request handling
//! never loses a refresh, and a refresh never resurrects a swept token.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue};
use serde_json::{Map, Value};

use super::config::TokenConfig;
use super::gc::spawn_gc_task;
use super::template::{self, FLAG_CLAIM};
use super::token::{self, Claims, TokenError};
use crate::pipeline::{
    ExtensionError, HeaderManager, Payload, SecurityChecker, SecurityRejection, ServerContext,
};
use crate::registry::entry::split_list;
use crate::registry::{RegistryEntry, RegistryTable};
use crate::store::{self, SharedStore, StoreError, TOKEN_TABLE_KEY};
use crate::time::TimeSource;

/// Diagnostic name of the token manager extension.
pub const EXTENSION_NAME: &str = "tokenmanager";

const ACCESS_TOKEN_HEADER: &str = "access_token";
const TOKEN_TYPE_HEADER: &str = "token_type";

/// Token lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// A token was issued for a response.
    Generated { token: String, claims: Claims },
    /// A token was evicted for inactivity.
    Expired { token: String },
}

/// Callback invoked for every token event.
pub type TokenListener = Arc<dyn Fn(&TokenEvent) + Send + Sync>;

/// Handle returned by [`TokenManager::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Shared state behind every clone of a [`TokenManager`].
pub struct TokenManagerState {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn TimeSource>,
    config_path: Option<PathBuf>,
    config: RwLock<TokenConfig>,
    initialized: AtomicBool,
    listeners: RwLock<Vec<(ListenerId, TokenListener)>>,
    next_listener_id: AtomicU64,
    gc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for TokenManagerState {
    fn drop(&mut self) {
        if let Some(handle) = self.gc_task.lock().ok().and_then(|mut task| task.take()) {
            handle.abort();
        }
    }
}

/// Issues and validates bearer tokens.
///
/// Cheap to clone; clones share state. Registered as both a security checker
/// and a header manager.
#[derive(Clone)]
pub struct TokenManager {
    state: Arc<TokenManagerState>,
}

impl TokenManager {
    /// Create a manager with an explicit configuration.
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn TimeSource>,
        config: TokenConfig,
    ) -> Self {
        Self::build(store, clock, None, config)
    }

    /// Create a manager whose configuration is read from `path` during
    /// [`initialize`](Self::initialize). A missing file means defaults.
    #[must_use]
    pub fn with_config_file(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn TimeSource>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self::build(store, clock, Some(path.into()), TokenConfig::default())
    }

    fn build(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn TimeSource>,
        config_path: Option<PathBuf>,
        config: TokenConfig,
    ) -> Self {
        Self {
            state: Arc::new(TokenManagerState {
                store,
                clock,
                config_path,
                config: RwLock::new(config),
                initialized: AtomicBool::new(false),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                gc_task: Mutex::new(None),
            }),
        }
    }

    pub(super) const fn from_state(state: Arc<TokenManagerState>) -> Self {
        Self { state }
    }

    /// A weak handle for background tasks.
    #[must_use]
    pub fn downgrade(&self) -> Weak<TokenManagerState> {
        Arc::downgrade(&self.state)
    }

    /// Prepare the manager. Repeated calls are no-ops.
    ///
    /// Loads the configuration file (if any), makes sure the live-token table
    /// exists, and schedules the periodic sweep when running inside a tokio
    /// runtime.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the store fails.
    /// A failed call may be retried.
    pub fn initialize(&self) -> Result<(), TokenError> {
        if self
            .state
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        if let Err(e) = self.initialize_once() {
            self.state.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn initialize_once(&self) -> Result<(), TokenError> {
        if let Some(path) = &self.state.config_path {
            let loaded = TokenConfig::load_optional(path)?;
            *self.write_config()? = loaded;
        }
        let config = self.config()?;
        config.validate()?;

        store::update(self.state.store.as_ref(), TOKEN_TABLE_KEY, |current| {
            match current {
                Some(table @ Value::Object(_)) => table.clone(),
                _ => Value::Object(Map::new()),
            }
        })?;

        if tokio::runtime::Handle::try_current().is_ok() {
            let handle = spawn_gc_task(
                self.downgrade(),
                Duration::from_millis(config.token_gc_interval),
            );
            if let Ok(mut gc_task) = self.state.gc_task.lock() {
                *gc_task = Some(handle);
            }
        }

        tracing::info!(
            expiry_interval_ms = config.expiry_interval,
            gc_interval_ms = config.token_gc_interval,
            persistent_key = config.signing_secret.is_some(),
            "token manager initialized"
        );
        Ok(())
    }

    /// Current configuration.
    pub fn config(&self) -> Result<TokenConfig, TokenError> {
        self.state
            .config
            .read()
            .map(|config| config.clone())
            .map_err(|_| TokenError::Store(StoreError::LockPoisoned))
    }

    fn write_config(&self) -> Result<std::sync::RwLockWriteGuard<'_, TokenConfig>, TokenError> {
        self.state
            .config
            .write()
            .map_err(|_| TokenError::Store(StoreError::LockPoisoned))
    }

    /// Issue a new token carrying `properties` as claims and register it as
    /// active.
    pub fn create_signed_jwt_token(&self, properties: &Claims) -> Result<String, TokenError> {
        let config = self.config()?;
        let claims = token::build_claims(
            self.state.clock.now_ms(),
            config.expiry_interval,
            properties,
        );
        let token = token::sign(&claims, &config.signing_key())?;
        self.add_token(&token)?;
        Ok(token)
    }

    /// Register an externally issued token as active, starting its expiry
    /// window now.
    ///
    /// # Errors
    /// Returns `TokenError::Malformed` if the token is not well-formed.
    pub fn add_token(&self, token: &str) -> Result<(), TokenError> {
        token::parse_claims(token)?;
        let now = self.state.clock.now_ms();
        store::update(self.state.store.as_ref(), TOKEN_TABLE_KEY, |current| {
            let mut table = table_of(current);
            table.insert(token.to_string(), Value::from(now));
            Value::Object(table)
        })?;
        Ok(())
    }

    /// Revoke a token immediately.
    ///
    /// Returns `Ok(false)` if the token was not active.
    pub fn release_token(&self, token: &str) -> Result<bool, TokenError> {
        let removed = self.remove_token(token, None)?;
        if removed {
            tracing::debug!("token released");
        }
        Ok(removed)
    }

    /// Extract the bearer token from an `Authorization` header.
    ///
    /// The scheme is matched case-insensitively.
    #[must_use]
    pub fn get_token(headers: &HeaderMap) -> Option<String> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let mut parts = value.split_whitespace();
        let scheme = parts.next()?;
        let token = parts.next()?;
        if !scheme.eq_ignore_ascii_case("bearer") || parts.next().is_some() {
            return None;
        }
        Some(token.to_string())
    }

    /// Read the claims of a token without validating it.
    pub fn get_claims(token: &str) -> Result<Claims, TokenError> {
        token::parse_claims(token)
    }

    /// Validate the bearer token in `headers` and refresh its expiry window.
    pub fn check_header_token(&self, headers: &HeaderMap) -> Result<Claims, TokenError> {
        let token = Self::get_token(headers).ok_or(TokenError::MissingHeader)?;
        let claims = self.validate(&token)?;
        self.touch(&token)?;
        Ok(claims)
    }

    /// Check a token's form and liveness without refreshing it.
    ///
    /// A token found to be past its window is evicted.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = token::parse_claims(token)?;
        let config = self.config()?;
        if let token::SigningKey::Secret(secret) = config.signing_key() {
            token::verify_signature(token, &secret)?;
        }

        let table = self.state.store.get(TOKEN_TABLE_KEY)?;
        let last_access = table
            .as_ref()
            .and_then(|table| table.get(token))
            .and_then(Value::as_u64)
            .ok_or(TokenError::NotFound)?;

        let interval = token::expiry_interval(&claims).unwrap_or(config.expiry_interval);
        let now = self.state.clock.now_ms();
        if now.saturating_sub(last_access) > interval {
            if self.remove_token(token, Some(last_access))? {
                self.notify(&TokenEvent::Expired {
                    token: token.to_string(),
                });
            }
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Full endpoint authorization for an entry's `needsToken` and
    /// `checkClaims` directives. Refreshes the token on success.
    pub fn authorize(
        &self,
        entry: &RegistryEntry,
        request: &Payload,
        headers: &HeaderMap,
    ) -> Result<(), TokenError> {
        let Some(needs_token) = entry.directive("needsToken").filter(|v| *v != "false") else {
            return Ok(());
        };

        let token = Self::get_token(headers).ok_or(TokenError::MissingHeader)?;
        let claims = self.validate(&token)?;

        if needs_token != "true" {
            let subject = token::subject(&claims);
            let allowed = split_list(needs_token).any(|level| subject.as_deref() == Some(level));
            if !allowed {
                return Err(TokenError::Unauthorized);
            }
        }

        if let Some(check_claims) = entry.directive("checkClaims") {
            for name in split_list(check_claims) {
                let matches = match (claims.get(name), request.get(name)) {
                    (Some(claim), Some(field)) => {
                        claim == field
                            || token::scalar_text(claim)
                                .is_some_and(|c| token::scalar_text(field) == Some(c))
                    }
                    _ => false,
                };
                if !matches {
                    return Err(TokenError::ClaimMismatch(name.to_string()));
                }
            }
        }

        self.touch(&token)?;
        Ok(())
    }

    /// Issue a token for a response if the entry's `addsToken` directive and
    /// its gating allow it. Returns the issued token.
    pub fn issue_for_response(
        &self,
        entry: &RegistryEntry,
        response: &Payload,
        request: &Payload,
        response_headers: &mut HeaderMap,
    ) -> Result<Option<String>, TokenError> {
        let Some(directive) = entry.directive("addsToken").filter(|v| *v != "false") else {
            return Ok(None);
        };

        let properties = template::claims_from_directive(directive, response, request);
        let allowed = properties.get(FLAG_CLAIM).map_or_else(
            || template::is_truthy(response.get("result")),
            template::flag_allows,
        );
        if !allowed {
            tracing::debug!("response not successful, no token issued");
            return Ok(None);
        }

        let token = self.create_signed_jwt_token(&properties)?;
        let header_value = |value: String| {
            HeaderValue::try_from(value).map_err(|e| TokenError::Signing(e.to_string()))
        };
        response_headers.insert(ACCESS_TOKEN_HEADER, header_value(token.clone())?);
        response_headers.insert(TOKEN_TYPE_HEADER, HeaderValue::from_static("bearer"));
        response_headers.insert(AUTHORIZATION, header_value(format!("Bearer {token}"))?);

        let claims = token::parse_claims(&token)?;
        self.notify(&TokenEvent::Generated {
            token: token.clone(),
            claims,
        });
        Ok(Some(token))
    }

    /// Evict every token whose idle time exceeds its own expiry interval.
    ///
    /// Tokens whose claims cannot be read are left alone. Fires one
    /// `Expired` event per eviction. Returns the number evicted.
    pub fn sweep(&self) -> Result<usize, TokenError> {
        let default_interval = self.config()?.expiry_interval;
        let snapshot = self.state.store.get(TOKEN_TABLE_KEY)?;
        let intervals: std::collections::HashMap<String, u64> = snapshot
            .as_ref()
            .and_then(Value::as_object)
            .map(|table| {
                table
                    .keys()
                    .filter_map(|token| {
                        let claims = token::parse_claims(token).ok()?;
                        let interval =
                            token::expiry_interval(&claims).unwrap_or(default_interval);
                        Some((token.clone(), interval))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let now = self.state.clock.now_ms();
        let mut evicted = Vec::new();
        store::update(self.state.store.as_ref(), TOKEN_TABLE_KEY, |current| {
            evicted.clear();
            let mut table = table_of(current);
            table.retain(|token, last_access| {
                let Some(interval) = intervals.get(token) else {
                    return true;
                };
                let expired = last_access
                    .as_u64()
                    .is_some_and(|last| now.saturating_sub(last) > *interval);
                if expired {
                    evicted.push(token.clone());
                }
                !expired
            });
            Value::Object(table)
        })?;

        for token in &evicted {
            self.notify(&TokenEvent::Expired {
                token: token.clone(),
            });
        }
        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), "swept expired tokens");
        }
        Ok(evicted.len())
    }

    /// Register a lifecycle listener.
    #[must_use = "the id is needed to remove the listener"]
    pub fn add_listener(&self, listener: TokenListener) -> ListenerId {
        let id = ListenerId(self.state.next_listener_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut listeners) = self.state.listeners.write() {
            listeners.push((id, listener));
        }
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    #[must_use]
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.state.listeners.write() else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    fn notify(&self, event: &TokenEvent) {
        // Listeners run outside the lock so they may (de)register listeners.
        let listeners: Vec<TokenListener> = match self.state.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Refresh `lastAccess` of a token that is still active.
    fn touch(&self, token: &str) -> Result<(), TokenError> {
        let now = self.state.clock.now_ms();
        let mut present = false;
        store::update(self.state.store.as_ref(), TOKEN_TABLE_KEY, |current| {
            let mut table = table_of(current);
            present = table.contains_key(token);
            if present {
                table.insert(token.to_string(), Value::from(now));
            }
            Value::Object(table)
        })?;
        if present { Ok(()) } else { Err(TokenError::NotFound) }
    }

    /// Remove a token, optionally only if its `lastAccess` still equals
    /// `expected_access`. Returns whether this call removed it.
    fn remove_token(&self, token: &str, expected_access: Option<u64>) -> Result<bool, TokenError> {
        let mut removed = false;
        store::update(self.state.store.as_ref(), TOKEN_TABLE_KEY, |current| {
            let mut table = table_of(current);
            removed = match (table.get(token).and_then(Value::as_u64), expected_access) {
                (Some(last), Some(expected)) if last != expected => false,
                (None, _) => false,
                _ => table.shift_remove(token).is_some(),
            };
            Value::Object(table)
        })?;
        Ok(removed)
    }
}

fn table_of(current: Option<&Value>) -> Map<String, Value> {
    current
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl SecurityChecker for TokenManager {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        Self::initialize(self).map_err(|e| ExtensionError::new(EXTENSION_NAME, e.to_string()))
    }

    async fn check_security(
        &self,
        entry: &RegistryEntry,
        url: &str,
        request: &Payload,
        headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<(), SecurityRejection> {
        self.authorize(entry, request, headers).map_err(|e| {
            tracing::debug!(url, reason = %e, "token check rejected request");
            SecurityRejection::forbidden(e.to_string())
        })
    }
}

#[async_trait]
impl HeaderManager for TokenManager {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        Self::initialize(self).map_err(|e| ExtensionError::new(EXTENSION_NAME, e.to_string()))
    }

    async fn inject_response_headers(
        &self,
        entry: &RegistryEntry,
        url: &str,
        response: &Payload,
        _request_headers: &HeaderMap,
        response_headers: &mut HeaderMap,
        _ctx: &ServerContext,
        request: &Payload,
    ) {
        if let Err(e) = self.issue_for_response(entry, response, request, response_headers) {
            tracing::warn!(url, "failed to issue token: {e}");
        }
    }
}
