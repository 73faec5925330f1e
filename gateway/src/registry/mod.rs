//! API registry: the endpoint table and the per-request pipeline.
//!
//! The table maps endpoint paths to [`RegistryEntry`] descriptors. It is
//! built once at boot from the core registry file merged with every
//! application's overlay, and is held in the shared store so every worker
//! sees the same routes. Admin operations persist to the owning file first
//! and only then commit to the live table.
//!
//! # Pre-conditions
//! - `<server_root>/conf/apiregistry.json` exists and is a JSON object of
//!   endpoint → descriptor strings.
//!
//! # Post-conditions
//! - After [`ApiRegistry::initialize`] the table is in the shared store and
//!   every extension's `initialize` hook has run.
//!
//! # Invariants
//! - A failed write to disk leaves the live table untouched.
//! - Security chains fail closed: a missing or panicking checker rejects.

pub mod entry;
pub mod persist;

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use axum::http::HeaderMap;
use futures::FutureExt;
use serde_json::{Map, Value};

use crate::apps::{App, AppCatalog, CatalogError};
use crate::extensions::{ExtensionCatalog, ExtensionKind, LoadError, Pipelines, load_pipelines};
use crate::pipeline::{ExtensionError, Payload, SecurityChecker, SecurityRejection, ServerContext};
use crate::store::{self, API_REGISTRY_KEY, SharedStore, StoreError};

pub use entry::{RegistryEntry, RegistryTable};
use entry::{request_path, split_list, substitute_placeholders};
use persist::RegistryFiles;

/// File name of every registry configuration file.
pub const REGISTRY_FILE: &str = "apiregistry.json";

/// Reason given for requests to paths with no registry entry.
pub const MISSING_ENDPOINT_REASON: &str = "API endpoint missing";

/// Errors raised while booting the registry or running admin operations.
#[derive(Debug)]
pub enum RegistryError {
    /// A file could not be read or written.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A registry file is not valid JSON.
    MalformedJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// A registry file is valid JSON but has the wrong shape.
    InvalidConfig { path: PathBuf, reason: String },
    /// The core registry file does not exist.
    MissingCoreRegistry(PathBuf),
    /// The table held in the shared store cannot be decoded.
    InvalidTable(serde_json::Error),
    /// An admin operation named an application the catalog does not know.
    UnknownApp(String),
    Store(StoreError),
    Catalog(CatalogError),
    Load(LoadError),
    Extension(ExtensionError),
    LockPoisoned,
}

impl RegistryError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "I/O error on {}: {source}", path.display()),
            Self::MalformedJson { path, source } => {
                write!(f, "malformed registry file {}: {source}", path.display())
            }
            Self::InvalidConfig { path, reason } => {
                write!(f, "invalid registry file {}: {reason}", path.display())
            }
            Self::MissingCoreRegistry(path) => {
                write!(f, "core registry file {} not found", path.display())
            }
            Self::InvalidTable(e) => write!(f, "cached registry table is invalid: {e}"),
            Self::UnknownApp(name) => write!(f, "unknown application '{name}'"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Catalog(e) => write!(f, "application catalog error: {e}"),
            Self::Load(e) => write!(f, "extension loading failed: {e}"),
            Self::Extension(e) => write!(f, "extension initialization failed: {e}"),
            Self::LockPoisoned => write!(f, "lock poisoned"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::MalformedJson { source, .. } | Self::InvalidTable(source) => Some(source),
            Self::Store(e) => Some(e),
            Self::Catalog(e) => Some(e),
            Self::Load(e) => Some(e),
            Self::Extension(e) => Some(e),
            Self::InvalidConfig { .. }
            | Self::MissingCoreRegistry(_)
            | Self::UnknownApp(_)
            | Self::LockPoisoned => None,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<CatalogError> for RegistryError {
    fn from(e: CatalogError) -> Self {
        Self::Catalog(e)
    }
}

impl From<LoadError> for RegistryError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

impl From<ExtensionError> for RegistryError {
    fn from(e: ExtensionError) -> Self {
        Self::Extension(e)
    }
}

/// Boot options for [`ApiRegistry::initialize`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Directory holding `conf/` and `lib/`.
    pub server_root: PathBuf,
    /// Log the loaded table and extensions at `debug` instead of `info`.
    pub not_verbose: bool,
}

impl RegistryOptions {
    #[must_use]
    pub fn new(server_root: impl Into<PathBuf>) -> Self {
        Self {
            server_root: server_root.into(),
            not_verbose: false,
        }
    }
}

macro_rules! boot_log {
    ($quiet:expr, $($arg:tt)+) => {
        if $quiet {
            tracing::debug!($($arg)+);
        } else {
            tracing::info!($($arg)+);
        }
    };
}

/// The endpoint table plus the loaded extension chains.
pub struct ApiRegistry {
    store: Arc<dyn SharedStore>,
    server_root: PathBuf,
    apps: Vec<App>,
    pipelines: Pipelines,
    custom_checkers: RwLock<HashMap<String, Arc<dyn SecurityChecker>>>,
    files: RegistryFiles,
}

impl ApiRegistry {
    /// Load the table and the extension chains, then run every extension's
    /// `initialize` hook.
    ///
    /// A table already present in the shared store wins and the registry
    /// files are not read.
    ///
    /// # Errors
    /// Fails if the core registry file is missing or malformed, if any
    /// overlay or manifest is malformed, if a manifest names an unregistered
    /// extension, or if an `initialize` hook fails.
    pub async fn initialize(
        options: RegistryOptions,
        store: Arc<dyn SharedStore>,
        catalog: &dyn AppCatalog,
        extensions: &ExtensionCatalog,
    ) -> Result<Self, RegistryError> {
        let RegistryOptions {
            server_root,
            not_verbose,
        } = options;
        let apps = catalog.apps()?;

        let table = if let Some(cached) = store.get(API_REGISTRY_KEY)? {
            tracing::debug!("using registry table cached in the shared store");
            decode_table(cached)?
        } else {
            let loaded = load_table(&server_root, &apps)?;
            let loaded = serde_json::to_value(&loaded).map_err(RegistryError::InvalidTable)?;
            // Another worker may have stored its table meanwhile; keep theirs.
            let stored = store::update(store.as_ref(), API_REGISTRY_KEY, |current| {
                current.cloned().unwrap_or_else(|| loaded.clone())
            })?;
            decode_table(stored)?
        };

        for (path, entry) in &table {
            boot_log!(not_verbose, endpoint = %path, resource = %entry.target, "registered endpoint");
        }

        let pipelines = load_pipelines(&server_root.join("conf"), &apps, extensions)?;
        for kind in ExtensionKind::ALL {
            boot_log!(not_verbose, %kind, extensions = ?pipelines.names(kind), "loaded extensions");
        }
        pipelines.initialize(&table).await?;

        tracing::info!(
            endpoints = table.len(),
            apps = apps.len(),
            "api registry initialized"
        );

        Ok(Self {
            store,
            server_root,
            apps,
            pipelines,
            custom_checkers: RwLock::new(HashMap::new()),
            files: RegistryFiles::new(),
        })
    }

    /// The loaded extension chains.
    #[must_use]
    pub const fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    /// Look up the entry for the path component of `url`.
    ///
    /// A store failure is logged and reads as "not registered".
    #[must_use]
    pub fn lookup(&self, url: &str) -> Option<RegistryEntry> {
        let path = request_path(url);
        match self.store.get(API_REGISTRY_KEY) {
            Ok(table) => table
                .as_ref()
                .and_then(|table| table.get(&path))
                .and_then(|entry| serde_json::from_value(entry.clone()).ok()),
            Err(e) => {
                tracing::warn!(path, "registry lookup failed: {e}");
                None
            }
        }
    }

    /// The resolved target of `url`'s endpoint.
    #[must_use]
    pub fn resolve(&self, url: &str) -> Option<String> {
        self.lookup(url).map(|entry| entry.target)
    }

    /// The pipeline directives of `url`'s endpoint.
    #[must_use]
    pub fn resolve_metadata(&self, url: &str) -> Option<BTreeMap<String, String>> {
        self.lookup(url).map(|entry| entry.query)
    }

    /// Thread `data` through every decoder in priority order.
    ///
    /// Returns `Ok(None)` if the endpoint is not registered.
    ///
    /// # Errors
    /// The first decoder failure aborts the chain.
    pub async fn decode(
        &self,
        url: &str,
        data: Payload,
        headers: &HeaderMap,
        ctx: &ServerContext,
    ) -> Result<Option<Payload>, ExtensionError> {
        let Some(entry) = self.lookup(url) else {
            return Ok(None);
        };
        let mut data = data;
        for decoder in &self.pipelines.decoders {
            data = decoder
                .handler
                .decode_incoming_data(&entry, url, data, headers, ctx)
                .await?;
        }
        Ok(Some(data))
    }

    /// Thread `response` through every encoder in priority order.
    ///
    /// Returns `Ok(None)` if the endpoint is not registered.
    ///
    /// # Errors
    /// The first encoder failure aborts the chain.
    pub async fn encode(
        &self,
        url: &str,
        response: Payload,
        request_headers: &HeaderMap,
        response_headers: &mut HeaderMap,
        ctx: &ServerContext,
    ) -> Result<Option<Payload>, ExtensionError> {
        let Some(entry) = self.lookup(url) else {
            return Ok(None);
        };
        let mut response = response;
        for encoder in &self.pipelines.encoders {
            response = encoder
                .handler
                .encode_response(&entry, url, response, request_headers, response_headers, ctx)
                .await?;
        }
        Ok(Some(response))
    }

    /// Run the core security chain, then the entry's `customSecurity`
    /// checkers. Stops at the first rejection.
    ///
    /// # Errors
    /// The rejection names the checker that failed. Unregistered endpoints
    /// are rejected with [`MISSING_ENDPOINT_REASON`].
    pub async fn check_security(
        &self,
        url: &str,
        request: &Payload,
        headers: &HeaderMap,
        ctx: &ServerContext,
    ) -> Result<(), SecurityRejection> {
        let Some(entry) = self.lookup(url) else {
            return Err(SecurityRejection::forbidden(MISSING_ENDPOINT_REASON));
        };

        for checker in &self.pipelines.security_checkers {
            run_checker(
                &checker.name,
                checker.handler.as_ref(),
                &entry,
                url,
                request,
                headers,
                ctx,
            )
            .await?;
        }

        let Some(custom) = entry.directive("customSecurity") else {
            return Ok(());
        };
        for name in split_list(custom) {
            let Some(checker) = self.custom_checker(name) else {
                tracing::warn!(url, checker = name, "custom security checker not registered");
                return Err(SecurityRejection::forbidden(format!(
                    "custom security checker '{name}' is not registered{}",
                    failure_suffix(name)
                )));
            };
            run_checker(name, checker.as_ref(), &entry, url, request, headers, ctx).await?;
        }
        Ok(())
    }

    /// Let every header manager add response headers. Does nothing for
    /// unregistered endpoints.
    pub async fn inject_response_headers(
        &self,
        url: &str,
        response: &Payload,
        request_headers: &HeaderMap,
        response_headers: &mut HeaderMap,
        ctx: &ServerContext,
        request: &Payload,
    ) {
        let Some(entry) = self.lookup(url) else {
            return;
        };
        for manager in &self.pipelines.header_managers {
            manager
                .handler
                .inject_response_headers(
                    &entry,
                    url,
                    response,
                    request_headers,
                    response_headers,
                    ctx,
                    request,
                )
                .await;
        }
    }

    /// Registered endpoint paths, sorted.
    #[must_use]
    pub fn list_apis(&self) -> Vec<String> {
        let mut paths: Vec<String> = match self.store.get(API_REGISTRY_KEY) {
            Ok(Some(Value::Object(table))) => table.keys().cloned().collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::warn!("cannot list endpoints: {e}");
                Vec::new()
            }
        };
        paths.sort();
        paths
    }

    /// Register or replace an endpoint.
    ///
    /// `descriptor` is the raw `target?directives` string as it should
    /// appear in the registry file; placeholders are kept on disk and
    /// substituted in the live table. `app` selects the owning application's
    /// registry file, or the core file when `None`.
    ///
    /// # Errors
    /// Fails without touching the live table if the application is unknown
    /// or the file cannot be written.
    pub async fn add_api(
        &self,
        path: &str,
        descriptor: &str,
        app: Option<&str>,
    ) -> Result<(), RegistryError> {
        let (file, root) = self.owner(app)?;
        let single: Map<String, Value> =
            [(path.to_string(), Value::String(descriptor.to_string()))]
                .into_iter()
                .collect();
        let single = Value::Object(single).to_string();
        let live = parse_registry(&file, &single, &root, &self.server_root)?;
        let live = serde_json::to_value(live).map_err(RegistryError::InvalidTable)?;

        self.files.insert(&file, path, descriptor).await?;

        store::update(self.store.as_ref(), API_REGISTRY_KEY, |current| {
            let mut table = table_of(current);
            if let Value::Object(added) = &live {
                table.extend(added.clone());
            }
            Value::Object(table)
        })?;
        tracing::info!(endpoint = path, app = app.unwrap_or("core"), "endpoint registered");
        Ok(())
    }

    /// Alias of [`add_api`](Self::add_api).
    pub async fn edit_api(
        &self,
        path: &str,
        descriptor: &str,
        app: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.add_api(path, descriptor, app).await
    }

    /// Remove an endpoint from the owning registry file and the live table.
    ///
    /// Returns `false` if the endpoint was not in the live table.
    pub async fn delete_api(&self, path: &str, app: Option<&str>) -> Result<bool, RegistryError> {
        let (file, _) = self.owner(app)?;
        self.files.remove(&file, path).await?;

        let mut removed = false;
        store::update(self.store.as_ref(), API_REGISTRY_KEY, |current| {
            let mut table = table_of(current);
            removed = table.shift_remove(path).is_some();
            Value::Object(table)
        })?;
        if removed {
            tracing::info!(endpoint = path, app = app.unwrap_or("core"), "endpoint removed");
        }
        Ok(removed)
    }

    /// Make `checker` available to entries naming it in `customSecurity`.
    pub fn add_custom_security_checker(
        &self,
        name: &str,
        checker: Arc<dyn SecurityChecker>,
    ) -> Result<(), RegistryError> {
        self.custom_checkers
            .write()
            .map_err(|_| RegistryError::LockPoisoned)?
            .insert(name.to_string(), checker);
        Ok(())
    }

    /// Returns `true` if a checker was registered under `name`.
    pub fn remove_custom_security_checker(&self, name: &str) -> Result<bool, RegistryError> {
        Ok(self
            .custom_checkers
            .write()
            .map_err(|_| RegistryError::LockPoisoned)?
            .remove(name)
            .is_some())
    }

    fn custom_checker(&self, name: &str) -> Option<Arc<dyn SecurityChecker>> {
        self.custom_checkers.read().ok()?.get(name).cloned()
    }

    /// Registry file and resolution root of the owning application or core.
    fn owner(&self, app: Option<&str>) -> Result<(PathBuf, PathBuf), RegistryError> {
        match app {
            None => Ok((
                self.server_root.join("conf").join(REGISTRY_FILE),
                self.server_root.clone(),
            )),
            Some(name) => self
                .apps
                .iter()
                .find(|app| app.name == name)
                .map(|app| (app.conf_dir().join(REGISTRY_FILE), app.root.clone()))
                .ok_or_else(|| RegistryError::UnknownApp(name.to_string())),
        }
    }
}

fn failure_suffix(name: &str) -> String {
    format!(" (security check failed: {name})")
}

/// Run one checker, turning a panic into a rejection.
async fn run_checker(
    name: &str,
    checker: &dyn SecurityChecker,
    entry: &RegistryEntry,
    url: &str,
    request: &Payload,
    headers: &HeaderMap,
    ctx: &ServerContext,
) -> Result<(), SecurityRejection> {
    let outcome = AssertUnwindSafe(checker.check_security(entry, url, request, headers, ctx))
        .catch_unwind()
        .await;
    let rejection = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(rejection)) => rejection,
        Err(_) => {
            tracing::error!(url, checker = name, "security checker panicked");
            SecurityRejection::forbidden("security checker failed unexpectedly")
        }
    };
    tracing::debug!(url, checker = name, reason = %rejection.reason, "request rejected");
    Err(SecurityRejection {
        reason: format!("{}{}", rejection.reason, failure_suffix(name)),
        code: rejection.code,
    })
}

fn table_of(current: Option<&Value>) -> Map<String, Value> {
    current
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn decode_table(value: Value) -> Result<RegistryTable, RegistryError> {
    serde_json::from_value(value).map_err(RegistryError::InvalidTable)
}

/// Read the core registry and merge every application's overlay over it.
fn load_table(server_root: &Path, apps: &[App]) -> Result<RegistryTable, RegistryError> {
    let core_path = server_root.join("conf").join(REGISTRY_FILE);
    let Some(text) = read_optional(&core_path)? else {
        return Err(RegistryError::MissingCoreRegistry(core_path));
    };
    let mut table = parse_registry(&core_path, &text, server_root, server_root)?;

    for app in apps {
        let path = app.conf_dir().join(REGISTRY_FILE);
        if let Some(text) = read_optional(&path)? {
            table.extend(parse_registry(&path, &text, &app.root, server_root)?);
        }
    }
    Ok(table)
}

fn read_optional(path: &Path) -> Result<Option<String>, RegistryError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RegistryError::io(path, source)),
    }
}

/// Parse registry file text owned by `root`: substitute placeholders, parse
/// every descriptor and resolve its target against `root`.
fn parse_registry(
    path: &Path,
    text: &str,
    root: &Path,
    server_root: &Path,
) -> Result<RegistryTable, RegistryError> {
    let text = substitute_placeholders(text, root, server_root);
    let raw: Map<String, Value> =
        serde_json::from_str(&text).map_err(|source| RegistryError::MalformedJson {
            path: path.to_path_buf(),
            source,
        })?;

    raw.into_iter()
        .map(|(endpoint, descriptor)| {
            let Value::String(descriptor) = descriptor else {
                return Err(RegistryError::InvalidConfig {
                    path: path.to_path_buf(),
                    reason: format!("descriptor of '{endpoint}' must be a string"),
                });
            };
            let entry = RegistryEntry::parse(&descriptor).resolved_against(root);
            Ok((endpoint, entry))
        })
        .collect()
}
