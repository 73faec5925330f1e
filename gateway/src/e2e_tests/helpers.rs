//! Common helpers for end-to-end tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

use crate::apps::{App, StaticCatalog};
use crate::auth::{ApiKeys, TokenConfig, TokenManager};
use crate::extensions::{ExtensionCatalog, ExtensionKind, builtin};
use crate::http::{Backend, BackendError, GatewayState, handle_request};
use crate::pipeline::{
    Decoder, Encoder, ExtensionError, HeaderManager, Payload, SecurityChecker,
    SecurityRejection, ServerContext,
};
use crate::registry::{
    ApiRegistry, REGISTRY_FILE, RegistryEntry, RegistryError, RegistryOptions, RegistryTable,
};
use crate::store::MemoryStore;
use crate::time::SimulatedTimeSource;

/// Ordered record of extension calls shared between test extensions.
pub type CallLog = Arc<Mutex<Vec<String>>>;

#[must_use]
pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

#[allow(clippy::expect_used)]
pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().expect("log").clone()
}

#[allow(clippy::expect_used)]
fn record(log: &CallLog, call: String) {
    log.lock().expect("log").push(call);
}

/// Claims from a JSON object literal.
#[must_use]
pub fn claims(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

#[allow(clippy::expect_used)]
#[must_use]
pub fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).expect("header value"),
    );
    headers
}

/// Appends its tag to the payload's `trail` array.
pub struct TagDecoder {
    pub tag: String,
    pub log: CallLog,
}

impl TagDecoder {
    pub fn new(tag: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            log: Arc::clone(log),
        })
    }
}

#[async_trait]
impl Decoder for TagDecoder {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        record(&self.log, format!("init:decoder:{}", self.tag));
        Ok(())
    }

    async fn decode_incoming_data(
        &self,
        _entry: &RegistryEntry,
        _url: &str,
        data: Payload,
        _headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<Payload, ExtensionError> {
        record(&self.log, format!("decode:{}", self.tag));
        let mut fields = match data {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        let trail = fields
            .entry("trail")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = trail {
            items.push(Value::String(self.tag.clone()));
        }
        Ok(Value::Object(fields))
    }
}

/// Fails every decode.
pub struct FailingDecoder;

#[async_trait]
impl Decoder for FailingDecoder {
    async fn decode_incoming_data(
        &self,
        _entry: &RegistryEntry,
        _url: &str,
        _data: Payload,
        _headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<Payload, ExtensionError> {
        Err(ExtensionError::new("failing", "cannot decode"))
    }
}

/// Sleeps before passing the payload through.
pub struct SlowDecoder {
    pub delay: Duration,
    pub log: CallLog,
}

#[async_trait]
impl Decoder for SlowDecoder {
    async fn decode_incoming_data(
        &self,
        _entry: &RegistryEntry,
        _url: &str,
        data: Payload,
        _headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<Payload, ExtensionError> {
        record(&self.log, "decode:slow:start".to_string());
        tokio::time::sleep(self.delay).await;
        record(&self.log, "decode:slow:end".to_string());
        Ok(data)
    }
}

/// Appends its tag to the response's `encoded` array.
pub struct TagEncoder {
    pub tag: String,
    pub log: CallLog,
}

impl TagEncoder {
    pub fn new(tag: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            log: Arc::clone(log),
        })
    }
}

#[async_trait]
impl Encoder for TagEncoder {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        record(&self.log, format!("init:encoder:{}", self.tag));
        Ok(())
    }

    async fn encode_response(
        &self,
        _entry: &RegistryEntry,
        _url: &str,
        response: Payload,
        _request_headers: &HeaderMap,
        _response_headers: &mut HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<Payload, ExtensionError> {
        record(&self.log, format!("encode:{}", self.tag));
        let mut fields = match response {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        let encoded = fields
            .entry("encoded")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = encoded {
            items.push(Value::String(self.tag.clone()));
        }
        Ok(Value::Object(fields))
    }
}

/// Sets `x-tag-<tag>: seen`.
pub struct TagHeaderManager {
    pub tag: String,
    pub log: CallLog,
}

impl TagHeaderManager {
    pub fn new(tag: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            log: Arc::clone(log),
        })
    }
}

#[async_trait]
impl HeaderManager for TagHeaderManager {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        record(&self.log, format!("init:headermanager:{}", self.tag));
        Ok(())
    }

    #[allow(clippy::expect_used)]
    async fn inject_response_headers(
        &self,
        _entry: &RegistryEntry,
        _url: &str,
        _response: &Payload,
        _request_headers: &HeaderMap,
        response_headers: &mut HeaderMap,
        _ctx: &ServerContext,
        _request: &Payload,
    ) {
        record(&self.log, format!("headers:{}", self.tag));
        let name = axum::http::HeaderName::try_from(format!("x-tag-{}", self.tag))
            .expect("header name");
        response_headers.insert(name, HeaderValue::from_static("seen"));
    }
}

/// What a [`TagChecker`] does when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Reject,
    Panic,
}

/// Security checker with a fixed verdict that records every call.
pub struct TagChecker {
    pub tag: String,
    pub verdict: Verdict,
    pub log: CallLog,
}

impl TagChecker {
    pub fn new(tag: &str, verdict: Verdict, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            verdict,
            log: Arc::clone(log),
        })
    }
}

#[async_trait]
impl SecurityChecker for TagChecker {
    async fn initialize(&self, _table: &RegistryTable) -> Result<(), ExtensionError> {
        record(&self.log, format!("init:securitychecker:{}", self.tag));
        Ok(())
    }

    async fn check_security(
        &self,
        _entry: &RegistryEntry,
        _url: &str,
        _request: &Payload,
        _headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<(), SecurityRejection> {
        record(&self.log, format!("check:{}", self.tag));
        match self.verdict {
            Verdict::Pass => Ok(()),
            Verdict::Reject => Err(SecurityRejection::with_code(
                format!("{} says no", self.tag),
                401,
            )),
            Verdict::Panic => panic!("checker {} blew up", self.tag),
        }
    }
}

/// Backend returning a fixed payload, recording each call.
pub struct FixedBackend {
    pub response: Value,
    pub log: CallLog,
}

impl FixedBackend {
    pub fn new(response: Value, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            response,
            log: Arc::clone(log),
        })
    }
}

#[async_trait]
impl Backend for FixedBackend {
    async fn handle(
        &self,
        target: &str,
        _request: &Payload,
        _headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<Payload, BackendError> {
        record(&self.log, format!("backend:{target}"));
        Ok(self.response.clone())
    }
}

/// Builds an on-disk server root plus a booted registry.
pub struct GatewayBuilder {
    dir: TempDir,
    root: PathBuf,
    apps: Vec<App>,
    core_manifests: HashMap<ExtensionKind, Map<String, Value>>,
    app_manifests: HashMap<(String, ExtensionKind), Map<String, Value>>,
    extensions: ExtensionCatalog,
    token_config: TokenConfig,
    api_keys: Vec<String>,
}

impl GatewayBuilder {
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().join("server");
        std::fs::create_dir_all(root.join("conf")).expect("conf dir");
        let builder = Self {
            dir,
            root,
            apps: Vec::new(),
            core_manifests: HashMap::new(),
            app_manifests: HashMap::new(),
            extensions: ExtensionCatalog::new(),
            token_config: TokenConfig {
                expiry_interval: 10_000,
                ..TokenConfig::default()
            },
            api_keys: Vec::new(),
        };
        builder.core_registry(&json!({}))
    }

    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn core_registry(self, registry: &Value) -> Self {
        std::fs::write(
            self.root.join("conf").join(REGISTRY_FILE),
            registry.to_string(),
        )
        .expect("write core registry");
        self
    }

    /// Install an application with the given registry overlay.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn app(mut self, name: &str, registry: &Value) -> Self {
        let app = App::new(name, self.dir.path().join("apps").join(name));
        std::fs::create_dir_all(app.conf_dir()).expect("app conf dir");
        std::fs::write(app.conf_dir().join(REGISTRY_FILE), registry.to_string())
            .expect("write app registry");
        self.apps.push(app);
        self
    }

    /// Add `name: priority` to a core manifest.
    #[must_use]
    pub fn core_extension(mut self, kind: ExtensionKind, name: &str, priority: i64) -> Self {
        self.core_manifests
            .entry(kind)
            .or_default()
            .insert(name.to_string(), Value::from(priority));
        self
    }

    /// Add `name: priority` to an application's manifest.
    #[must_use]
    pub fn app_extension(
        mut self,
        app: &str,
        kind: ExtensionKind,
        name: &str,
        priority: i64,
    ) -> Self {
        self.app_manifests
            .entry((app.to_string(), kind))
            .or_default()
            .insert(name.to_string(), Value::from(priority));
        self
    }

    /// Run the token manager as security checker and header manager.
    #[must_use]
    pub fn with_token_manager(self) -> Self {
        self.core_extension(ExtensionKind::SecurityChecker, "tokenmanager", 10)
            .core_extension(ExtensionKind::HeaderManager, "tokenmanager", 10)
    }

    #[must_use]
    pub fn register(mut self, f: impl FnOnce(&mut ExtensionCatalog)) -> Self {
        f(&mut self.extensions);
        self
    }

    #[must_use]
    pub fn token_config(mut self, config: TokenConfig) -> Self {
        self.token_config = config;
        self
    }

    #[must_use]
    pub fn api_keys(mut self, keys: &[&str]) -> Self {
        self.api_keys = keys.iter().map(ToString::to_string).collect();
        self
    }

    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn build(self) -> TestGateway {
        self.try_build().expect("gateway should boot")
    }

    #[allow(clippy::expect_used)]
    pub fn try_build(mut self) -> Result<TestGateway, RegistryError> {
        for (kind, manifest) in &self.core_manifests {
            write_manifest(&self.root.join("conf"), *kind, manifest);
        }
        for ((app_name, kind), manifest) in &self.app_manifests {
            let app = self
                .apps
                .iter()
                .find(|app| &app.name == app_name)
                .expect("manifest for an installed app");
            write_manifest(&app.conf_dir(), *kind, manifest);
        }

        let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(SimulatedTimeSource::default_start());
        let tokens = TokenManager::new(store.clone(), clock.clone(), self.token_config.clone());
        let api_keys = ApiKeys::new(self.api_keys.clone()).expect("api keys");
        builtin::register_core(&mut self.extensions, &tokens, api_keys);

        let registry = runtime.block_on(ApiRegistry::initialize(
            RegistryOptions::new(&self.root),
            store.clone(),
            &StaticCatalog::new(self.apps.clone()),
            &self.extensions,
        ))?;

        Ok(TestGateway {
            runtime,
            root: self.root,
            apps: self.apps,
            store,
            clock,
            tokens,
            registry: Arc::new(registry),
            _dir: self.dir,
        })
    }
}

#[allow(clippy::expect_used)]
fn write_manifest(conf_dir: &std::path::Path, kind: ExtensionKind, manifest: &Map<String, Value>) {
    std::fs::create_dir_all(conf_dir).expect("conf dir");
    std::fs::write(
        conf_dir.join(format!("{}.json", kind.manifest_name())),
        Value::Object(manifest.clone()).to_string(),
    )
    .expect("write manifest");
}

/// Result of a request through the HTTP handler.
#[derive(Debug)]
pub struct HttpResult {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

/// A booted gateway over a temporary server root.
pub struct TestGateway {
    pub runtime: tokio::runtime::Runtime,
    pub root: PathBuf,
    pub apps: Vec<App>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<SimulatedTimeSource>,
    pub tokens: TokenManager,
    pub registry: Arc<ApiRegistry>,
    _dir: TempDir,
}

impl TestGateway {
    pub fn check_security(
        &self,
        url: &str,
        request: &Value,
        headers: &HeaderMap,
    ) -> Result<(), SecurityRejection> {
        self.runtime.block_on(self.registry.check_security(
            url,
            request,
            headers,
            &ServerContext::default(),
        ))
    }

    pub fn decode(&self, url: &str, data: Value) -> Result<Option<Value>, ExtensionError> {
        self.runtime.block_on(self.registry.decode(
            url,
            data,
            &HeaderMap::new(),
            &ServerContext::default(),
        ))
    }

    /// Send a request through the full HTTP pipeline.
    #[allow(clippy::expect_used)]
    pub fn send(
        &self,
        backend: Arc<dyn Backend>,
        method: &str,
        url: &str,
        headers: HeaderMap,
        body: Option<&Value>,
        timeout: Duration,
    ) -> HttpResult {
        let body = body.map_or_else(Body::empty, |body| Body::from(body.to_string()));
        let mut request = Request::builder()
            .method(method)
            .uri(url)
            .body(body)
            .expect("request");
        *request.headers_mut() = headers;

        let state = GatewayState {
            registry: Arc::clone(&self.registry),
            backend,
            request_timeout: timeout,
        };
        self.runtime.block_on(async move {
            let response = handle_request(State(state), request).await;
            let (parts, body) = response.into_parts();
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .expect("response body");
            let body = serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
            HttpResult {
                status: parts.status,
                headers: parts.headers,
                body,
            }
        })
    }

    /// `POST` with a JSON body and the default five second deadline.
    pub fn post(
        &self,
        backend: Arc<dyn Backend>,
        url: &str,
        headers: HeaderMap,
        body: &Value,
    ) -> HttpResult {
        self.send(backend, "POST", url, headers, Some(body), Duration::from_secs(5))
    }
}
