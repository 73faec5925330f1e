//! Extensions shipped with the gateway.
//!
//! [`register_core`] registers all of them in [`Scope::Core`]; manifests
//! decide which actually run.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue};
use serde_json::{Map, Value};
use url::form_urlencoded;

use super::{ExtensionCatalog, Scope};
use crate::auth::manager::EXTENSION_NAME as TOKEN_MANAGER;
use crate::auth::{ApiKeys, TokenManager};
use crate::pipeline::{
    Decoder, Encoder, ExtensionError, Payload, SecurityChecker, SecurityRejection, ServerContext,
};
use crate::registry::RegistryEntry;

pub const API_KEY_CHECKER: &str = "apikeychecker";
pub const QUERY_PARAMS_DECODER: &str = "queryparams";
pub const JSON_ENCODER: &str = "jsonencoder";

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Register every built-in extension in the core scope.
pub fn register_core(catalog: &mut ExtensionCatalog, tokens: &TokenManager, api_keys: ApiKeys) {
    catalog
        .register_security_checker(Scope::Core, TOKEN_MANAGER, Arc::new(tokens.clone()))
        .register_header_manager(Scope::Core, TOKEN_MANAGER, Arc::new(tokens.clone()))
        .register_security_checker(
            Scope::Core,
            API_KEY_CHECKER,
            Arc::new(ApiKeyChecker::new(api_keys)),
        )
        .register_decoder(Scope::Core, QUERY_PARAMS_DECODER, Arc::new(QueryParamsDecoder))
        .register_encoder(Scope::Core, JSON_ENCODER, Arc::new(JsonEncoder));
}

/// Requires a known `x-api-key` on endpoints declaring `needsApiKey`.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyChecker {
    keys: ApiKeys,
}

impl ApiKeyChecker {
    #[must_use]
    pub const fn new(keys: ApiKeys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl SecurityChecker for ApiKeyChecker {
    async fn check_security(
        &self,
        entry: &RegistryEntry,
        url: &str,
        _request: &Payload,
        headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<(), SecurityRejection> {
        if !entry.directive_enabled("needsApiKey") {
            return Ok(());
        }
        let key = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| SecurityRejection::forbidden("API key missing"))?;
        if self.keys.contains(key) {
            Ok(())
        } else {
            tracing::debug!(url, "unknown API key");
            Err(SecurityRejection::forbidden("API key not accepted"))
        }
    }
}

/// Merges the URL's query parameters into an object payload.
///
/// Fields already present in the payload win. A null payload becomes an
/// object; any other non-object payload passes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryParamsDecoder;

#[async_trait]
impl Decoder for QueryParamsDecoder {
    async fn decode_incoming_data(
        &self,
        _entry: &RegistryEntry,
        url: &str,
        data: Payload,
        _headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<Payload, ExtensionError> {
        let Some((_, query)) = url.split_once('?') else {
            return Ok(data);
        };
        let query = query.split_once('#').map_or(query, |(query, _)| query);

        let mut fields = match data {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => return Ok(other),
        };
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            fields
                .entry(key.into_owned())
                .or_insert_with(|| Value::String(value.into_owned()));
        }
        Ok(Value::Object(fields))
    }
}

/// Marks responses as JSON unless an earlier stage chose a content type.
/// String responses are written raw and keep their text content type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

#[async_trait]
impl Encoder for JsonEncoder {
    async fn encode_response(
        &self,
        _entry: &RegistryEntry,
        _url: &str,
        response: Payload,
        _request_headers: &HeaderMap,
        response_headers: &mut HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<Payload, ExtensionError> {
        if !response.is_string() && !response_headers.contains_key(CONTENT_TYPE) {
            response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        Ok(response)
    }
}
