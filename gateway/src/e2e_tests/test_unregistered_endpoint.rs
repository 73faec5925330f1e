//! Paths that are not in the registry never reach an extension.

use axum::http::{HeaderMap, StatusCode};
use serde_json::{Value, json};

use crate::e2e_tests::helpers::{
    FixedBackend, GatewayBuilder, TagChecker, TagDecoder, Verdict, calls, new_log,
};
use crate::extensions::{ExtensionKind, Scope};
use crate::pipeline::ServerContext;
use crate::registry::MISSING_ENDPOINT_REASON;

#[test]
fn test_unregistered_path_is_not_found_over_http() {
    let log = new_log();
    let gateway = GatewayBuilder::new()
        .core_registry(&json!({"/known": "/srv/known"}))
        .register(|catalog| {
            catalog
                .register_decoder(Scope::Core, "dec", TagDecoder::new("d", &log))
                .register_security_checker(
                    Scope::Core,
                    "sec",
                    TagChecker::new("s", Verdict::Pass, &log),
                );
        })
        .core_extension(ExtensionKind::Decoder, "dec", 1)
        .core_extension(ExtensionKind::SecurityChecker, "sec", 1)
        .build();
    let init_calls = calls(&log).len();

    let result = gateway.post(
        FixedBackend::new(json!({"result": true}), &log),
        "/unknown",
        HeaderMap::new(),
        &json!({}),
    );

    assert_eq!(result.status, StatusCode::NOT_FOUND);
    assert_eq!(result.body, json!({"error": MISSING_ENDPOINT_REASON}));
    assert_eq!(calls(&log).len(), init_calls);
}

#[test]
fn test_registry_operations_on_unregistered_path() {
    let log = new_log();
    let gateway = GatewayBuilder::new()
        .core_registry(&json!({"/known": "/srv/known"}))
        .register(|catalog| {
            catalog.register_decoder(Scope::Core, "dec", TagDecoder::new("d", &log));
        })
        .core_extension(ExtensionKind::Decoder, "dec", 1)
        .build();

    assert!(gateway.registry.resolve("/unknown").is_none());
    assert!(gateway.registry.resolve_metadata("/unknown").is_none());
    assert_eq!(gateway.decode("/unknown", json!({})).expect("decode"), None);

    let mut response_headers = HeaderMap::new();
    let encoded = gateway
        .runtime
        .block_on(gateway.registry.encode(
            "/unknown",
            json!({}),
            &HeaderMap::new(),
            &mut response_headers,
            &ServerContext::default(),
        ))
        .expect("encode");
    assert_eq!(encoded, None);

    let rejection = gateway
        .check_security("/unknown", &Value::Null, &HeaderMap::new())
        .expect_err("unregistered");
    assert_eq!(rejection.code, 403);
    assert_eq!(rejection.reason, MISSING_ENDPOINT_REASON);

    // Only the initialize hook ran.
    assert_eq!(calls(&log), vec!["init:decoder:d"]);
}

#[test]
fn test_query_string_does_not_affect_lookup() {
    let gateway = GatewayBuilder::new()
        .core_registry(&json!({"/known": "/srv/known"}))
        .build();

    assert_eq!(
        gateway.registry.resolve("/known?a=1&b=2").as_deref(),
        Some("/srv/known")
    );
    assert!(gateway.registry.resolve("/known/child").is_none());
}
