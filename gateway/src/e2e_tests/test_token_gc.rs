//! Expired tokens are announced exactly once, whether validation or the
//! sweep finds them first.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::auth::{TokenConfig, TokenEvent};
use crate::e2e_tests::helpers::{GatewayBuilder, TestGateway, bearer, claims};
use crate::registry::RegistryError;

type EventLog = Arc<Mutex<Vec<String>>>;

fn record_events(gateway: &TestGateway) -> EventLog {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _id = gateway.tokens.add_listener(Arc::new(move |event: &TokenEvent| {
        let line = match event {
            TokenEvent::Generated { claims, .. } => format!("generated:{}", claims["sub"]),
            TokenEvent::Expired { .. } => "expired".to_string(),
        };
        sink.lock().expect("events").push(line);
    }));
    events
}

fn events(log: &EventLog) -> Vec<String> {
    log.lock().expect("events").clone()
}

fn gateway() -> TestGateway {
    GatewayBuilder::new()
        .core_registry(&json!({"/profile": "/srv/profile?needsToken=true"}))
        .with_token_manager()
        .build()
}

#[test]
fn test_sweep_evicts_only_idle_tokens() {
    let gateway = gateway();
    let log = record_events(&gateway);

    let stale = gateway
        .tokens
        .create_signed_jwt_token(&claims(json!({"sub": "stale"})))
        .expect("issue stale");
    gateway.clock.advance(6_000);
    let fresh = gateway
        .tokens
        .create_signed_jwt_token(&claims(json!({"sub": "fresh"})))
        .expect("issue fresh");
    gateway.clock.advance(6_000);

    assert_eq!(gateway.tokens.sweep().expect("sweep"), 1);
    assert_eq!(events(&log), vec!["expired"]);

    assert!(gateway.tokens.validate(&stale).is_err());
    assert!(gateway.tokens.validate(&fresh).is_ok());

    // Nothing left to evict.
    assert_eq!(gateway.tokens.sweep().expect("sweep again"), 0);
    assert_eq!(events(&log), vec!["expired"]);
}

#[test]
fn test_expired_fires_once_when_validation_wins() {
    let gateway = gateway();
    let log = record_events(&gateway);

    let token = gateway
        .tokens
        .create_signed_jwt_token(&claims(json!({"sub": "alice"})))
        .expect("issue");
    gateway.clock.advance(10_001);

    assert!(
        gateway
            .check_security("/profile", &Value::Null, &bearer(&token))
            .is_err()
    );
    assert_eq!(gateway.tokens.sweep().expect("sweep"), 0);

    assert_eq!(events(&log), vec!["expired"]);
}

#[test]
fn test_expired_fires_once_when_sweep_wins() {
    let gateway = gateway();
    let log = record_events(&gateway);

    let token = gateway
        .tokens
        .create_signed_jwt_token(&claims(json!({"sub": "alice"})))
        .expect("issue");
    gateway.clock.advance(10_001);

    assert_eq!(gateway.tokens.sweep().expect("sweep"), 1);
    assert!(
        gateway
            .check_security("/profile", &Value::Null, &bearer(&token))
            .is_err()
    );

    assert_eq!(events(&log), vec!["expired"]);
}

#[test]
fn test_removed_listener_stops_receiving() {
    let gateway = gateway();
    let events_log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events_log);
    let id = gateway.tokens.add_listener(Arc::new(move |_: &TokenEvent| {
        sink.lock().expect("events").push("event".to_string());
    }));

    assert!(gateway.tokens.remove_listener(id));
    let _token = gateway
        .tokens
        .create_signed_jwt_token(&claims(json!({"sub": "alice"})))
        .expect("issue");
    gateway.clock.advance(10_001);
    assert_eq!(gateway.tokens.sweep().expect("sweep"), 1);

    assert!(events(&events_log).is_empty());
}

#[test]
fn test_zero_sweep_interval_fails_boot() {
    let result = GatewayBuilder::new()
        .core_registry(&json!({"/profile": "/srv/profile?needsToken=true"}))
        .token_config(TokenConfig {
            token_gc_interval: 0,
            ..TokenConfig::default()
        })
        .with_token_manager()
        .try_build();

    match result {
        Err(RegistryError::Extension(e)) => {
            assert!(e.to_string().contains("tokenGCInterval"));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("gateway booted with a zero sweep interval"),
    }
}
