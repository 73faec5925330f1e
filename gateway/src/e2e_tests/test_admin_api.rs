//! Runtime registration of endpoints through the registry's admin surface.

use serde_json::{Value, json};

use crate::e2e_tests::helpers::GatewayBuilder;
use crate::registry::{REGISTRY_FILE, RegistryError};

fn read_json(path: &std::path::Path) -> Value {
    let text = std::fs::read_to_string(path).expect("read registry file");
    serde_json::from_str(&text).expect("registry file is JSON")
}

#[test]
fn test_add_list_and_delete_core_endpoint() {
    let gateway = GatewayBuilder::new()
        .core_registry(&json!({"/existing": "/srv/existing"}))
        .build();

    gateway
        .runtime
        .block_on(gateway.registry.add_api("/added", "/srv/added?needsToken=true", None))
        .expect("add");

    assert_eq!(gateway.registry.list_apis(), vec!["/added", "/existing"]);
    assert_eq!(gateway.registry.resolve("/added?x=1").as_deref(), Some("/srv/added"));
    assert_eq!(
        gateway
            .registry
            .resolve_metadata("/added")
            .and_then(|query| query.get("needsToken").cloned())
            .as_deref(),
        Some("true")
    );

    let on_disk = read_json(&gateway.root.join("conf").join(REGISTRY_FILE));
    assert_eq!(on_disk["/added"], json!("/srv/added?needsToken=true"));
    assert_eq!(on_disk["/existing"], json!("/srv/existing"));

    let removed = gateway
        .runtime
        .block_on(gateway.registry.delete_api("/added", None))
        .expect("delete");
    assert!(removed);
    assert_eq!(gateway.registry.list_apis(), vec!["/existing"]);
    assert!(gateway.registry.resolve("/added").is_none());

    let on_disk = read_json(&gateway.root.join("conf").join(REGISTRY_FILE));
    assert!(on_disk.get("/added").is_none());
}

#[test]
fn test_edit_replaces_target() {
    let gateway = GatewayBuilder::new()
        .core_registry(&json!({"/thing": "/srv/old"}))
        .build();

    gateway
        .runtime
        .block_on(gateway.registry.edit_api("/thing", "/srv/new", None))
        .expect("edit");

    assert_eq!(gateway.registry.resolve("/thing").as_deref(), Some("/srv/new"));
    let on_disk = read_json(&gateway.root.join("conf").join(REGISTRY_FILE));
    assert_eq!(on_disk["/thing"], json!("/srv/new"));
}

#[test]
fn test_app_endpoint_resolves_against_app_root() {
    let gateway = GatewayBuilder::new().app("shop", &json!({})).build();
    let app = gateway.apps[0].clone();

    gateway
        .runtime
        .block_on(gateway.registry.add_api("/cart", "cart.json", Some("shop")))
        .expect("add");

    let expected = app.root.join("cart.json").to_string_lossy().into_owned();
    assert_eq!(gateway.registry.resolve("/cart"), Some(expected));

    let on_disk = read_json(&app.conf_dir().join(REGISTRY_FILE));
    assert_eq!(on_disk["/cart"], json!("cart.json"));
    // The core file is untouched.
    let core = read_json(&gateway.root.join("conf").join(REGISTRY_FILE));
    assert!(core.get("/cart").is_none());
}

#[test]
fn test_unknown_app_changes_nothing() {
    let gateway = GatewayBuilder::new().build();

    let result = gateway
        .runtime
        .block_on(gateway.registry.add_api("/ghost", "/srv/ghost", Some("nope")));
    assert!(matches!(result, Err(RegistryError::UnknownApp(name)) if name == "nope"));
    assert!(gateway.registry.list_apis().is_empty());
}

#[test]
fn test_delete_of_unknown_endpoint_reports_false() {
    let gateway = GatewayBuilder::new().build();

    let removed = gateway
        .runtime
        .block_on(gateway.registry.delete_api("/never", None))
        .expect("delete");
    assert!(!removed);
}

#[test]
fn test_live_table_is_shared_through_the_store() {
    let gateway = GatewayBuilder::new()
        .core_registry(&json!({"/a": "/srv/a"}))
        .build();
    gateway
        .runtime
        .block_on(gateway.registry.add_api("/b", "/srv/b", None))
        .expect("add");

    // A second worker booting on the same store sees the runtime addition
    // without reading the files.
    std::fs::write(gateway.root.join("conf").join(REGISTRY_FILE), "not json")
        .expect("clobber core file");
    let second = gateway
        .runtime
        .block_on(crate::registry::ApiRegistry::initialize(
            crate::registry::RegistryOptions::new(&gateway.root),
            gateway.store.clone(),
            &crate::apps::StaticCatalog::new(gateway.apps.clone()),
            &crate::extensions::ExtensionCatalog::new(),
        ))
        .expect("second worker boots from the store");
    assert_eq!(second.list_apis(), vec!["/a", "/b"]);
}
