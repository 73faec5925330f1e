//! Endpoint descriptors.
//!
//! A registry configuration maps each endpoint path to a raw descriptor of
//! the form `target` or `target?key=value&…`. The query part carries the
//! pipeline directives (`needsToken`, `addsToken`, `customSecurity`,
//! `checkClaims`, …).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

/// Placeholder replaced by the owning application's root directory.
pub const APP_PLACEHOLDER: &str = "{{app}}";
/// Placeholder replaced by the server root directory.
pub const SERVER_PLACEHOLDER: &str = "{{server}}";
/// Placeholder replaced by the server's `lib` directory.
pub const SERVER_LIB_PLACEHOLDER: &str = "{{server_lib}}";

/// The live routing table: endpoint path → descriptor.
pub type RegistryTable = BTreeMap<String, RegistryEntry>;

/// A parsed endpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Resource the endpoint is served by.
    pub target: String,
    /// Pipeline directives parsed from the descriptor's query string.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl RegistryEntry {
    /// Parse a raw `target?key=value&…` descriptor.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let (target, query) = match raw.split_once('?') {
            Some((target, query)) => (target, query),
            None => (raw, ""),
        };
        let query = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self {
            target: target.to_string(),
            query,
        }
    }

    /// Join a relative target against `root`. Absolute paths and upstream
    /// locators (`scheme://…`) are left untouched.
    #[must_use]
    pub fn resolved_against(mut self, root: &Path) -> Self {
        if !is_absolute_target(&self.target) {
            self.target = root.join(&self.target).to_string_lossy().into_owned();
        }
        self
    }

    /// Look up a pipeline directive.
    #[must_use]
    pub fn directive(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// A directive counts as enabled when present and not literally `"false"`.
    #[must_use]
    pub fn directive_enabled(&self, name: &str) -> bool {
        self.directive(name).is_some_and(|value| value != "false")
    }
}

/// Whether a target is already resolvable without a root.
#[must_use]
pub fn is_absolute_target(target: &str) -> bool {
    target.contains("://") || Path::new(target).is_absolute()
}

/// Replace the `{{app}}`, `{{server}}` and `{{server_lib}}` placeholders in
/// raw JSON text.
///
/// Replacements are JSON-string escaped, so paths containing quotes or
/// backslashes keep the document parseable.
#[must_use]
pub fn substitute_placeholders(text: &str, app_root: &Path, server_root: &Path) -> String {
    let server_lib = server_root.join("lib");
    text.replace(SERVER_LIB_PLACEHOLDER, &json_escape(&server_lib))
        .replace(SERVER_PLACEHOLDER, &json_escape(server_root))
        .replace(APP_PLACEHOLDER, &json_escape(app_root))
}

fn json_escape(path: &Path) -> String {
    let quoted = serde_json::Value::String(path.to_string_lossy().into_owned()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Extract the path component of a request URL.
///
/// Accepts absolute URLs (`http://host/path?q`) and origin-form targets
/// (`/path?q`). The path is returned verbatim, without percent-decoding.
#[must_use]
pub fn request_path(url: &str) -> String {
    if url.contains("://") {
        if let Ok(parsed) = url::Url::parse(url) {
            return parsed.path().to_string();
        }
    }
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_string()
}

/// Split a comma-separated directive value into trimmed, non-empty items.
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}
