//! Claim templates for token issuance.
//!
//! An endpoint's `addsToken` directive is a comma-separated list of
//! `key:template` pairs, for example `sub:{{role}},uid:{{user.id}},flag:{{result}}`.
//! Each template is rendered against the response and against the request:
//! the response rendering wins when it is non-empty, otherwise the request
//! rendering is used. The reserved `flag` key never falls back to the request.

use serde_json::Value;

use super::token::{Claims, scalar_text};
use crate::registry::entry::split_list;

/// Claim key that gates issuance instead of carrying identity.
pub const FLAG_CLAIM: &str = "flag";

/// Render `{{path}}` placeholders against `data`.
///
/// Paths are dot-separated object keys. Strings are inserted verbatim, other
/// scalars in their JSON form; missing values, null, arrays and objects
/// render as the empty string.
#[must_use]
pub fn render(template: &str, data: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + 2 + len].trim();
        if let Some(text) = lookup(data, path).and_then(scalar_text) {
            out.push_str(&text);
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(data, |value, segment| value.get(segment))
}

/// Resolve one claim value with response-then-request precedence.
#[must_use]
pub fn resolve_claim(key: &str, template: &str, response: &Value, request: &Value) -> String {
    let from_response = render(template, response);
    if !from_response.is_empty() || key == FLAG_CLAIM {
        return from_response;
    }
    render(template, request)
}

/// Build the claim properties described by an `addsToken` directive.
///
/// Items without a `:` separator are ignored.
#[must_use]
pub fn claims_from_directive(directive: &str, response: &Value, request: &Value) -> Claims {
    split_list(directive)
        .filter_map(|item| item.split_once(':'))
        .map(|(key, template)| {
            let key = key.trim();
            (
                key.to_string(),
                Value::String(resolve_claim(key, template.trim(), response, request)),
            )
        })
        .collect()
}

/// Whether a rendered `flag` allows issuance.
///
/// Empty or `false` (any case) blocks issuance.
#[must_use]
pub fn flag_allows(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let s = s.trim();
            !s.is_empty() && !s.eq_ignore_ascii_case("false")
        }
        Value::Null => false,
        _ => true,
    }
}

/// Loose truthiness used when no `flag` is given: the response's `result`
/// must be truthy.
#[must_use]
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}
