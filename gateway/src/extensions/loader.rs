//! Extension manifest loading.
//!
//! Each pipeline kind has a core manifest (`<conf>/<kind>.json`) and an
//! optional manifest per application (`<app>/conf/<kind>.json`). A manifest
//! maps extension names to integer priorities:
//!
//! ```json
//! { "tokenmanager": 10, "apikeychecker": 20 }
//! ```
//!
//! All manifests of a kind are concatenated into one flat list (core first,
//! then applications in catalog order, each in file order) and stably sorted
//! by priority. Priority is a single integer space shared by core and every
//! application; deployments reserve ranges by convention (core uses 0–99).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{ExtensionCatalog, ExtensionKind, LoadedExtension, Pipelines, Scope};
use crate::apps::App;

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDescriptor {
    /// Lowercased extension name.
    pub name: String,
    pub scope: Scope,
    pub priority: i64,
}

/// Errors raised while building the pipelines at boot.
#[derive(Debug)]
pub enum LoadError {
    /// A manifest exists but could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A manifest is not valid JSON.
    MalformedManifest {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// A manifest is valid JSON but not a name → integer mapping.
    InvalidManifest { path: PathBuf, reason: String },
    /// A manifest names an extension nobody registered.
    NotRegistered {
        kind: ExtensionKind,
        scope: Scope,
        name: String,
    },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read manifest {}: {source}", path.display())
            }
            Self::MalformedManifest { path, source } => {
                write!(f, "malformed manifest {}: {source}", path.display())
            }
            Self::InvalidManifest { path, reason } => {
                write!(f, "invalid manifest {}: {reason}", path.display())
            }
            Self::NotRegistered { kind, scope, name } => {
                write!(f, "{kind} extension '{name}' is not registered in {scope}")
            }
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::MalformedManifest { source, .. } => Some(source),
            Self::InvalidManifest { .. } | Self::NotRegistered { .. } => None,
        }
    }
}

/// Collect and priority-sort the descriptors of one kind.
pub fn collect_descriptors(
    kind: ExtensionKind,
    core_conf_dir: &Path,
    apps: &[App],
) -> Result<Vec<ExtensionDescriptor>, LoadError> {
    let file_name = format!("{}.json", kind.manifest_name());

    let mut sources = vec![(core_conf_dir.join(&file_name), Scope::Core)];
    for app in apps {
        sources.push((app.conf_dir().join(&file_name), Scope::App(app.name.clone())));
    }

    let mut descriptors = Vec::new();
    for (path, scope) in sources {
        if let Some(entries) = read_manifest(&path, &scope)? {
            descriptors.extend(entries);
        }
    }

    // Stable: equal priorities keep discovery order.
    descriptors.sort_by_key(|d| d.priority);
    Ok(descriptors)
}

/// Build all four chains from the manifests under `core_conf_dir` and each
/// application's `conf/` directory.
pub fn load_pipelines(
    core_conf_dir: &Path,
    apps: &[App],
    catalog: &ExtensionCatalog,
) -> Result<Pipelines, LoadError> {
    Ok(Pipelines {
        decoders: resolve(
            ExtensionKind::Decoder,
            catalog.decoders(),
            collect_descriptors(ExtensionKind::Decoder, core_conf_dir, apps)?,
        )?,
        encoders: resolve(
            ExtensionKind::Encoder,
            catalog.encoders(),
            collect_descriptors(ExtensionKind::Encoder, core_conf_dir, apps)?,
        )?,
        header_managers: resolve(
            ExtensionKind::HeaderManager,
            catalog.header_managers(),
            collect_descriptors(ExtensionKind::HeaderManager, core_conf_dir, apps)?,
        )?,
        security_checkers: resolve(
            ExtensionKind::SecurityChecker,
            catalog.security_checkers(),
            collect_descriptors(ExtensionKind::SecurityChecker, core_conf_dir, apps)?,
        )?,
    })
}

#[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
fn resolve<T: ?Sized>(
    kind: ExtensionKind,
    registrations: &HashMap<(Scope, String), Arc<T>>,
    descriptors: Vec<ExtensionDescriptor>,
) -> Result<Vec<LoadedExtension<T>>, LoadError> {
    descriptors
        .into_iter()
        .map(|descriptor| {
            let key = (descriptor.scope, descriptor.name);
            let Some(handler) = registrations.get(&key) else {
                let (scope, name) = key;
                return Err(LoadError::NotRegistered { kind, scope, name });
            };
            let (scope, name) = key;
            Ok(LoadedExtension {
                name,
                scope,
                priority: descriptor.priority,
                handler: Arc::clone(handler),
            })
        })
        .collect()
}

/// Read one manifest. A missing file is not an error.
fn read_manifest(
    path: &Path,
    scope: &Scope,
) -> Result<Option<Vec<ExtensionDescriptor>>, LoadError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let entries: Map<String, Value> =
        serde_json::from_str(&text).map_err(|source| LoadError::MalformedManifest {
            path: path.to_path_buf(),
            source,
        })?;

    entries
        .into_iter()
        .map(|(name, priority)| {
            let priority = priority.as_i64().ok_or_else(|| LoadError::InvalidManifest {
                path: path.to_path_buf(),
                reason: format!("priority of '{name}' must be an integer"),
            })?;
            Ok(ExtensionDescriptor {
                name: name.to_lowercase(),
                scope: scope.clone(),
                priority,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
