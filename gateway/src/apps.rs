//! Application catalog.
//!
//! Resolves the installed applications as `name → root directory` pairs. The
//! catalog order is significant: registry overlays from later applications
//! override earlier ones, and extension ties are broken in catalog order.

use std::path::{Path, PathBuf};

/// An installed application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    /// Application name, unique within a catalog.
    pub name: String,
    /// Root directory of the application.
    pub root: PathBuf,
}

impl App {
    #[must_use]
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Directory holding the application's configuration overlays.
    #[must_use]
    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }
}

/// Error returned when the catalog cannot be enumerated.
#[derive(Debug)]
pub enum CatalogError {
    /// The applications directory could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read applications directory {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
        }
    }
}

/// Source of the installed application list.
pub trait AppCatalog: Send + Sync {
    /// List the installed applications in catalog order.
    fn apps(&self) -> Result<Vec<App>, CatalogError>;
}

/// A fixed list of applications.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    apps: Vec<App>,
}

impl StaticCatalog {
    #[must_use]
    pub const fn new(apps: Vec<App>) -> Self {
        Self { apps }
    }
}

impl AppCatalog for StaticCatalog {
    fn apps(&self) -> Result<Vec<App>, CatalogError> {
        Ok(self.apps.clone())
    }
}

/// Treats every sub-directory of a directory as an application.
///
/// Applications are returned sorted by name. A missing directory yields an
/// empty catalog.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    directory: PathBuf,
}

impl DirectoryCatalog {
    #[must_use]
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }
}

impl AppCatalog for DirectoryCatalog {
    fn apps(&self) -> Result<Vec<App>, CatalogError> {
        let read_dir = match std::fs::read_dir(&self.directory) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CatalogError::Io {
                    path: self.directory.clone(),
                    source,
                });
            }
        };

        let mut apps = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|source| CatalogError::Io {
                path: self.directory.clone(),
                source,
            })?;
            let path = dir_entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                apps.push(App::new(name, &path));
            }
        }
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }
}
