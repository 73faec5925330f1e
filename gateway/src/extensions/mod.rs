//! Pluggable pipeline extensions.
//!
//! Extensions are registered by name in an [`ExtensionCatalog`] at startup.
//! Manifests then select which registered extensions run, and in what order,
//! for each of the four pipeline kinds.
//!
//! # Scopes
//! Core manifests resolve names in [`Scope::Core`]; an application's manifest
//! resolves names in that application's scope. Two scopes registering the same
//! name are distinct extensions, so an application cannot suppress a core
//! extension by reusing its name.

pub mod builtin;
pub mod loader;

use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::{Decoder, Encoder, ExtensionError, HeaderManager, SecurityChecker};
use crate::registry::RegistryTable;

pub use loader::{ExtensionDescriptor, LoadError, collect_descriptors, load_pipelines};

/// The four pipeline capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Decoder,
    Encoder,
    HeaderManager,
    SecurityChecker,
}

impl ExtensionKind {
    pub const ALL: [Self; 4] = [
        Self::Decoder,
        Self::Encoder,
        Self::HeaderManager,
        Self::SecurityChecker,
    ];

    /// Base name of the manifest file for this kind (`<name>.json`).
    #[must_use]
    pub const fn manifest_name(self) -> &'static str {
        match self {
            Self::Decoder => "decoders",
            Self::Encoder => "encoders",
            Self::HeaderManager => "headermanagers",
            Self::SecurityChecker => "securitycheckers",
        }
    }
}

impl std::fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.manifest_name())
    }
}

/// Where an extension name is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Core,
    App(String),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core => f.write_str("core"),
            Self::App(name) => write!(f, "app '{name}'"),
        }
    }
}

type Registrations<T> = HashMap<(Scope, String), Arc<T>>;

/// Name → handler registration table for every extension kind.
///
/// Names are case-insensitive; they are stored lowercased.
#[derive(Default)]
pub struct ExtensionCatalog {
    decoders: Registrations<dyn Decoder>,
    encoders: Registrations<dyn Encoder>,
    header_managers: Registrations<dyn HeaderManager>,
    security_checkers: Registrations<dyn SecurityChecker>,
}

impl ExtensionCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_decoder(
        &mut self,
        scope: Scope,
        name: &str,
        handler: Arc<dyn Decoder>,
    ) -> &mut Self {
        self.decoders.insert((scope, name.to_lowercase()), handler);
        self
    }

    pub fn register_encoder(
        &mut self,
        scope: Scope,
        name: &str,
        handler: Arc<dyn Encoder>,
    ) -> &mut Self {
        self.encoders.insert((scope, name.to_lowercase()), handler);
        self
    }

    pub fn register_header_manager(
        &mut self,
        scope: Scope,
        name: &str,
        handler: Arc<dyn HeaderManager>,
    ) -> &mut Self {
        self.header_managers
            .insert((scope, name.to_lowercase()), handler);
        self
    }

    pub fn register_security_checker(
        &mut self,
        scope: Scope,
        name: &str,
        handler: Arc<dyn SecurityChecker>,
    ) -> &mut Self {
        self.security_checkers
            .insert((scope, name.to_lowercase()), handler);
        self
    }

    pub(crate) const fn decoders(&self) -> &Registrations<dyn Decoder> {
        &self.decoders
    }

    pub(crate) const fn encoders(&self) -> &Registrations<dyn Encoder> {
        &self.encoders
    }

    pub(crate) const fn header_managers(&self) -> &Registrations<dyn HeaderManager> {
        &self.header_managers
    }

    pub(crate) const fn security_checkers(&self) -> &Registrations<dyn SecurityChecker> {
        &self.security_checkers
    }
}

/// An extension resolved from a manifest, ready to run.
pub struct LoadedExtension<T: ?Sized> {
    /// Diagnostic name (the lowercased manifest name).
    pub name: String,
    pub scope: Scope,
    pub priority: i64,
    pub handler: Arc<T>,
}

impl<T: ?Sized> std::fmt::Debug for LoadedExtension<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// The four ordered chains, each sorted ascending by priority.
#[derive(Debug, Default)]
pub struct Pipelines {
    pub decoders: Vec<LoadedExtension<dyn Decoder>>,
    pub encoders: Vec<LoadedExtension<dyn Encoder>>,
    pub header_managers: Vec<LoadedExtension<dyn HeaderManager>>,
    pub security_checkers: Vec<LoadedExtension<dyn SecurityChecker>>,
}

impl Pipelines {
    /// Run every extension's `initialize` hook.
    ///
    /// Order is fixed: decoders, security checkers, header managers, encoders.
    /// A handler that appears in several chains is initialized once per
    /// appearance, so hooks must be idempotent.
    pub async fn initialize(&self, table: &RegistryTable) -> Result<(), ExtensionError> {
        for ext in &self.decoders {
            ext.handler.initialize(table).await?;
        }
        for ext in &self.security_checkers {
            ext.handler.initialize(table).await?;
        }
        for ext in &self.header_managers {
            ext.handler.initialize(table).await?;
        }
        for ext in &self.encoders {
            ext.handler.initialize(table).await?;
        }
        Ok(())
    }

    /// Diagnostic names of one chain, in execution order.
    #[must_use]
    pub fn names(&self, kind: ExtensionKind) -> Vec<String> {
        fn names_of<T: ?Sized>(chain: &[LoadedExtension<T>]) -> Vec<String> {
            chain.iter().map(|ext| ext.name.clone()).collect()
        }
        match kind {
            ExtensionKind::Decoder => names_of(&self.decoders),
            ExtensionKind::Encoder => names_of(&self.encoders),
            ExtensionKind::HeaderManager => names_of(&self.header_managers),
            ExtensionKind::SecurityChecker => names_of(&self.security_checkers),
        }
    }
}
