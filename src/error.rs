//! Error types shared across the loader pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::RegistryError;
use crate::settings::SettingsError;

/// Returned by a load pass that was stopped by its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("extension load cancelled")]
pub struct Cancelled;

/// Errors raised while turning a source file into an extension module.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error in module source: {0}")]
    Lua(#[from] mlua::Error),

    #[error("module must return a table of extension types, got {0}")]
    NotARegistry(String),

    #[error("failed to load library: {0}")]
    Library(#[from] libloading::Error),

    #[error("library does not export `{0}`")]
    MissingEntryPoint(&'static str),

    #[error("library was built against extension ABI {found}, host expects {expected}")]
    AbiMismatch { expected: u32, found: u32 },

    #[error("module panicked during registration: {0}")]
    Panicked(String),
}

/// A failure at one stage of the pipeline.
///
/// Every variant except [`LoadError::Cancelled`] is contained at the boundary
/// that produced it.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("extension load cancelled")]
    Cancelled,

    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no resolver handles *.{0} files")]
    NoResolver(String),

    #[error("{file}: {source}")]
    Resolve {
        file: String,
        #[source]
        source: ResolveError,
    },

    #[error("{name} does not satisfy the extension capability: {reason}")]
    Capability { name: String, reason: String },

    #[error("{name}: initialization failed: {source:#}")]
    Construct { name: String, source: anyhow::Error },

    #[error("{source_tag}: {error:#}")]
    Setup {
        source_tag: String,
        error: anyhow::Error,
    },

    #[error("{name}: handler discovery failed: {error:#}")]
    Handlers { name: String, error: anyhow::Error },

    #[error("{qualified}: {source}")]
    Register {
        qualified: String,
        #[source]
        source: RegistryError,
    },

    #[error("{subject} panicked: {message}")]
    Panicked { subject: String, message: String },

    #[error("registry sync failed: {0}")]
    Sync(#[source] RegistryError),

    #[error("{name}: {source}")]
    Settings {
        name: String,
        #[source]
        source: SettingsError,
    },
}

impl LoadError {
    /// Whether this error must abort the whole pass.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<Cancelled> for LoadError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}
