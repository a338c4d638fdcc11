//! Destination for commands produced by the loader.
//!
//! The loader only needs [`CommandRegistry`]; [`CommandTree`] is the
//! in-process implementation that forwards synced manifests to a
//! [`RemoteSink`] owned by the network client.

mod tree;

pub use tree::{CommandTree, Manifest, ManifestEntry, ManifestFile, NullSink, RemoteSink};

use std::fmt;

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plugins::CommandCallback;

/// A command ready to be exposed to remote callers.
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub description: String,
    pub callback: CommandCallback,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("callback", &"<callback>")
            .finish()
    }
}

/// Where a sync or clear applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Global,
    /// A single remote target, such as one server or workspace.
    Target(String),
}

impl Scope {
    pub fn from_option(target: Option<String>) -> Self {
        target.map_or(Self::Global, Self::Target)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Target(target) => write!(f, "target:{target}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("command {0:?} is already registered")]
    Duplicate(String),

    #[error("invalid command name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("sync to {scope} failed: {source:#}")]
    Sync {
        scope: Scope,
        source: anyhow::Error,
    },
}

/// The command registry the loader submits into.
pub trait CommandRegistry {
    fn add_command(&mut self, command: Command) -> Result<(), RegistryError>;

    /// Push the registered commands to the remote service.
    fn sync<'a>(&'a mut self, scope: &'a Scope) -> LocalBoxFuture<'a, Result<(), RegistryError>>;

    /// Remove every command for `scope`, locally and remotely.
    fn clear<'a>(&'a mut self, scope: &'a Scope) -> LocalBoxFuture<'a, Result<(), RegistryError>>;
}
