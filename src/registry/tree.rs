use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Command, CommandRegistry, RegistryError, Scope};

/// Longest command name the remote service accepts.
pub const MAX_NAME_LENGTH: usize = 32;

/// Snapshot of the command set pushed on sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub scope: Scope,
    pub synced_at: DateTime<Utc>,
    pub commands: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub description: String,
}

/// The remote half of the registry, implemented by the network client.
pub trait RemoteSink {
    fn push<'a>(&'a self, manifest: &'a Manifest) -> LocalBoxFuture<'a, anyhow::Result<()>>;
}

/// Sink that only logs what would have been pushed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RemoteSink for NullSink {
    fn push<'a>(&'a self, manifest: &'a Manifest) -> LocalBoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            info!(
                scope = %manifest.scope,
                commands = manifest.commands.len(),
                "Sync skipped: no remote sink configured"
            );
            Ok(())
        })
    }
}

/// Sink that writes the manifest as pretty JSON.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    path: PathBuf,
}

impl ManifestFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back a manifest written by this sink.
    pub fn read(&self) -> anyhow::Result<Manifest> {
        let json = std::fs::read_to_string(&self.path).context("Failed to read manifest")?;
        serde_json::from_str(&json).context("Failed to parse manifest")
    }
}

impl RemoteSink for ManifestFile {
    fn push<'a>(&'a self, manifest: &'a Manifest) -> LocalBoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let json =
                serde_json::to_string_pretty(manifest).context("Failed to serialize manifest")?;
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create manifest directory")?;
            }
            tokio::fs::write(&self.path, json)
                .await
                .context("Failed to write manifest")?;
            debug!(path = %self.path.display(), "Wrote command manifest");
            Ok(())
        })
    }
}

/// In-process command registry.
///
/// Commands keep their registration order; names are unique across the
/// whole tree.
pub struct CommandTree {
    commands: Vec<Command>,
    index: HashMap<String, usize>,
    sink: Box<dyn RemoteSink>,
    last_sync: HashMap<Scope, Manifest>,
}

impl CommandTree {
    pub fn new(sink: impl RemoteSink + 'static) -> Self {
        Self {
            commands: Vec::new(),
            index: HashMap::new(),
            sink: Box::new(sink),
            last_sync: HashMap::new(),
        }
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.index.get(name).map(|&i| &self.commands[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The `{name, description}` pairs currently registered.
    #[must_use]
    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.commands
            .iter()
            .map(|c| ManifestEntry {
                name: c.name.clone(),
                description: c.description.clone(),
            })
            .collect()
    }

    /// The manifest most recently pushed for `scope`.
    #[must_use]
    pub fn last_sync(&self, scope: &Scope) -> Option<&Manifest> {
        self.last_sync.get(scope)
    }

    /// Run a registered command.
    pub async fn invoke(&self, name: &str, args: Vec<String>) -> anyhow::Result<String> {
        let command = self
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        let callback = command.callback.clone();
        callback(args).await
    }

    async fn push(&mut self, scope: &Scope, commands: Vec<ManifestEntry>) -> Result<(), RegistryError> {
        let manifest = Manifest {
            scope: scope.clone(),
            synced_at: Utc::now(),
            commands,
        };
        self.sink
            .push(&manifest)
            .await
            .map_err(|source| RegistryError::Sync {
                scope: scope.clone(),
                source,
            })?;
        info!(scope = %scope, commands = manifest.commands.len(), "Synced commands");
        self.last_sync.insert(scope.clone(), manifest);
        Ok(())
    }
}

impl CommandRegistry for CommandTree {
    fn add_command(&mut self, command: Command) -> Result<(), RegistryError> {
        validate_name(&command.name)?;
        if self.index.contains_key(&command.name) {
            return Err(RegistryError::Duplicate(command.name));
        }
        debug!(name = %command.name, "Added command");
        self.index.insert(command.name.clone(), self.commands.len());
        self.commands.push(command);
        Ok(())
    }

    fn sync<'a>(&'a mut self, scope: &'a Scope) -> LocalBoxFuture<'a, Result<(), RegistryError>> {
        Box::pin(async move {
            let entries = self.entries();
            self.push(scope, entries).await
        })
    }

    /// Clearing the global scope drops every local command; a target scope
    /// only has its remote copy emptied.
    fn clear<'a>(&'a mut self, scope: &'a Scope) -> LocalBoxFuture<'a, Result<(), RegistryError>> {
        Box::pin(async move {
            if *scope == Scope::Global {
                self.commands.clear();
                self.index.clear();
            }
            self.push(scope, Vec::new()).await
        })
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.chars().count() > MAX_NAME_LENGTH {
        "name is longer than 32 characters"
    } else if name.chars().any(char::is_whitespace) {
        "name contains whitespace"
    } else {
        return Ok(());
    };
    Err(RegistryError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::callback;
    use tempfile::tempdir;

    fn command(name: &str, reply: &'static str) -> Command {
        Command {
            name: name.to_string(),
            description: format!("{name} command"),
            callback: callback(move |_args| async move { Ok(reply.to_string()) }),
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut tree = CommandTree::new(NullSink);
        tree.add_command(command("hello", "hi")).unwrap();
        let err = tree.add_command(command("hello", "again")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "hello"));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut tree = CommandTree::new(NullSink);
        assert!(tree.add_command(command("", "x")).is_err());
        assert!(tree.add_command(command("two words", "x")).is_err());
        assert!(tree.add_command(command(&"a".repeat(33), "x")).is_err());
        assert!(tree.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_runs_callback() {
        let mut tree = CommandTree::new(NullSink);
        tree.add_command(command("hello", "hi")).unwrap();
        assert_eq!(tree.invoke("hello", vec![]).await.unwrap(), "hi");
        assert!(tree.invoke("missing", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_writes_manifest() {
        let dir = tempdir().unwrap();
        let sink = ManifestFile::new(dir.path().join("out").join("commands.json"));
        let mut tree = CommandTree::new(sink.clone());
        tree.add_command(command("hello", "hi")).unwrap();
        tree.add_command(command("bye", "bye")).unwrap();

        tree.sync(&Scope::Global).await.unwrap();

        let manifest = sink.read().unwrap();
        assert_eq!(manifest.scope, Scope::Global);
        let names: Vec<_> = manifest.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["hello", "bye"]);
        assert!(tree.last_sync(&Scope::Global).is_some());
    }

    #[tokio::test]
    async fn test_clear_global_empties_tree() {
        let mut tree = CommandTree::new(NullSink);
        tree.add_command(command("hello", "hi")).unwrap();
        tree.clear(&Scope::Global).await.unwrap();
        assert!(tree.is_empty());
        assert!(tree.last_sync(&Scope::Global).unwrap().commands.is_empty());
    }
}
