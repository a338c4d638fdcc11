use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::LoadError;

/// Containment level at which a failure was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Directory,
    File,
    Class,
    Handler,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Directory => "directory",
            Self::File => "file",
            Self::Class => "class",
            Self::Handler => "handler",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub boundary: Boundary,
    /// Directory, file, type or `Type.method` that failed.
    pub subject: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredEntry {
    pub module: String,
    pub extension: String,
    pub name: String,
    pub description: String,
}

/// Outcome of one load pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub registered: Vec<RegisteredEntry>,
    pub failures: Vec<Failure>,
}

impl LoadReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a contained failure and log it as a warning.
    pub fn fail(&mut self, boundary: Boundary, subject: impl Into<String>, error: &LoadError) {
        let subject = subject.into();
        warn!(%boundary, subject = %subject, "Failed to load extension: {error}");
        self.push(boundary, subject, error);
    }

    /// Record a type that was passed over by the capability check.
    pub fn reject(&mut self, subject: impl Into<String>, error: &LoadError) {
        let subject = subject.into();
        debug!(subject = %subject, "Skipping type: {error}");
        self.push(Boundary::Class, subject, error);
    }

    fn push(&mut self, boundary: Boundary, subject: String, error: &LoadError) {
        self.failures.push(Failure {
            boundary,
            subject,
            error: error.to_string(),
        });
    }

    pub fn register(&mut self, entry: RegisteredEntry) {
        debug!(
            module = %entry.module,
            extension = %entry.extension,
            command = %entry.name,
            "Registered command"
        );
        self.registered.push(entry);
    }

    /// `(name, description)` of every registered command, in order.
    pub fn commands(&self) -> Vec<(&str, &str)> {
        self.registered
            .iter()
            .map(|e| (e.name.as_str(), e.description.as_str()))
            .collect()
    }

    pub fn failures_at(&self, boundary: Boundary) -> impl Iterator<Item = &Failure> {
        self.failures.iter().filter(move |f| f.boundary == boundary)
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn extend(&mut self, other: LoadReport) {
        self.registered.extend(other.registered);
        self.failures.extend(other.failures);
    }
}
