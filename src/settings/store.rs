use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::{SettingsError, SettingsStore, Values};

type Document = BTreeMap<String, Values>;

/// Sections persisted as a YAML document of string maps.
///
/// The file is re-read before and rewritten after every access, so edits
/// made by an operator while the host runs are picked up.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSettings {
    /// Open (and create, if needed) the settings file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(&path, e))?;
        }
        if !path.exists() {
            fs::write(&path, "").map_err(|e| io_error(&path, e))?;
            debug!(path = %path.display(), "Created settings file");
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Document, SettingsError> {
        let contents = fs::read_to_string(&self.path).map_err(|e| io_error(&self.path, e))?;
        if contents.trim().is_empty() {
            return Ok(Document::new());
        }
        serde_yaml::from_str(&contents).map_err(|source| SettingsError::Format {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn write(&self, document: &Document) -> Result<(), SettingsError> {
        let contents = serde_yaml::to_string(document).map_err(|source| SettingsError::Format {
            path: self.path.display().to_string(),
            source,
        })?;
        fs::write(&self.path, contents).map_err(|e| io_error(&self.path, e))
    }
}

impl SettingsStore for FileSettings {
    fn load_section(&self, name: &str) -> Result<Values, SettingsError> {
        let _guard = self.lock.lock().map_err(|_| SettingsError::Poisoned)?;
        let mut document = self.read()?;
        if let Some(values) = document.get(name) {
            return Ok(values.clone());
        }
        document.insert(name.to_string(), Values::new());
        self.write(&document)?;
        debug!(path = %self.path.display(), section = %name, "Created settings section");
        Ok(Values::new())
    }

    fn store_section(&self, name: &str, values: &Values) -> Result<(), SettingsError> {
        let _guard = self.lock.lock().map_err(|_| SettingsError::Poisoned)?;
        let mut document = self.read()?;
        document.insert(name.to_string(), values.clone());
        self.write(&document)
    }
}

/// Sections kept in memory only.
#[derive(Debug, Default)]
pub struct MemorySettings {
    sections: Mutex<Document>,
}

impl MemorySettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every section that has been accessed.
    pub fn section_names(&self) -> Vec<String> {
        self.sections
            .lock()
            .map(|sections| sections.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl SettingsStore for MemorySettings {
    fn load_section(&self, name: &str) -> Result<Values, SettingsError> {
        let mut sections = self.sections.lock().map_err(|_| SettingsError::Poisoned)?;
        Ok(sections.entry(name.to_string()).or_default().clone())
    }

    fn store_section(&self, name: &str, values: &Values) -> Result<(), SettingsError> {
        let mut sections = self.sections.lock().map_err(|_| SettingsError::Poisoned)?;
        sections.insert(name.to_string(), values.clone());
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SettingsError {
    SettingsError::Io {
        path: path.display().to_string(),
        source,
    }
}
