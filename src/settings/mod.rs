//! Per-extension configuration sections.
//!
//! A [`SettingsStore`] persists string maps keyed by section name. The loader
//! hands each extension constructor a [`Section`] bound to the extension's
//! type name; sections are created empty on first access, so looking one up
//! never fails with "not found".

mod store;

pub use store::{FileSettings, MemorySettings};

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

/// Values stored in one section.
pub type Values = BTreeMap<String, String>;

const TRUTHY: &[&str] = &["1", "true", "yes", "y"];
const FALSY: &[&str] = &["0", "false", "no", "n"];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{section}:{key}: missing value")]
    Missing { section: String, key: String },

    #[error("{section}:{key}: invalid value {value:?}: {reason}")]
    Invalid {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {path} is malformed: {source}")]
    Format {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("settings store is poisoned")]
    Poisoned,
}

/// Backing storage for configuration sections.
pub trait SettingsStore: Send + Sync {
    /// Read the current contents of a section. Unknown sections are empty.
    fn load_section(&self, name: &str) -> Result<Values, SettingsError>;

    /// Replace the contents of a section.
    fn store_section(&self, name: &str, values: &Values) -> Result<(), SettingsError>;
}

/// A mutable view of one named section.
///
/// Every mutation re-reads the section, applies the change and persists it.
pub struct Section {
    name: String,
    values: Values,
    store: Arc<dyn SettingsStore>,
}

impl Section {
    /// Open the section `name`, creating it if absent.
    pub fn open(store: Arc<dyn SettingsStore>, name: &str) -> Result<Self, SettingsError> {
        let values = store.load_section(name)?;
        debug!(section = %name, keys = values.len(), "Opened settings section");
        Ok(Self {
            name: name.to_string(),
            values,
            store,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Snapshot of the current values.
    #[must_use]
    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), SettingsError> {
        let value = value.into();
        self.modify(|values| {
            values.insert(key.to_string(), value);
        })?;
        debug!(section = %self.name, key, "SET");
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<String>, SettingsError> {
        let mut removed = None;
        self.modify(|values| removed = values.remove(key))?;
        debug!(section = %self.name, key, "DEL");
        Ok(removed)
    }

    /// Merge `updates` into the section in a single persist, skipping the
    /// write entirely when nothing changed.
    pub fn merge(&mut self, updates: Values) -> Result<bool, SettingsError> {
        let changed = updates
            .iter()
            .any(|(k, v)| self.values.get(k) != Some(v));
        if !changed {
            return Ok(false);
        }
        self.modify(|values| values.extend(updates))?;
        Ok(true)
    }

    /// A non-empty string value.
    ///
    /// A missing key is created with an empty value so it shows up in the
    /// settings file for the operator to fill in.
    pub fn get_string(&mut self, key: &str) -> Result<String, SettingsError> {
        match self.values.get(key) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            Some(_) => Err(self.missing(key)),
            None => {
                self.set(key, String::new())?;
                Err(self.missing(key))
            }
        }
    }

    pub fn get_bool(&mut self, key: &str) -> Result<bool, SettingsError> {
        let raw = self.get_string(key)?;
        let lowered = raw.to_lowercase();
        if TRUTHY.contains(&lowered.as_str()) {
            Ok(true)
        } else if FALSY.contains(&lowered.as_str()) {
            Ok(false)
        } else {
            Err(self.invalid(key, raw, "expected a boolean".to_string()))
        }
    }

    pub fn get_integer(&mut self, key: &str) -> Result<i64, SettingsError> {
        let raw = self.get_string(key)?;
        raw.trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| self.invalid(key, raw.clone(), e.to_string()))
    }

    pub fn get_float(&mut self, key: &str) -> Result<f64, SettingsError> {
        let raw = self.get_string(key)?;
        raw.trim()
            .parse()
            .map_err(|e: std::num::ParseFloatError| self.invalid(key, raw.clone(), e.to_string()))
    }

    /// Stored as `true` or `false`, which [`Section::get_bool`] reads back.
    pub fn set_bool(&mut self, key: &str, value: bool) -> Result<(), SettingsError> {
        self.set(key, value.to_string())
    }

    pub fn set_integer(&mut self, key: &str, value: i64) -> Result<(), SettingsError> {
        self.set(key, value.to_string())
    }

    pub fn set_float(&mut self, key: &str, value: f64) -> Result<(), SettingsError> {
        self.set(key, value.to_string())
    }

    fn modify(&mut self, apply: impl FnOnce(&mut Values)) -> Result<(), SettingsError> {
        let mut values = self.store.load_section(&self.name)?;
        apply(&mut values);
        self.store.store_section(&self.name, &values)?;
        self.values = values;
        Ok(())
    }

    fn missing(&self, key: &str) -> SettingsError {
        SettingsError::Missing {
            section: self.name.clone(),
            key: key.to_string(),
        }
    }

    fn invalid(&self, key: &str, value: String, reason: String) -> SettingsError {
        SettingsError::Invalid {
            section: self.name.clone(),
            key: key.to_string(),
            value,
            reason,
        }
    }
}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("name", &self.name)
            .field("values", &self.values)
            .finish()
    }
}
