use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::registry::Scope;

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory scanned for extensions, created if missing
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// File extension of extension modules
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Push the command set to the registry after loading
    #[serde(default = "default_true")]
    pub sync: bool,

    /// Sync target; the global scope when unset
    #[serde(default)]
    pub scope: Option<String>,

    /// Extra string arguments handed to every constructor
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// YAML file holding one section per extension
    #[serde(default = "default_settings_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Where synced command manifests are written
    #[serde(default = "default_manifest_path")]
    pub manifest: PathBuf,
}

fn default_directory() -> PathBuf {
    PathBuf::from("./extensions")
}

fn default_extension() -> String {
    "lua".to_string()
}

fn default_true() -> bool {
    true
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("./config/application.yaml")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("./config/commands.json")
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            extension: default_extension(),
            sync: true,
            scope: None,
            params: BTreeMap::new(),
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: default_settings_path(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest_path(),
        }
    }
}

impl LoaderConfig {
    pub fn scope(&self) -> Scope {
        Scope::from_option(self.scope.clone())
    }
}

impl Config {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .context("Failed to get home directory")?;

        Ok(home.join(".kiln").join("config.yaml"))
    }
}
