//! Persisted user settings.
//!
//! The store is an opaque key-value interface. The controller reads the
//! algorithm, mode, user bias and last quality level at startup and writes
//! them back on every user-driven change.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::adaptation::{AdaptationMode, Algorithm, UserBias};
use crate::error::SettingsError;
use crate::quality::QualityLevel;

pub const KEY_ALGORITHM: &str = "adaptation.algorithm";
pub const KEY_MODE: &str = "adaptation.mode";
pub const KEY_USER_BIAS: &str = "adaptation.user_bias";
pub const KEY_LEVEL: &str = "adaptation.current_level";

pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemorySettingsStore {
    values: HashMap<String, String>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Flat TOML table on disk, rewritten on every change.
#[derive(Debug)]
pub struct TomlFileSettingsStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl TomlFileSettingsStore {
    /// Open `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => toml::from_str(&text).map_err(|e| SettingsError::Parse(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(TomlFileSettingsStore { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlFileSettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), value.to_string());
        let text =
            toml::to_string(&self.values).map_err(|e| SettingsError::Parse(e.to_string()))?;
        fs::write(&self.path, text)?;
        Ok(())
    }
}

/// Settings recovered at startup. Missing or unreadable values are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedSettings {
    pub algorithm: Option<Algorithm>,
    pub mode: Option<AdaptationMode>,
    pub user_bias: Option<UserBias>,
    pub level: Option<QualityLevel>,
}

fn read<T>(store: &dyn SettingsStore, key: &str, parse: fn(&str) -> Option<T>) -> Option<T> {
    let raw = store.get(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring invalid persisted setting");
    }
    parsed
}

impl PersistedSettings {
    pub fn load(store: &dyn SettingsStore) -> Self {
        PersistedSettings {
            algorithm: read(store, KEY_ALGORITHM, Algorithm::parse),
            mode: read(store, KEY_MODE, AdaptationMode::parse),
            user_bias: read(store, KEY_USER_BIAS, UserBias::parse),
            level: read(store, KEY_LEVEL, QualityLevel::parse),
        }
    }
}
