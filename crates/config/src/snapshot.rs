//! Persisted copy of the last applied configuration
//!
//! The reconciler compares the effective configuration against this snapshot
//! to decide which side effects to re-apply.

use crate::config::ConfigError;
use crate::keyvalue::ConfigMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

/// Key/value set recorded after a reconciliation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub values: ConfigMap,
}

impl ConfigSnapshot {
    pub fn new(values: ConfigMap) -> Self {
        Self { values }
    }

    /// Load a snapshot; `Ok(None)` when none has been written yet
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(toml::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the snapshot via write-then-rename
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Keys added, removed or changed in `current` relative to this snapshot
    pub fn changed_keys(&self, current: &ConfigMap) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (key, value) in current {
            if self.values.get(key) != Some(value) {
                changed.insert(key.clone());
            }
        }
        for key in self.values.keys() {
            if !current.contains_key(key) {
                changed.insert(key.clone());
            }
        }
        changed
    }
}
