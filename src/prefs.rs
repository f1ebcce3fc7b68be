//! Key-value prefs file: the engine's stand-in for the host platform's
//! player-prefs store. One JSON object on disk, string keys to string
//! values.

use std::{collections::HashMap, fs, path::PathBuf, sync::RwLock};

use anyhow::{Context, Result};

pub struct PrefsStore {
    path: PathBuf,
    data: RwLock<HashMap<String, String>>,
}

impl PrefsStore {
    /// Open or create the prefs file. Unreadable contents start fresh
    /// rather than failing the host.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prefs from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: String) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.insert(key.to_string(), value);
        self.persist(&guard)
    }

    fn persist(&self, data: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create prefs dir {}", parent.display()))?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write prefs to {}", self.path.display()))
    }
}
