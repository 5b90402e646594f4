//! Process registry: service name -> {port, pid, log path, started_at}.
//!
//! Owned by the lifecycle controller and persisted as `registry.json` in the log
//! directory so a later `status` can show what an earlier `start` launched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const REGISTRY_FILE: &str = "registry.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub port: u16,
    /// None for docker-managed services.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub container: Option<String>,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Started without its requirements, with the degraded environment overlay.
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProcessRegistry {
    #[serde(default)]
    entries: BTreeMap<String, RegistryEntry>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl ProcessRegistry {
    /// In-memory registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `<dir>/registry.json`, or start empty. A corrupt file is replaced on next save.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(REGISTRY_FILE);
        let mut registry = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<ProcessRegistry>(&content) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "process registry unreadable; starting empty");
                    ProcessRegistry::default()
                }
            },
            Err(_) => ProcessRegistry::default(),
        };
        registry.path = Some(path);
        registry
    }

    pub fn record(&mut self, name: &str, entry: RegistryEntry) {
        self.entries.insert(name.to_string(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<RegistryEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, content)
    }
}
