//! Durable storage for link configurations.
//!
//! The registry hands the store the full configuration list after every
//! mutating operation; at process start the stored list is replayed
//! through the normal link construction path.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use portlink_config::LinkConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot resolve a home directory for the configuration file")]
    NoHomeDir,
}

/// Persistence collaborator for the link registry.
pub trait LinkStore: Send + Sync {
    /// Replace the stored configuration with `links`.
    fn save(&self, links: &[LinkConfig]) -> Result<(), StoreError>;

    /// Load the stored configuration; an absent store is an empty list.
    fn load(&self) -> Result<Vec<LinkConfig>, StoreError>;
}

/// JSON file store, by default at `~/.portlink/links.json`.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new() -> Result<Self, StoreError> {
        let dir = dirs::home_dir()
            .ok_or(StoreError::NoHomeDir)?
            .join(".portlink");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("links.json"),
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl LinkStore for JsonFileStore {
    fn save(&self, links: &[LinkConfig]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(links)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<LinkConfig>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// In-memory store for embedders that do not want persistence.
#[derive(Default)]
pub struct MemoryStore {
    links: Mutex<Vec<LinkConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkStore for MemoryStore {
    fn save(&self, links: &[LinkConfig]) -> Result<(), StoreError> {
        *self.links.lock().unwrap() = links.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<Vec<LinkConfig>, StoreError> {
        Ok(self.links.lock().unwrap().clone())
    }
}
