//! Durable key/value settings store.
//!
//! The engine keeps policy overrides, ignored versions, snapshots and the
//! pending queue behind [`SettingsStore`]. Two implementations are provided:
//! [`MemoryStore`] for tests and agents without a state file, and
//! [`FileStore`], which persists a JSON object and replaces the file
//! atomically on every write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::error::{EngineError, Result};

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Reads and decodes a JSON value.
pub async fn get_json<T: DeserializeOwned>(store: &dyn SettingsStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a JSON value.
pub async fn set_json<T: Serialize + ?Sized>(store: &dyn SettingsStore, key: &str, value: &T) -> Result<()> {
    store.set(key, serde_json::to_string(value)?).await
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// JSON-file backed store. Writes go to `<path>.tmp` and are renamed over
/// the state file so a crash never leaves a truncated file behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("State file {} does not exist yet, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} settings from {}", values.len(), path.display());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    async fn flush(&self, values: &HashMap<String, String>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(values)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            EngineError::Store(format!("failed to replace {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl SettingsStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value);
        self.flush(&values).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        if values.remove(key).is_some() {
            self.flush(&values).await?;
        }
        Ok(())
    }
}
