//! Pre-update image snapshots.
//!
//! A snapshot is written before the running container is replaced and is
//! never modified afterwards. Records are kept newest first per container.

use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{get_json, set_json, SettingsStore};
use crate::types::unix_now;

const SNAPSHOT_PREFIX: &str = "snapshots::";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub container: String,
    pub image: String,
    pub taken_at: u64,
}

#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn SettingsStore>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    fn key(name: &str) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, name)
    }

    /// Durably records `image` as the latest snapshot of `name`.
    pub async fn record(&self, name: &str, image: &str) -> Result<Snapshot> {
        let snapshot = Snapshot {
            container: name.to_string(),
            image: image.to_string(),
            taken_at: unix_now(),
        };
        let mut snapshots = self.list(name).await?;
        snapshots.insert(0, snapshot.clone());
        set_json(self.store.as_ref(), &Self::key(name), &snapshots).await?;
        debug!("Recorded snapshot of {} at {}", name, image);
        Ok(snapshot)
    }

    /// Newest first.
    pub async fn list(&self, name: &str) -> Result<Vec<Snapshot>> {
        Ok(get_json(self.store.as_ref(), &Self::key(name))
            .await?
            .unwrap_or_default())
    }

    pub async fn latest(&self, name: &str) -> Result<Option<Snapshot>> {
        Ok(self.list(name).await?.into_iter().next())
    }

    /// Keeps the newest `keep` records. Returns how many were dropped.
    pub async fn prune(&self, name: &str, keep: usize) -> Result<usize> {
        let mut snapshots = self.list(name).await?;
        if snapshots.len() <= keep {
            return Ok(0);
        }
        let dropped = snapshots.len() - keep;
        snapshots.truncate(keep);
        if snapshots.is_empty() {
            self.store.delete(&Self::key(name)).await?;
        } else {
            set_json(self.store.as_ref(), &Self::key(name), &snapshots).await?;
        }
        Ok(dropped)
    }
}
