//! Seams to the container runtime and the registry.
//!
//! The engine only talks to Docker (or a Swarm manager) through these
//! traits; [`DockerRuntime`] implements all of them with bollard.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::ContainerInfo;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerLister: Send + Sync {
    /// Running containers and services with their labels.
    async fn list(&self) -> Result<Vec<ContainerInfo>>;

    /// Looks a single container or service up by name.
    async fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }
}

#[async_trait]
pub trait ImageMutator: Send + Sync {
    /// Pulls `target_image` and replaces the named container with one
    /// running it. On failure the previous container must still be running.
    async fn recreate_container(&self, name: &str, target_image: &str) -> Result<()>;

    /// Points a Swarm service at `target_image`.
    async fn update_service(&self, name: &str, target_image: &str) -> Result<()>;
}

/// Result of a registry check for one image reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub update_available: bool,
    /// Nearest first; empty for digest-only updates.
    pub newer_versions: Vec<String>,
    pub resolved_current_version: String,
    pub resolved_target_version: String,
    pub remote_digest: String,
}

#[async_trait]
pub trait RegistryChecker: Send + Sync {
    async fn check(&self, image_ref: &str) -> Result<CheckOutcome>;

    /// Check for one running container. Without newer tags, the digest the
    /// container reports decides, so a container on another host is judged
    /// by its own image rather than whatever this host has pulled.
    async fn check_container(&self, container: &ContainerInfo) -> Result<CheckOutcome> {
        let mut outcome = self.check(&container.image).await?;
        if outcome.newer_versions.is_empty()
            && !container.image_digest.is_empty()
            && !outcome.remote_digest.is_empty()
        {
            outcome.update_available = container.image_digest != outcome.remote_digest;
        }
        Ok(outcome)
    }
}
