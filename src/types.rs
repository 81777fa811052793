//! Data structures shared across the update engine.
//!
//! These types are serialised using [`serde`](https://serde.rs/) so they can
//! be persisted in the settings store and exchanged with cluster agents.
//! Queue keys are built from a host ID and a container name joined by
//! [`KEY_SEPARATOR`]; local containers have an empty host ID and their key is
//! the bare name.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::runtime::CheckOutcome;

/// Literal separator between host ID and container name.
pub const KEY_SEPARATOR: &str = "::";

/// Builds the composite identity `hostID::name`, or the bare name for local
/// containers.
pub fn composite_key(host_id: &str, name: &str) -> String {
    if host_id.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", host_id, KEY_SEPARATOR, name)
    }
}

/// Splits a composite key into `(host_id, name)`.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once(KEY_SEPARATOR) {
        Some((host, name)) => (host, name),
        None => ("", key),
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Whether the target is a plain container or a Swarm service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    #[default]
    Container,
    Service,
}

/// A container or service as reported by a lister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: ContainerKind,
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Empty for containers managed by this instance.
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub state: String,
    /// Registry digest (`sha256:...`) of the image the container is running.
    /// Empty when the runtime does not know it.
    #[serde(default)]
    pub image_digest: String,
}

impl ContainerInfo {
    pub fn key(&self) -> String {
        composite_key(&self.host_id, &self.name)
    }

    pub fn is_remote(&self) -> bool {
        !self.host_id.is_empty()
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// A queued fact: a newer image exists for a container or service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub container_id: String,
    pub container_name: String,
    #[serde(default)]
    pub kind: ContainerKind,
    #[serde(default)]
    pub host_id: String,
    pub current_image: String,
    /// Nearest first. Empty means a digest-only update.
    #[serde(default)]
    pub newer_versions: Vec<String>,
    #[serde(default)]
    pub resolved_current_version: String,
    #[serde(default)]
    pub resolved_target_version: String,
    #[serde(default)]
    pub remote_digest: String,
    #[serde(default)]
    pub detected_at: u64,
}

impl PendingUpdate {
    pub fn from_check(container: &ContainerInfo, outcome: CheckOutcome) -> Self {
        Self {
            container_id: container.id.clone(),
            container_name: container.name.clone(),
            kind: container.kind,
            host_id: container.host_id.clone(),
            current_image: container.image.clone(),
            newer_versions: outcome.newer_versions,
            resolved_current_version: outcome.resolved_current_version,
            resolved_target_version: outcome.resolved_target_version,
            remote_digest: outcome.remote_digest,
            detected_at: unix_now(),
        }
    }

    pub fn key(&self) -> String {
        composite_key(&self.host_id, &self.container_name)
    }

    pub fn is_digest_only(&self) -> bool {
        self.newer_versions.is_empty()
    }

    /// The image the update moves to: the current reference retagged with
    /// the nearest newer version, or the unchanged reference for a
    /// digest-only pull.
    pub fn target_image(&self) -> String {
        match self.newer_versions.first() {
            Some(version) => replace_tag(&self.current_image, version),
            None => self.current_image.clone(),
        }
    }
}

/// Strips any `@digest` suffix and `:tag` from an image reference.
pub fn image_repository(image: &str) -> &str {
    let without_digest = image.split_once('@').map_or(image, |(repo, _)| repo);
    let name_start = without_digest.rfind('/').map_or(0, |i| i + 1);
    match without_digest[name_start..].rfind(':') {
        Some(colon) => &without_digest[..name_start + colon],
        None => without_digest,
    }
}

/// Returns the tag of an image reference, if it carries one.
pub fn image_tag(image: &str) -> Option<&str> {
    let without_digest = image.split_once('@').map_or(image, |(repo, _)| repo);
    let repo = image_repository(without_digest);
    without_digest
        .strip_prefix(repo)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|tag| !tag.is_empty())
}

/// Substitutes `tag` on `image`, keeping registry host and port intact.
pub fn replace_tag(image: &str, tag: &str) -> String {
    format!("{}:{}", image_repository(image), tag)
}
