//! Per-container update policy.
//!
//! Precedence, highest first: an operator override stored in the settings
//! store, the `sentinel.policy` label, the global default. Label values that
//! do not parse resolve to [`Policy::Manual`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::store::{get_json, set_json, SettingsStore};
use crate::types::ContainerInfo;

pub const POLICY_LABEL: &str = "sentinel.policy";

const OVERRIDE_PREFIX: &str = "policy::";
const IGNORED_PREFIX: &str = "ignored::";
const DEFAULT_POLICY_KEY: &str = "default_policy";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Apply as soon as a check finds a newer, non-ignored image.
    Auto,
    /// Queue for approval.
    #[default]
    Manual,
    /// Never updated by a scan; explicit updates are still allowed.
    Pinned,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Auto => "auto",
            Policy::Manual => "manual",
            Policy::Pinned => "pinned",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Policy::Auto),
            "manual" => Ok(Policy::Manual),
            "pinned" => Ok(Policy::Pinned),
            other => Err(EngineError::validation(
                "policy",
                format!("`{}` is not one of auto, manual, pinned", other),
            )),
        }
    }
}

/// What happens to a container's override after it has been rolled back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// Leave the override untouched.
    #[serde(rename = "none")]
    Unchanged,
    #[default]
    Manual,
    Pinned,
}

impl RollbackPolicy {
    pub fn override_policy(&self) -> Option<Policy> {
        match self {
            RollbackPolicy::Unchanged => None,
            RollbackPolicy::Manual => Some(Policy::Manual),
            RollbackPolicy::Pinned => Some(Policy::Pinned),
        }
    }
}

/// Resolves the effective policy. Pure.
pub fn resolve(
    name: &str,
    labels: &HashMap<String, String>,
    override_policy: Option<Policy>,
    default: Policy,
) -> Policy {
    if let Some(policy) = override_policy {
        return policy;
    }
    match labels.get(POLICY_LABEL) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(
                "Container {} has unknown {} value `{}`, treating as manual",
                name, POLICY_LABEL, value
            );
            Policy::Manual
        }),
        None => default,
    }
}

/// Override, default-policy and ignored-version bookkeeping on top of the
/// settings store.
#[derive(Clone)]
pub struct PolicyStore {
    store: Arc<dyn SettingsStore>,
}

impl PolicyStore {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub async fn get_override(&self, key: &str) -> Result<Option<Policy>> {
        let raw = self.store.get(&format!("{}{}", OVERRIDE_PREFIX, key)).await?;
        Ok(raw.map(|value| {
            value.parse().unwrap_or_else(|_| {
                warn!("Stored override for {} is invalid (`{}`), treating as manual", key, value);
                Policy::Manual
            })
        }))
    }

    pub async fn set_override(&self, key: &str, policy: Policy) -> Result<()> {
        self.store
            .set(&format!("{}{}", OVERRIDE_PREFIX, key), policy.as_str().to_string())
            .await
    }

    /// Validates an operator-supplied value before storing it.
    pub async fn set_override_str(&self, key: &str, value: &str) -> Result<Policy> {
        let policy: Policy = value.parse()?;
        self.set_override(key, policy).await?;
        Ok(policy)
    }

    pub async fn clear_override(&self, key: &str) -> Result<()> {
        self.store.delete(&format!("{}{}", OVERRIDE_PREFIX, key)).await
    }

    /// The stored default if one was set at runtime, otherwise `configured`.
    pub async fn default_policy(&self, configured: Policy) -> Result<Policy> {
        match self.store.get(DEFAULT_POLICY_KEY).await? {
            Some(value) => Ok(value.parse().unwrap_or(Policy::Manual)),
            None => Ok(configured),
        }
    }

    pub async fn set_default_policy(&self, value: &str) -> Result<Policy> {
        let policy: Policy = value.parse()?;
        self.store
            .set(DEFAULT_POLICY_KEY, policy.as_str().to_string())
            .await?;
        Ok(policy)
    }

    pub async fn resolve_for(&self, container: &ContainerInfo, default: Policy) -> Result<Policy> {
        let override_policy = self.get_override(&container.key()).await?;
        Ok(resolve(&container.name, &container.labels, override_policy, default))
    }

    pub async fn ignored_versions(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(get_json(self.store.as_ref(), &format!("{}{}", IGNORED_PREFIX, key))
            .await?
            .unwrap_or_default())
    }

    pub async fn ignore_versions<I>(&self, key: &str, versions: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let mut ignored = self.ignored_versions(key).await?;
        ignored.extend(versions);
        set_json(self.store.as_ref(), &format!("{}{}", IGNORED_PREFIX, key), &ignored).await
    }

    pub async fn clear_ignored(&self, key: &str) -> Result<()> {
        self.store.delete(&format!("{}{}", IGNORED_PREFIX, key)).await
    }
}
