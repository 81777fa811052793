use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::error::EngineError;
use crate::policy::{Policy, RollbackPolicy};

const DEFAULT_CLUSTER_SECRET: &str = "default_insecure_secret";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub default_policy: Policy,
    pub scan_interval_secs: u64,
    pub hook_timeout_secs: u64,
    pub swap_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub auto_rollback: bool,
    pub rollback_policy: RollbackPolicy,
    pub lease_ttl_secs: u64,
    pub workers: usize,
    pub job_capacity: usize,
    pub state_file: PathBuf,
    /// When set, this instance also serves as a cluster agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_bind: Option<SocketAddr>,
    pub cluster_secret: String,
    /// Host ID → agent address.
    pub remote_hosts: HashMap<String, String>,
    pub remote_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_policy: Policy::Manual,
            scan_interval_secs: 3600,
            hook_timeout_secs: 30,
            swap_timeout_secs: 600,
            stop_timeout_secs: 10,
            auto_rollback: true,
            rollback_policy: RollbackPolicy::Manual,
            lease_ttl_secs: 1800,
            workers: 4,
            job_capacity: 64,
            state_file: PathBuf::from("sentinel-state.json"),
            agent_bind: None,
            cluster_secret: DEFAULT_CLUSTER_SECRET.into(),
            remote_hosts: HashMap::new(),
            remote_timeout_secs: 900,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("sentinel.toml"))
            .merge(Json::file("sentinel.json"))
            .merge(Env::prefixed("SENTINEL_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("SENTINEL_CLUSTER_SECRET_FILE") {
            config.cluster_secret = std::fs::read_to_string(secret_file)?
                .trim()
                .to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values that must never reach the engine.
    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = [
            ("scan_interval_secs", self.scan_interval_secs),
            ("hook_timeout_secs", self.hook_timeout_secs),
            ("swap_timeout_secs", self.swap_timeout_secs),
            ("lease_ttl_secs", self.lease_ttl_secs),
            ("remote_timeout_secs", self.remote_timeout_secs),
            ("workers", self.workers as u64),
            ("job_capacity", self.job_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(EngineError::validation(field, "must be greater than zero"));
            }
        }
        if self.lease_ttl_secs < self.swap_timeout_secs {
            return Err(EngineError::validation(
                "lease_ttl_secs",
                "must not be shorter than swap_timeout_secs",
            ));
        }
        if self.hook_timeout_secs >= self.lease_ttl_secs {
            return Err(EngineError::validation(
                "hook_timeout_secs",
                "must be shorter than lease_ttl_secs",
            ));
        }
        let clustered = self.agent_bind.is_some() || !self.remote_hosts.is_empty();
        if clustered && self.cluster_secret.trim().is_empty() {
            return Err(EngineError::validation(
                "cluster_secret",
                "must be set when agents are configured",
            ));
        }
        for (host, addr) in &self.remote_hosts {
            if host.is_empty() || host.contains("::") {
                return Err(EngineError::validation(
                    "remote_hosts",
                    format!("`{}` is not a valid host ID", host),
                ));
            }
            if addr.trim().is_empty() {
                return Err(EngineError::validation(
                    "remote_hosts",
                    format!("host `{}` has no address", host),
                ));
            }
        }
        Ok(())
    }

    pub fn uses_default_secret(&self) -> bool {
        self.cluster_secret == DEFAULT_CLUSTER_SECRET
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            hook_timeout: Duration::from_secs(self.hook_timeout_secs),
            swap_timeout: Duration::from_secs(self.swap_timeout_secs),
            auto_rollback: self.auto_rollback,
            rollback_policy: self.rollback_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.engine_settings().hook_timeout, Duration::from_secs(30));
        assert!(config.uses_default_secret());
    }

    #[test]
    fn layered_sources_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "sentinel.toml",
                r#"
                    default_policy = "auto"
                    rollback_policy = "none"
                    [remote_hosts]
                    edge = "10.0.0.7:7070"
                "#,
            )?;
            jail.set_env("SENTINEL_SCAN_INTERVAL_SECS", "300");
            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.default_policy, Policy::Auto);
            assert_eq!(config.rollback_policy, RollbackPolicy::Unchanged);
            assert_eq!(config.scan_interval(), Duration::from_secs(300));
            assert_eq!(config.remote_hosts["edge"], "10.0.0.7:7070");
            Ok(())
        });
    }

    #[test]
    fn unknown_policy_value_is_rejected_at_load() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SENTINEL_DEFAULT_POLICY", "sometimes");
            assert!(Config::load().is_err());
            Ok(())
        });
    }

    #[test]
    fn zero_interval_is_a_validation_error() {
        let config = Config {
            scan_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::Validation { ref field, .. }) if field == "scan_interval_secs"
        ));
    }

    #[test]
    fn hook_timeout_must_fit_in_the_lease() {
        let config = Config {
            hook_timeout_secs: 3600,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::Validation { ref field, .. }) if field == "hook_timeout_secs"
        ));
    }

    #[test]
    fn host_ids_cannot_contain_the_key_separator() {
        let config = Config {
            remote_hosts: HashMap::from([("a::b".to_string(), "10.0.0.1:7070".to_string())]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
