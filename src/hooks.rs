//! Pre/post update hooks.
//!
//! Hooks are declared on the container itself:
//!
//! * `sentinel.hook.pre-update` runs before anything is mutated; a failure
//!   aborts the update.
//! * `sentinel.hook.post-update` runs once the new container is up.
//! * `sentinel.hook.timeout` overrides the per-command timeout in seconds.
//!
//! Several commands can be given in one label separated by `;;`.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{EngineError, Result};
use crate::guard::Lease;

pub const PRE_UPDATE_LABEL: &str = "sentinel.hook.pre-update";
pub const POST_UPDATE_LABEL: &str = "sentinel.hook.post-update";
pub const TIMEOUT_LABEL: &str = "sentinel.hook.timeout";
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

const COMMAND_SEPARATOR: &str = ";;";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookSet {
    pub pre_update: Vec<Hook>,
    pub post_update: Vec<Hook>,
}

impl HookSet {
    pub fn from_labels(labels: &HashMap<String, String>, default_timeout: Duration) -> Self {
        let timeout = match labels.get(TIMEOUT_LABEL) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!("Invalid {} value `{}`, using default", TIMEOUT_LABEL, raw);
                    default_timeout
                }
            },
            None => default_timeout,
        };
        let parse = |label: &str| -> Vec<Hook> {
            labels
                .get(label)
                .map(|value| {
                    value
                        .split(COMMAND_SEPARATOR)
                        .map(str::trim)
                        .filter(|command| !command.is_empty())
                        .map(|command| Hook {
                            command: command.to_string(),
                            timeout,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            pre_update: parse(PRE_UPDATE_LABEL),
            post_update: parse(POST_UPDATE_LABEL),
        }
    }
}

/// Values exported to hook commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub container: String,
    pub old_image: String,
    pub new_image: String,
}

#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Runs one command. Must not outlive `hook.timeout`.
    async fn run(&self, hook: &Hook, ctx: &HookContext) -> Result<()>;
}

impl Hook {
    /// The same command with its timeout cut down to `max`.
    pub fn bounded_by(&self, max: Duration) -> Hook {
        Hook {
            command: self.command.clone(),
            timeout: self.timeout.min(max),
        }
    }
}

/// Runs every hook in order, stopping at the first failure. The lease is
/// renewed before each command and no command may run longer than the
/// lease lives, so the container stays marked busy throughout.
pub async fn run_all(
    runner: &dyn HookRunner,
    hooks: &[Hook],
    ctx: &HookContext,
    lease: &Lease,
) -> Result<()> {
    for hook in hooks {
        let bounded = hook.bounded_by(lease.ttl());
        if bounded.timeout < hook.timeout {
            warn!(
                "Hook timeout for {} cut to {:?} to stay within its update lease",
                ctx.container, bounded.timeout
            );
        }
        if !lease.renew() {
            return Err(EngineError::UpdateInProgress(lease.key().to_string()));
        }
        debug!("Running hook for {}: {}", ctx.container, bounded.command);
        runner.run(&bounded, ctx).await?;
    }
    Ok(())
}

/// Runs hooks on the host with `sh -c`. A command that outlives its timeout
/// is killed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellHookRunner;

#[async_trait]
impl HookRunner for ShellHookRunner {
    async fn run(&self, hook: &Hook, ctx: &HookContext) -> Result<()> {
        let failed = |reason: String| EngineError::Hook {
            command: hook.command.clone(),
            reason,
        };

        let child = Command::new("sh")
            .arg("-c")
            .arg(&hook.command)
            .env("SENTINEL_CONTAINER", &ctx.container)
            .env("SENTINEL_OLD_IMAGE", &ctx.old_image)
            .env("SENTINEL_NEW_IMAGE", &ctx.new_image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("failed to spawn: {}", e)))?;

        // Dropping the timed-out future drops the child, which kills it.
        let output = match timeout(hook.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| failed(e.to_string()))?,
            Err(_) => return Err(failed(format!("timed out after {:?}", hook.timeout))),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!("{}: {}", output.status, stderr.trim())));
        }
        info!("Hook for {} succeeded: {}", ctx.container, hook.command);
        Ok(())
    }
}
