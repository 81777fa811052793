//! Update state machine.
//!
//! An attempt moves a single container from its running image to a target
//! image:
//!
//! ```text
//! Idle -> Checking -> PendingApproval -> Approved ┐
//!                  -> Auto ───────────────────────┤
//! Idle -> Approved (explicit update) ─────────────┤
//!                                                 v
//!      Snapshotting -> PreHook -> Swapping -> PostHook -> Completed
//!            └────────────┴──────────┴───────────┴──> Failed
//! Failed -> RollingBack -> RolledBack | RollbackFailed
//! ```
//!
//! Only a swap failure triggers the automatic rollback: a failed snapshot or
//! pre-hook happens before anything is mutated, and a failed post-hook runs
//! against a container that is already up on the new image.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{EngineError, Result};
use crate::events::{Event, EventPublisher};
use crate::guard::{InFlightGuard, Lease};
use crate::hooks::{run_all, HookContext, HookRunner, HookSet, DEFAULT_HOOK_TIMEOUT};
use crate::policy::{PolicyStore, RollbackPolicy};
use crate::runtime::{ContainerLister, ImageMutator};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::SettingsStore;
use crate::types::{replace_tag, split_key, ContainerInfo, ContainerKind, PendingUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    PendingApproval,
    Approved,
    Auto,
    Snapshotting,
    PreHook,
    Swapping,
    PostHook,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::Completed
                | UpdateState::Failed
                | UpdateState::RolledBack
                | UpdateState::RollbackFailed
        )
    }

    pub fn can_transition_to(self, next: UpdateState) -> bool {
        use UpdateState::*;
        matches!(
            (self, next),
            (Idle, Checking)
                | (Checking, Idle)
                | (Checking, PendingApproval)
                | (Checking, Auto)
                | (PendingApproval, Approved)
                | (Idle, Approved)
                | (Approved, Snapshotting)
                | (Auto, Snapshotting)
                | (Snapshotting, PreHook)
                | (PreHook, Swapping)
                | (Swapping, PostHook)
                | (PostHook, Completed)
                | (Snapshotting | PreHook | Swapping | PostHook, Failed)
                | (Failed, RollingBack)
                | (Idle, RollingBack)
                | (RollingBack, RolledBack | RollbackFailed)
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Who asked for the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// A scan found an update for an `auto` container.
    Auto,
    /// An operator approved a queued update.
    Approved,
    /// An operator asked for an update directly.
    Manual,
}

impl Trigger {
    fn entry_path(self) -> &'static [UpdateState] {
        match self {
            Trigger::Auto => &[UpdateState::Checking, UpdateState::Auto],
            Trigger::Approved => &[
                UpdateState::Checking,
                UpdateState::PendingApproval,
                UpdateState::Approved,
            ],
            Trigger::Manual => &[UpdateState::Approved],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub container_id: String,
    pub name: String,
    pub host_id: String,
    pub kind: ContainerKind,
    /// Explicit target, e.g. "update to this version" or self-update.
    pub target_image: Option<String>,
    pub pending: Option<PendingUpdate>,
    /// Registry digest the pull is expected to produce, when known.
    pub target_digest: Option<String>,
    pub trigger: Trigger,
}

impl UpdateRequest {
    /// An operator-triggered update. `key` may carry a host prefix.
    pub fn manual(container_id: &str, key: &str, target_image: Option<String>) -> Self {
        let (host_id, name) = split_key(key);
        Self {
            container_id: container_id.to_string(),
            name: name.to_string(),
            host_id: host_id.to_string(),
            kind: ContainerKind::Container,
            target_image,
            pending: None,
            target_digest: None,
            trigger: Trigger::Manual,
        }
    }

    pub fn from_pending(pending: PendingUpdate, trigger: Trigger) -> Self {
        Self {
            container_id: pending.container_id.clone(),
            name: pending.container_name.clone(),
            host_id: pending.host_id.clone(),
            kind: pending.kind,
            target_image: None,
            target_digest: digest_of(&pending),
            pending: Some(pending),
            trigger,
        }
    }

    /// Attaches the queued fact for this container, if there is one, so the
    /// target can be derived from it.
    pub fn with_pending(mut self, pending: Option<PendingUpdate>) -> Self {
        if let Some(pending) = &pending {
            self.kind = pending.kind;
            self.target_digest = digest_of(pending);
        }
        self.pending = pending;
        self
    }

    pub fn key(&self) -> String {
        crate::types::composite_key(&self.host_id, &self.name)
    }

    /// The target known before looking at the running container: the
    /// explicit override, or the queued update's nearest version. `None`
    /// means a digest-only pull of whatever the container runs.
    pub fn requested_target(&self) -> Option<String> {
        if let Some(target) = &self.target_image {
            return Some(target.clone());
        }
        self.pending
            .as_ref()
            .filter(|p| !p.is_digest_only())
            .map(PendingUpdate::target_image)
    }
}

fn digest_of(pending: &PendingUpdate) -> Option<String> {
    Some(pending.remote_digest.clone()).filter(|digest| !digest.is_empty())
}

/// Resolves the image an update moves `current_image` to.
pub fn resolve_target(current_image: &str, request: &UpdateRequest) -> Result<String> {
    if let Some(target) = &request.target_image {
        let target = target.trim();
        if target.is_empty() || target.chars().any(char::is_whitespace) {
            return Err(EngineError::validation(
                "target image",
                format!("`{}` is not an image reference", target),
            ));
        }
        return Ok(target.to_string());
    }
    match request.pending.as_ref().and_then(|p| p.newer_versions.first()) {
        Some(version) => Ok(replace_tag(current_image, version)),
        None => Ok(current_image.to_string()),
    }
}

/// Outcome of one attempt, returned to callers and sent back by cluster
/// agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub key: String,
    pub previous_image: String,
    pub target_image: String,
    pub state: UpdateState,
    #[serde(default)]
    pub failed_in: Option<UpdateState>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub snapshot_taken: bool,
}

impl UpdateReport {
    pub fn succeeded(&self) -> bool {
        self.state == UpdateState::Completed
    }

    /// Whether the container ended up on the target image, even if a
    /// post-update hook failed afterwards.
    pub fn image_applied(&self) -> bool {
        self.succeeded()
            || (self.state == UpdateState::Failed && self.failed_in == Some(UpdateState::PostHook))
    }
}

/// In-flight record driving one update or rollback.
#[derive(Debug, Clone)]
pub struct UpdateAttempt {
    pub key: String,
    pub container: ContainerInfo,
    pub previous_image: String,
    pub target_image: String,
    pub started_at: Instant,
    pub state: UpdateState,
    pub history: Vec<UpdateState>,
    pub snapshot: Option<Snapshot>,
    pub failed_in: Option<UpdateState>,
    pub last_error: Option<String>,
}

impl UpdateAttempt {
    fn new(container: ContainerInfo, target_image: String) -> Self {
        Self {
            key: container.key(),
            previous_image: container.image.clone(),
            container,
            target_image,
            started_at: Instant::now(),
            state: UpdateState::Idle,
            history: Vec::new(),
            snapshot: None,
            failed_in: None,
            last_error: None,
        }
    }

    fn advance(&mut self, next: UpdateState) {
        if !self.state.can_transition_to(next) {
            error!(
                "Invalid update transition for {}: {} -> {}",
                self.key, self.state, next
            );
            debug_assert!(false, "invalid transition {} -> {}", self.state, next);
        }
        debug!("{}: {} -> {}", self.key, self.state, next);
        self.history.push(self.state);
        self.state = next;
    }

    fn fail(&mut self, err: &EngineError) {
        self.failed_in = Some(self.state);
        self.last_error = Some(err.to_string());
        self.advance(UpdateState::Failed);
    }

    pub fn report(&self) -> UpdateReport {
        UpdateReport {
            key: self.key.clone(),
            previous_image: self.previous_image.clone(),
            target_image: self.target_image.clone(),
            state: self.state,
            failed_in: self.failed_in,
            error: self.last_error.clone(),
            snapshot_taken: self.snapshot.is_some(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub hook_timeout: Duration,
    /// Upper bound for one pull-and-swap.
    pub swap_timeout: Duration,
    pub auto_rollback: bool,
    pub rollback_policy: RollbackPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            swap_timeout: Duration::from_secs(600),
            auto_rollback: true,
            rollback_policy: RollbackPolicy::Manual,
        }
    }
}

/// Executes updates and rollbacks for containers on this host.
pub struct UpdateEngine {
    lister: Arc<dyn ContainerLister>,
    mutator: Arc<dyn ImageMutator>,
    hooks: Arc<dyn HookRunner>,
    snapshots: SnapshotStore,
    policies: PolicyStore,
    guard: Arc<InFlightGuard>,
    events: Arc<dyn EventPublisher>,
    settings: EngineSettings,
}

impl UpdateEngine {
    pub fn new(
        lister: Arc<dyn ContainerLister>,
        mutator: Arc<dyn ImageMutator>,
        hooks: Arc<dyn HookRunner>,
        store: Arc<dyn SettingsStore>,
        guard: Arc<InFlightGuard>,
        events: Arc<dyn EventPublisher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            lister,
            mutator,
            hooks,
            snapshots: SnapshotStore::new(Arc::clone(&store)),
            policies: PolicyStore::new(store),
            guard,
            events,
            settings,
        }
    }

    pub fn lister(&self) -> &Arc<dyn ContainerLister> {
        &self.lister
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn guard(&self) -> &InFlightGuard {
        &self.guard
    }

    /// Runs one update to completion.
    ///
    /// Returns `Err` only when the attempt never started: the container is
    /// busy ([`EngineError::UpdateInProgress`]), unknown, or the request is
    /// invalid. Every attempt that started yields a report in a terminal
    /// state and publishes exactly one terminal event.
    pub async fn update(&self, request: UpdateRequest) -> Result<UpdateReport> {
        let lease = self.guard.try_acquire(&request.name)?;
        let container = self.lister.inspect(&request.name).await?;
        let target = resolve_target(&container.image, &request)?;

        let mut attempt = UpdateAttempt::new(container, target);
        for state in request.trigger.entry_path() {
            attempt.advance(*state);
        }
        if let Some(digest) = &request.target_digest {
            debug!("{}: expecting digest {}", attempt.key, digest);
        }
        info!(
            "Updating {} from {} to {}",
            attempt.key, attempt.previous_image, attempt.target_image
        );
        self.events.publish(Event::UpdateStarted {
            key: attempt.key.clone(),
            target_image: attempt.target_image.clone(),
        });

        let report = self.run(attempt, &lease).await;
        drop(lease);
        Ok(report)
    }

    async fn run(&self, mut attempt: UpdateAttempt, lease: &Lease) -> UpdateReport {
        attempt.advance(UpdateState::Snapshotting);
        match self
            .snapshots
            .record(&attempt.container.name, &attempt.previous_image)
            .await
        {
            Ok(snapshot) => attempt.snapshot = Some(snapshot),
            Err(e) => return self.failed(attempt, e),
        }

        let hooks = HookSet::from_labels(&attempt.container.labels, self.settings.hook_timeout);
        let ctx = HookContext {
            container: attempt.container.name.clone(),
            old_image: attempt.previous_image.clone(),
            new_image: attempt.target_image.clone(),
        };

        attempt.advance(UpdateState::PreHook);
        if let Err(e) = run_all(self.hooks.as_ref(), &hooks.pre_update, &ctx, lease).await {
            return self.failed(attempt, e);
        }

        lease.renew();
        attempt.advance(UpdateState::Swapping);
        if let Err(e) = self.swap(&attempt.container, &attempt.target_image).await {
            if self.settings.auto_rollback {
                attempt.fail(&e);
                warn!("Update of {} failed, rolling back: {}", attempt.key, e);
                return self.roll_back_failed_attempt(attempt).await;
            }
            return self.failed(attempt, e);
        }

        lease.renew();
        attempt.advance(UpdateState::PostHook);
        if let Err(e) = run_all(self.hooks.as_ref(), &hooks.post_update, &ctx, lease).await {
            warn!(
                "{} is running {} but its post-update hook failed",
                attempt.key, attempt.target_image
            );
            return self.failed(attempt, e);
        }

        attempt.advance(UpdateState::Completed);
        info!(
            "Updated {} to {} in {:?}",
            attempt.key,
            attempt.target_image,
            attempt.started_at.elapsed()
        );
        self.events.publish(Event::UpdateSucceeded {
            key: attempt.key.clone(),
            previous_image: attempt.previous_image.clone(),
            target_image: attempt.target_image.clone(),
        });
        attempt.report()
    }

    fn failed(&self, mut attempt: UpdateAttempt, err: EngineError) -> UpdateReport {
        attempt.fail(&err);
        warn!(
            "Update of {} failed during {}: {}",
            attempt.key,
            attempt.failed_in.unwrap_or(UpdateState::Idle),
            err
        );
        self.events.publish(Event::UpdateFailed {
            key: attempt.key.clone(),
            target_image: attempt.target_image.clone(),
            failed_in: attempt.failed_in.unwrap_or(UpdateState::Idle),
            error: err.to_string(),
        });
        attempt.report()
    }

    async fn roll_back_failed_attempt(&self, mut attempt: UpdateAttempt) -> UpdateReport {
        let cause = attempt.last_error.clone();
        attempt.advance(UpdateState::RollingBack);
        let image = attempt
            .snapshot
            .as_ref()
            .map_or_else(|| attempt.previous_image.clone(), |s| s.image.clone());

        match self.swap(&attempt.container, &image).await {
            Ok(()) => {
                attempt.advance(UpdateState::RolledBack);
                info!("Rolled {} back to {}", attempt.key, image);
                self.apply_rollback_policy(&attempt.key).await;
                self.events.publish(Event::RolledBack {
                    key: attempt.key.clone(),
                    image,
                    cause,
                });
            }
            Err(e) => {
                attempt.last_error = Some(format!(
                    "{}; rollback failed: {}",
                    cause.unwrap_or_default(),
                    e
                ));
                attempt.advance(UpdateState::RollbackFailed);
                error!("Rollback of {} to {} failed: {}", attempt.key, image, e);
                self.events.publish(Event::RollbackFailed {
                    key: attempt.key.clone(),
                    image,
                    error: e.to_string(),
                });
            }
        }
        attempt.report()
    }

    /// Swaps the container back to its most recent snapshot. Goes through
    /// the same in-flight guard as an update.
    pub async fn rollback(&self, name: &str) -> Result<UpdateReport> {
        let _lease = self.guard.try_acquire(name)?;
        let container = self.lister.inspect(name).await?;
        let snapshot = self
            .snapshots
            .latest(name)
            .await?
            .ok_or_else(|| EngineError::NoSnapshot(name.to_string()))?;

        let mut attempt = UpdateAttempt::new(container, snapshot.image.clone());
        attempt.snapshot = Some(snapshot);
        attempt.advance(UpdateState::RollingBack);
        info!(
            "Rolling {} back from {} to {}",
            attempt.key, attempt.previous_image, attempt.target_image
        );

        match self.swap(&attempt.container, &attempt.target_image).await {
            Ok(()) => {
                attempt.advance(UpdateState::RolledBack);
                self.apply_rollback_policy(&attempt.key).await;
                self.events.publish(Event::RolledBack {
                    key: attempt.key.clone(),
                    image: attempt.target_image.clone(),
                    cause: None,
                });
                Ok(attempt.report())
            }
            Err(e) => {
                attempt.last_error = Some(e.to_string());
                attempt.advance(UpdateState::RollbackFailed);
                error!("Rollback of {} failed: {}", attempt.key, e);
                self.events.publish(Event::RollbackFailed {
                    key: attempt.key.clone(),
                    image: attempt.target_image.clone(),
                    error: e.to_string(),
                });
                Err(EngineError::RollbackFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn swap(&self, container: &ContainerInfo, image: &str) -> Result<()> {
        let operation = async {
            match container.kind {
                ContainerKind::Container => {
                    self.mutator.recreate_container(&container.name, image).await
                }
                ContainerKind::Service => self.mutator.update_service(&container.name, image).await,
            }
        };
        match timeout(self.settings.swap_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Runtime(format!(
                "swapping {} to {} timed out after {:?}",
                container.name, image, self.settings.swap_timeout
            ))),
        }
    }

    async fn apply_rollback_policy(&self, key: &str) {
        let Some(policy) = self.settings.rollback_policy.override_policy() else {
            return;
        };
        match self.policies.set_override(key, policy).await {
            Ok(()) => info!("Set policy of {} to {} after rollback", key, policy),
            Err(e) => warn!("Failed to set policy of {} after rollback: {}", key, e),
        }
    }

    /// Publishes the events for an update an agent ran on another host and
    /// applies the rollback policy under the report's composite key, so scans
    /// here see the same override a local rollback would leave behind.
    pub async fn record_remote_update(&self, report: &UpdateReport) {
        self.events.publish(Event::UpdateStarted {
            key: report.key.clone(),
            target_image: report.target_image.clone(),
        });
        let error = report.error.clone().unwrap_or_default();
        let event = match report.state {
            UpdateState::Completed => Event::UpdateSucceeded {
                key: report.key.clone(),
                previous_image: report.previous_image.clone(),
                target_image: report.target_image.clone(),
            },
            UpdateState::RolledBack => {
                self.apply_rollback_policy(&report.key).await;
                Event::RolledBack {
                    key: report.key.clone(),
                    image: report.previous_image.clone(),
                    cause: report.error.clone(),
                }
            }
            UpdateState::RollbackFailed => Event::RollbackFailed {
                key: report.key.clone(),
                image: report.previous_image.clone(),
                error,
            },
            _ => Event::UpdateFailed {
                key: report.key.clone(),
                target_image: report.target_image.clone(),
                failed_in: report.failed_in.unwrap_or(UpdateState::Idle),
                error,
            },
        };
        self.events.publish(event);
    }

    /// Same as [`record_remote_update`](Self::record_remote_update) for an
    /// explicit rollback. A failed remote rollback does not say which image
    /// it tried, so its event carries an empty image.
    pub async fn record_remote_rollback(&self, key: &str, outcome: &Result<UpdateReport>) {
        match outcome {
            Ok(report) if report.state == UpdateState::RolledBack => {
                self.apply_rollback_policy(&report.key).await;
                self.events.publish(Event::RolledBack {
                    key: report.key.clone(),
                    image: report.target_image.clone(),
                    cause: None,
                });
            }
            Err(EngineError::RollbackFailed { reason, .. }) => {
                self.events.publish(Event::RollbackFailed {
                    key: key.to_string(),
                    image: String::new(),
                    error: reason.clone(),
                });
            }
            _ => {}
        }
    }

    /// Snapshot history per container, newest first.
    pub async fn list_snapshots(&self, name: &str) -> Result<Vec<Snapshot>> {
        self.snapshots.list(name).await
    }

    /// Containers with an update or rollback in flight.
    pub fn in_progress(&self) -> Vec<String> {
        self.guard.held_keys()
    }
}
