//! Entry points for the scheduler and the web/API layer.
//!
//! A scan lists every container in the fleet, resolves its policy, asks the
//! registry about its image, and then either queues the finding for
//! approval or applies it straight away. Auto updates within one scan are
//! dispatched one after another in dependency order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::dispatch::Dispatcher;
use crate::engine::{Trigger, UpdateReport, UpdateRequest};
use crate::error::{EngineError, Result};
use crate::events::{Event, EventPublisher, QueueChange};
use crate::graph::{CycleError, DependencyGraph};
use crate::policy::{Policy, PolicyStore};
use crate::queue::PendingQueue;
use crate::runtime::{CheckOutcome, ContainerLister, RegistryChecker};
use crate::snapshot::Snapshot;
use crate::store::{get_json, set_json, SettingsStore};
use crate::types::{split_key, ContainerInfo, PendingUpdate};
use crate::worker::WorkerPool;

/// Containers carrying `sentinel.ignore=true` are left out of scans.
pub const IGNORE_LABEL: &str = "sentinel.ignore";

const QUEUE_KEY: &str = "queue";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub up_to_date: usize,
    pub skipped: Vec<String>,
    pub queued: Vec<String>,
    pub applied: Vec<String>,
    pub failed: Vec<String>,
    pub busy: Vec<String>,
    pub check_errors: usize,
    pub cycles: Vec<Vec<String>>,
}

pub struct Controller {
    lister: Arc<dyn ContainerLister>,
    registry: Arc<dyn RegistryChecker>,
    dispatcher: Arc<Dispatcher>,
    queue: PendingQueue,
    policies: PolicyStore,
    store: Arc<dyn SettingsStore>,
    events: Arc<dyn EventPublisher>,
    default_policy: Policy,
    graph: RwLock<DependencyGraph>,
    persist_lock: Mutex<()>,
    pool: WorkerPool,
}

impl Controller {
    pub fn new(
        lister: Arc<dyn ContainerLister>,
        registry: Arc<dyn RegistryChecker>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn SettingsStore>,
        events: Arc<dyn EventPublisher>,
        default_policy: Policy,
        pool: WorkerPool,
    ) -> Self {
        Self {
            lister,
            registry,
            dispatcher,
            queue: PendingQueue::new(),
            policies: PolicyStore::new(Arc::clone(&store)),
            store,
            events,
            default_policy,
            graph: RwLock::new(DependencyGraph::default()),
            persist_lock: Mutex::new(()),
            pool,
        }
    }

    /// Reloads the queue saved by a previous run.
    pub async fn restore_queue(&self) -> Result<usize> {
        let saved: Vec<PendingUpdate> = get_json(self.store.as_ref(), QUEUE_KEY)
            .await?
            .unwrap_or_default();
        let restored = self.queue.restore(saved);
        info!("Restored {} pending updates", restored);
        Ok(restored)
    }

    /// Writes the current queue out. Writers are serialized so the last
    /// write always reflects the latest queue.
    async fn persist_queue(&self) {
        let _guard = self.persist_lock.lock().await;
        let updates = self.queue.list();
        if let Err(e) = set_json(self.store.as_ref(), QUEUE_KEY, &updates).await {
            warn!("Failed to persist pending queue: {}", e);
        }
    }

    fn queue_changed(&self, key: &str, change: QueueChange) {
        self.events.publish(Event::QueueChanged {
            key: key.to_string(),
            change,
        });
    }

    pub async fn scan(&self) -> Result<ScanReport> {
        let containers = self.lister.list().await?;
        let graph = DependencyGraph::build(&containers);
        let order = graph.update_order();
        let mut report = ScanReport {
            scanned: containers.len(),
            cycles: graph.detect_cycles(),
            ..Default::default()
        };
        *self.graph.write().unwrap_or_else(PoisonError::into_inner) = graph;

        if !report.cycles.is_empty() {
            warn!("Dependency cycles detected: {:?}", report.cycles);
            self.events.publish(Event::CyclesDetected {
                cycles: report.cycles.clone(),
            });
        }

        let default = self.policies.default_policy(self.default_policy).await?;
        let mut auto: HashMap<String, PendingUpdate> = HashMap::new();
        let mut queue_dirty = false;

        for container in &containers {
            let key = container.key();
            if container
                .label(IGNORE_LABEL)
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
            {
                report.skipped.push(key);
                continue;
            }

            let pending = match self.detect(container).await {
                Ok(Some(pending)) => pending,
                Ok(None) => {
                    report.up_to_date += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Update check for {} failed: {}", key, e);
                    report.check_errors += 1;
                    continue;
                }
            };

            let policy = self
                .policies
                .resolve_for(container, default)
                .await
                .unwrap_or_else(|e| {
                    warn!("Could not read policy of {}, treating as manual: {}", key, e);
                    Policy::Manual
                });
            debug!("{} has an update, policy {}", key, policy);

            match policy {
                Policy::Auto => {
                    auto.insert(key, pending);
                }
                Policy::Manual | Policy::Pinned => {
                    self.enqueue(pending);
                    queue_dirty = true;
                    report.queued.push(key);
                }
            }
        }

        for key in order {
            let Some(pending) = auto.remove(&key) else {
                continue;
            };
            let request = UpdateRequest::from_pending(pending, Trigger::Auto);
            match self.dispatcher.dispatch(request).await {
                Ok(result) if result.image_applied() => {
                    if self.queue.remove(&key) {
                        queue_dirty = true;
                        self.queue_changed(&key, QueueChange::Applied);
                    }
                    report.applied.push(key);
                }
                Ok(_) => report.failed.push(key),
                Err(e) if e.is_busy() => {
                    info!("{} is already being updated, retrying next scan", key);
                    report.busy.push(key);
                }
                Err(e) => {
                    warn!("Auto update of {} failed: {}", key, e);
                    report.failed.push(key);
                }
            }
        }

        if queue_dirty {
            self.persist_queue().await;
        }
        info!(
            "Scan finished: {} containers, {} queued, {} applied, {} failed",
            report.scanned,
            report.queued.len(),
            report.applied.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Registry check with ignored versions filtered out.
    async fn detect(&self, container: &ContainerInfo) -> Result<Option<PendingUpdate>> {
        let outcome = self.registry.check_container(container).await?;
        if !outcome.update_available {
            return Ok(None);
        }
        let ignored = self.policies.ignored_versions(&container.key()).await?;
        let mut pending = PendingUpdate::from_check(container, outcome);
        if pending.is_digest_only() {
            if ignored.contains(&pending.remote_digest) {
                debug!("Ignoring digest {} for {}", pending.remote_digest, pending.key());
                return Ok(None);
            }
        } else {
            pending.newer_versions.retain(|version| !ignored.contains(version));
            if pending.newer_versions.is_empty() {
                debug!("Every newer version of {} is ignored", pending.key());
                return Ok(None);
            }
        }
        Ok(Some(pending))
    }

    fn enqueue(&self, pending: PendingUpdate) {
        let key = pending.key();
        let versions = pending.newer_versions.clone();
        let digest = pending.remote_digest.clone();
        let changed = match self.queue.add(pending) {
            Some(previous) => previous.newer_versions != versions || previous.remote_digest != digest,
            None => true,
        };
        if changed {
            self.queue_changed(&key, QueueChange::Added);
        }
    }

    pub async fn add_pending(&self, update: PendingUpdate) {
        self.enqueue(update);
        self.persist_queue().await;
    }

    pub fn pending_update(&self, key: &str) -> Option<PendingUpdate> {
        self.queue.get(key)
    }

    pub fn pending_updates(&self) -> Vec<PendingUpdate> {
        self.queue.list()
    }

    /// Takes the update off the queue and runs it. If the container is
    /// already mid-update the entry goes back on the queue and the busy
    /// error is returned.
    pub async fn approve(&self, key: &str) -> Result<UpdateReport> {
        let update = self
            .queue
            .approve(key)
            .ok_or_else(|| EngineError::NotFound(format!("pending update {}", key)))?;
        self.queue_changed(key, QueueChange::Approved);
        self.persist_queue().await;

        let request = UpdateRequest::from_pending(update.clone(), Trigger::Approved);
        match self.dispatcher.dispatch(request).await {
            Err(e) if e.is_busy() => {
                info!("{} is busy, returning it to the queue", key);
                self.requeue(update).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Puts an update that could not run back on the queue, unless a newer
    /// finding for the same container was queued in the meantime.
    async fn requeue(&self, update: PendingUpdate) {
        let key = update.key();
        if self.queue.restore(vec![update]) == 0 {
            debug!("{} was queued again meanwhile, keeping the newer entry", key);
            return;
        }
        self.queue_changed(&key, QueueChange::Requeued);
        self.persist_queue().await;
    }

    pub async fn reject(&self, key: &str) -> Result<bool> {
        let removed = self.queue.remove(key);
        if removed {
            self.queue_changed(key, QueueChange::Rejected);
            self.persist_queue().await;
        }
        Ok(removed)
    }

    /// Drops the entry and remembers its versions (or digest) so scans stop
    /// offering them.
    pub async fn ignore(&self, key: &str) -> Result<bool> {
        let Some(update) = self.queue.approve(key) else {
            return Ok(false);
        };
        let ignored = if update.is_digest_only() {
            vec![update.remote_digest.clone()]
        } else {
            update.newer_versions.clone()
        };
        if let Err(e) = self.policies.ignore_versions(key, ignored).await {
            self.queue.restore(vec![update]);
            return Err(e);
        }
        self.queue_changed(key, QueueChange::Ignored);
        self.persist_queue().await;
        Ok(true)
    }

    pub async fn check_for_update(&self, image_ref: &str) -> Result<CheckOutcome> {
        self.registry.check(image_ref).await
    }

    /// Operator-triggered update. `key` may carry a host prefix; a queued
    /// entry for the same key supplies the target when none is given.
    pub async fn update_container(
        &self,
        container_id: &str,
        key: &str,
        target_image: Option<String>,
    ) -> Result<UpdateReport> {
        let request =
            UpdateRequest::manual(container_id, key, target_image).with_pending(self.queue.get(key));
        let report = self.dispatcher.dispatch(request).await?;
        if report.image_applied() && self.queue.remove(key) {
            self.queue_changed(key, QueueChange::Applied);
            self.persist_queue().await;
        }
        Ok(report)
    }

    pub async fn rollback_container(&self, key: &str) -> Result<UpdateReport> {
        self.dispatcher.rollback(key).await
    }

    /// Snapshot history for a composite key, newest first. Remote keys are
    /// answered by the owning agent.
    pub async fn list_snapshots(&self, key: &str) -> Result<Vec<Snapshot>> {
        self.dispatcher.list_snapshots(key).await
    }

    pub fn dependencies(&self, key: &str) -> Vec<String> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dependencies(key)
            .to_vec()
    }

    pub fn dependents(&self, key: &str) -> Vec<String> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dependents(key)
            .to_vec()
    }

    /// Dependency order of the last scan.
    pub fn update_order(&self) -> std::result::Result<Vec<String>, CycleError> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sort()
    }

    pub fn cycles(&self) -> Vec<Vec<String>> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .detect_cycles()
    }

    pub async fn resolve_policy(&self, key: &str) -> Result<Policy> {
        let container = self.lister.inspect(key).await?;
        let default = self.policies.default_policy(self.default_policy).await?;
        self.policies.resolve_for(&container, default).await
    }

    pub async fn policy_override(&self, key: &str) -> Result<Option<Policy>> {
        self.policies.get_override(key).await
    }

    pub async fn set_policy_override(&self, key: &str, value: &str) -> Result<Policy> {
        let (_, name) = split_key(key);
        if name.is_empty() {
            return Err(EngineError::validation("container", "name must not be empty"));
        }
        self.policies.set_override_str(key, value).await
    }

    pub async fn clear_policy_override(&self, key: &str) -> Result<()> {
        self.policies.clear_override(key).await
    }

    pub async fn set_default_policy(&self, value: &str) -> Result<Policy> {
        self.policies.set_default_policy(value).await
    }

    /// Approves in the background; the outcome arrives as events.
    pub fn spawn_approve(self: &Arc<Self>, key: &str) -> Result<()> {
        let this = Arc::clone(self);
        let key = key.to_string();
        self.pool.submit(async move {
            match this.approve(&key).await {
                Ok(report) => debug!("Approved update of {} ended {}", key, report.state),
                Err(e) if e.is_busy() => info!("{} busy, left in queue", key),
                Err(e) => warn!("Approved update of {} failed: {}", key, e),
            }
        })
    }

    pub fn spawn_update(
        self: &Arc<Self>,
        container_id: &str,
        key: &str,
        target_image: Option<String>,
    ) -> Result<()> {
        let this = Arc::clone(self);
        let container_id = container_id.to_string();
        let key = key.to_string();
        self.pool.submit(async move {
            if let Err(e) = this.update_container(&container_id, &key, target_image).await {
                warn!("Update of {} not run: {}", key, e);
            }
        })
    }

    pub fn spawn_rollback(self: &Arc<Self>, key: &str) -> Result<()> {
        let this = Arc::clone(self);
        let key = key.to_string();
        self.pool.submit(async move {
            if let Err(e) = this.rollback_container(&key).await {
                warn!("Rollback of {} not run: {}", key, e);
            }
        })
    }
}
