//! In-memory collaborators shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::UpdateReport;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventPublisher};
use crate::hooks::{Hook, HookContext, HookRunner};
use crate::remote::RemoteTransport;
use crate::runtime::{CheckOutcome, ContainerLister, ImageMutator, RegistryChecker};
use crate::snapshot::Snapshot;
use crate::types::{ContainerInfo, ContainerKind};

pub fn container(name: &str, image: &str, labels: &[(&str, &str)]) -> ContainerInfo {
    ContainerInfo {
        id: format!("id-{}", name),
        name: name.to_string(),
        kind: ContainerKind::Container,
        image: image.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        host_id: String::new(),
        state: "running".to_string(),
        image_digest: String::new(),
    }
}

/// Containers held in memory; swaps rewrite the image in place.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<BTreeMap<String, ContainerInfo>>,
    failing_images: Mutex<HashSet<String>>,
    swap_delay: Mutex<Duration>,
    swaps: Mutex<Vec<(String, String)>>,
    service_updates: Mutex<Vec<(String, String)>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, container: ContainerInfo) {
        self.containers
            .lock()
            .unwrap()
            .insert(container.name.clone(), container);
    }

    pub fn image_of(&self, name: &str) -> String {
        self.containers.lock().unwrap()[name].image.clone()
    }

    pub fn fail_image(&self, image: &str) {
        self.failing_images.lock().unwrap().insert(image.to_string());
    }

    pub fn set_swap_delay(&self, delay: Duration) {
        *self.swap_delay.lock().unwrap() = delay;
    }

    pub fn swaps(&self) -> Vec<(String, String)> {
        self.swaps.lock().unwrap().clone()
    }

    pub fn service_updates(&self) -> Vec<(String, String)> {
        self.service_updates.lock().unwrap().clone()
    }

    async fn apply(&self, name: &str, image: &str) -> Result<()> {
        let delay = *self.swap_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.swaps
            .lock()
            .unwrap()
            .push((name.to_string(), image.to_string()));
        if self.failing_images.lock().unwrap().contains(image) {
            return Err(EngineError::Runtime(format!("pull of {} failed", image)));
        }
        match self.containers.lock().unwrap().get_mut(name) {
            Some(container) => {
                container.image = image.to_string();
                Ok(())
            }
            None => Err(EngineError::NotFound(name.to_string())),
        }
    }
}

#[async_trait]
impl ContainerLister for FakeRuntime {
    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.containers.lock().unwrap().values().cloned().collect())
    }
}

#[async_trait]
impl ImageMutator for FakeRuntime {
    async fn recreate_container(&self, name: &str, target_image: &str) -> Result<()> {
        self.apply(name, target_image).await
    }

    async fn update_service(&self, name: &str, target_image: &str) -> Result<()> {
        self.service_updates
            .lock()
            .unwrap()
            .push((name.to_string(), target_image.to_string()));
        self.apply(name, target_image).await
    }
}

/// Registry answers keyed by image reference; unknown images are current.
#[derive(Default)]
pub struct FakeRegistry {
    outcomes: Mutex<HashMap<String, CheckOutcome>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeRegistry {
    pub fn newer(&self, image: &str, versions: &[&str]) {
        self.outcomes.lock().unwrap().insert(
            image.to_string(),
            CheckOutcome {
                update_available: true,
                newer_versions: versions.iter().map(|v| v.to_string()).collect(),
                resolved_current_version: String::new(),
                resolved_target_version: versions.first().map(|v| v.to_string()).unwrap_or_default(),
                remote_digest: format!("sha256:{}", image.len()),
            },
        );
    }

    /// The registry's manifest for `image` moved; no newer tags.
    pub fn digest(&self, image: &str, digest: &str) {
        self.outcomes.lock().unwrap().insert(
            image.to_string(),
            CheckOutcome {
                update_available: true,
                remote_digest: digest.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn unreachable(&self, image: &str) {
        self.unreachable.lock().unwrap().insert(image.to_string());
    }
}

#[async_trait]
impl RegistryChecker for FakeRegistry {
    async fn check(&self, image_ref: &str) -> Result<CheckOutcome> {
        if self.unreachable.lock().unwrap().contains(image_ref) {
            return Err(EngineError::Runtime(format!("registry for {} unreachable", image_ref)));
        }
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .get(image_ref)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeHooks {
    failing: Mutex<HashSet<String>>,
    ran: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<Duration>>,
    delay: Mutex<Duration>,
}

impl FakeHooks {
    /// Every hook takes this long before finishing.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }

    pub fn fail_on(&self, command: &str) {
        self.failing.lock().unwrap().insert(command.to_string());
    }

    pub fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl HookRunner for FakeHooks {
    async fn run(&self, hook: &Hook, _ctx: &HookContext) -> Result<()> {
        self.ran.lock().unwrap().push(hook.command.clone());
        self.timeouts.lock().unwrap().push(hook.timeout);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&hook.command) {
            return Err(EngineError::Hook {
                command: hook.command.clone(),
                reason: "exit status: 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<Event>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Records remote calls; answers with a canned report or error.
#[derive(Default)]
pub struct FakeTransport {
    pub calls: Mutex<Vec<String>>,
    pub busy: Mutex<bool>,
    /// How long an update call takes before answering.
    pub delay: Mutex<Duration>,
    pub containers: Mutex<HashMap<String, Vec<ContainerInfo>>>,
    /// Keyed by composite key.
    pub snapshots: Mutex<HashMap<String, Vec<Snapshot>>>,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn report(host_id: &str, name: &str, target: &str) -> UpdateReport {
        UpdateReport {
            key: crate::types::composite_key(host_id, name),
            previous_image: String::new(),
            target_image: target.to_string(),
            state: crate::engine::UpdateState::Completed,
            failed_in: None,
            error: None,
            snapshot_taken: true,
        }
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn update_remote_container(
        &self,
        host_id: &str,
        name: &str,
        target_image: Option<&str>,
        target_digest: Option<&str>,
    ) -> Result<UpdateReport> {
        self.calls.lock().unwrap().push(format!(
            "update {} {} {} {}",
            host_id,
            name,
            target_image.unwrap_or("-"),
            target_digest.unwrap_or("-")
        ));
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.busy.lock().unwrap() {
            return Err(EngineError::UpdateInProgress(name.to_string()));
        }
        Ok(Self::report(host_id, name, target_image.unwrap_or_default()))
    }

    async fn rollback_remote_container(&self, host_id: &str, name: &str) -> Result<UpdateReport> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("rollback {} {}", host_id, name));
        let mut report = Self::report(host_id, name, "");
        report.state = crate::engine::UpdateState::RolledBack;
        Ok(report)
    }

    async fn list_remote_containers(&self, host_id: &str) -> Result<Vec<ContainerInfo>> {
        self.containers
            .lock()
            .unwrap()
            .get(host_id)
            .cloned()
            .ok_or_else(|| EngineError::Remote {
                host: host_id.to_string(),
                reason: "connection refused".into(),
            })
    }

    async fn list_remote_snapshots(&self, host_id: &str, name: &str) -> Result<Vec<Snapshot>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("snapshots {} {}", host_id, name));
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(&crate::types::composite_key(host_id, name))
            .cloned()
            .unwrap_or_default())
    }
}
