//! Routes updates to where the container lives.

use std::sync::Arc;

use log::debug;

use crate::engine::{UpdateEngine, UpdateReport, UpdateRequest};
use crate::error::{EngineError, Result};
use crate::remote::RemoteTransport;
use crate::snapshot::Snapshot;
use crate::types::{split_key, ContainerKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Service,
    Remote(String),
}

pub fn route(host_id: &str, kind: ContainerKind) -> Route {
    if !host_id.is_empty() {
        return Route::Remote(host_id.to_string());
    }
    match kind {
        ContainerKind::Container => Route::Local,
        ContainerKind::Service => Route::Service,
    }
}

/// Stateless apart from its collaborators. Agents build one without a
/// transport, so they can only ever act on their own containers.
pub struct Dispatcher {
    engine: Arc<UpdateEngine>,
    remote: Option<Arc<dyn RemoteTransport>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<UpdateEngine>, remote: Option<Arc<dyn RemoteTransport>>) -> Self {
        Self { engine, remote }
    }

    pub fn engine(&self) -> &Arc<UpdateEngine> {
        &self.engine
    }

    fn transport(&self, host_id: &str) -> Result<&Arc<dyn RemoteTransport>> {
        self.remote.as_ref().ok_or_else(|| EngineError::Remote {
            host: host_id.to_string(),
            reason: "no cluster transport configured".into(),
        })
    }

    pub async fn dispatch(&self, request: UpdateRequest) -> Result<UpdateReport> {
        let route = route(&request.host_id, request.kind);
        debug!("Dispatching update of {} via {:?}", request.key(), route);
        match route {
            // The engine picks the container or service path from the
            // inspected kind.
            Route::Local | Route::Service => self.engine.update(request).await,
            Route::Remote(host) => {
                let target = request.requested_target();
                let report = self
                    .transport(&host)?
                    .update_remote_container(
                        &host,
                        &request.name,
                        target.as_deref(),
                        request.target_digest.as_deref(),
                    )
                    .await?;
                self.engine.record_remote_update(&report).await;
                Ok(report)
            }
        }
    }

    /// `key` is a composite key; a host prefix sends the rollback to that
    /// host's agent.
    pub async fn rollback(&self, key: &str) -> Result<UpdateReport> {
        let (host_id, name) = split_key(key);
        if host_id.is_empty() {
            return self.engine.rollback(name).await;
        }
        let outcome = self
            .transport(host_id)?
            .rollback_remote_container(host_id, name)
            .await;
        self.engine.record_remote_rollback(key, &outcome).await;
        outcome
    }

    /// Snapshot history for a composite key, asked of the owning agent for
    /// remote containers.
    pub async fn list_snapshots(&self, key: &str) -> Result<Vec<Snapshot>> {
        let (host_id, name) = split_key(key);
        if host_id.is_empty() {
            return self.engine.list_snapshots(name).await;
        }
        self.transport(host_id)?
            .list_remote_snapshots(host_id, name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineSettings, Trigger, UpdateState};
    use crate::guard::InFlightGuard;
    use crate::store::MemoryStore;
    use crate::testing::{container, FakeHooks, FakeRuntime, FakeTransport, RecordingPublisher};
    use crate::types::PendingUpdate;
    use std::time::Duration;

    fn dispatcher(
        runtime: Arc<FakeRuntime>,
        transport: Option<Arc<FakeTransport>>,
    ) -> Dispatcher {
        let engine = Arc::new(UpdateEngine::new(
            runtime.clone(),
            runtime,
            Arc::new(FakeHooks::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(InFlightGuard::new(Duration::from_secs(60))),
            Arc::new(RecordingPublisher::default()),
            EngineSettings::default(),
        ));
        Dispatcher::new(
            engine,
            transport.map(|t| t as Arc<dyn RemoteTransport>),
        )
    }

    fn remote_pending(versions: &[&str]) -> PendingUpdate {
        PendingUpdate {
            container_id: "abc".into(),
            container_name: "web".into(),
            kind: ContainerKind::Container,
            host_id: "edge".into(),
            current_image: "nginx:1.24".into(),
            newer_versions: versions.iter().map(|v| v.to_string()).collect(),
            resolved_current_version: String::new(),
            resolved_target_version: String::new(),
            remote_digest: "sha256:feed".into(),
            detected_at: 0,
        }
    }

    #[test]
    fn routing_is_by_host_then_kind() {
        assert_eq!(route("", ContainerKind::Container), Route::Local);
        assert_eq!(route("", ContainerKind::Service), Route::Service);
        assert_eq!(
            route("edge", ContainerKind::Service),
            Route::Remote("edge".into())
        );
    }

    #[tokio::test]
    async fn local_requests_go_to_the_engine() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add(container("web", "nginx:1.24", &[]));
        let transport = Arc::new(FakeTransport::default());
        let dispatcher = dispatcher(runtime.clone(), Some(transport.clone()));

        let report = dispatcher
            .dispatch(UpdateRequest::manual("id", "web", Some("nginx:1.25".into())))
            .await
            .unwrap();
        assert_eq!(report.state, UpdateState::Completed);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_requests_carry_target_and_digest() {
        let transport = Arc::new(FakeTransport::default());
        let dispatcher = dispatcher(Arc::new(FakeRuntime::new()), Some(transport.clone()));

        dispatcher
            .dispatch(UpdateRequest::from_pending(
                remote_pending(&["1.25"]),
                Trigger::Approved,
            ))
            .await
            .unwrap();
        dispatcher
            .dispatch(UpdateRequest::from_pending(remote_pending(&[]), Trigger::Auto))
            .await
            .unwrap();
        dispatcher.rollback("edge::web").await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![
                "update edge web nginx:1.25 sha256:feed",
                "update edge web - sha256:feed",
                "rollback edge web",
            ]
        );
    }

    #[tokio::test]
    async fn remote_request_without_transport_fails() {
        let dispatcher = dispatcher(Arc::new(FakeRuntime::new()), None);
        let err = dispatcher
            .dispatch(UpdateRequest::manual("id", "edge::web", None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Remote { .. }));
    }
}
