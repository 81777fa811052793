//! Cluster agent transport.
//!
//! Remote hosts run their own sentinel in agent mode. The controller talks
//! to them with newline-delimited JSON over TCP; every message is wrapped in
//! an envelope carrying a hex HMAC-SHA256 of the payload keyed with the
//! shared cluster secret, and rejected if the tag does not verify.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::dispatch::Dispatcher;
use crate::engine::{Trigger, UpdateReport, UpdateRequest};
use crate::error::{EngineError, Result};
use crate::runtime::ContainerLister;
use crate::snapshot::Snapshot;
use crate::types::{composite_key, split_key, ContainerInfo};

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn update_remote_container(
        &self,
        host_id: &str,
        name: &str,
        target_image: Option<&str>,
        target_digest: Option<&str>,
    ) -> Result<UpdateReport>;

    async fn rollback_remote_container(&self, host_id: &str, name: &str) -> Result<UpdateReport>;

    async fn list_remote_containers(&self, host_id: &str) -> Result<Vec<ContainerInfo>>;

    async fn list_remote_snapshots(&self, host_id: &str, name: &str) -> Result<Vec<Snapshot>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentRequest {
    Update {
        name: String,
        target_image: Option<String>,
        target_digest: Option<String>,
    },
    Rollback {
        name: String,
    },
    List,
    Snapshots {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResponse {
    Report { report: UpdateReport },
    Containers { containers: Vec<ContainerInfo> },
    Snapshots { snapshots: Vec<Snapshot> },
    Busy { name: String },
    RollbackFailed { name: String, reason: String },
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    payload: String,
    signature: String,
}

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::validation("cluster_secret", e.to_string()))
}

/// Hex HMAC-SHA256 of `payload` keyed with the cluster secret.
pub fn sign(secret: &str, payload: &str) -> Result<String> {
    let mut mac = mac(secret)?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex tag produced by [`sign`].
pub fn verify(secret: &str, payload: &str, signature: &str) -> Result<()> {
    let rejected = || {
        EngineError::validation("signature", "message was not signed with the cluster secret")
    };
    let tag = hex::decode(signature).map_err(|_| rejected())?;
    let mut mac = mac(secret)?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&tag).map_err(|_| rejected())
}

/// Serializes and signs one message as a single line.
fn seal<T: Serialize>(secret: &str, message: &T) -> Result<String> {
    let payload = serde_json::to_string(message)?;
    let envelope = Envelope {
        signature: sign(secret, &payload)?,
        payload,
    };
    let mut line = serde_json::to_string(&envelope)?;
    line.push('\n');
    Ok(line)
}

/// Verifies and decodes one line.
fn unseal<T: DeserializeOwned>(secret: &str, line: &str) -> Result<T> {
    let envelope: Envelope = serde_json::from_str(line.trim())?;
    verify(secret, &envelope.payload, &envelope.signature)?;
    Ok(serde_json::from_str(&envelope.payload)?)
}

/// Client side: one short-lived connection per request.
#[derive(Debug, Clone)]
pub struct TcpAgentTransport {
    hosts: HashMap<String, String>,
    secret: String,
    timeout: Duration,
}

impl TcpAgentTransport {
    pub fn new(hosts: HashMap<String, String>, secret: String, timeout: Duration) -> Self {
        Self {
            hosts,
            secret,
            timeout,
        }
    }

    pub fn host_ids(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.hosts.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    async fn call(&self, host_id: &str, request: &AgentRequest) -> Result<AgentResponse> {
        let remote = |reason: String| EngineError::Remote {
            host: host_id.to_string(),
            reason,
        };
        let addr = self
            .hosts
            .get(host_id)
            .ok_or_else(|| remote("no agent address configured".into()))?;

        let exchange = async {
            let mut stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| remote(format!("connect to {}: {}", addr, e)))?;
            stream
                .write_all(seal(&self.secret, request)?.as_bytes())
                .await
                .map_err(|e| remote(e.to_string()))?;
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .map_err(|e| remote(e.to_string()))?;
            if line.is_empty() {
                return Err(remote("agent closed the connection".into()));
            }
            unseal(&self.secret, &line)
        };

        match timeout(self.timeout, exchange).await {
            Ok(response) => response,
            Err(_) => Err(remote(format!("no answer within {:?}", self.timeout))),
        }
    }

    fn into_report(host_id: &str, response: AgentResponse) -> Result<UpdateReport> {
        match response {
            AgentResponse::Report { mut report } => {
                report.key = composite_key(host_id, &report.key);
                Ok(report)
            }
            AgentResponse::Busy { name } => {
                Err(EngineError::UpdateInProgress(composite_key(host_id, &name)))
            }
            AgentResponse::RollbackFailed { name, reason } => Err(EngineError::RollbackFailed {
                name: composite_key(host_id, &name),
                reason,
            }),
            AgentResponse::Error { message } => Err(EngineError::Remote {
                host: host_id.to_string(),
                reason: message,
            }),
            other => Err(EngineError::Remote {
                host: host_id.to_string(),
                reason: format!("unexpected reply to an update: {:?}", other),
            }),
        }
    }
}

#[async_trait]
impl RemoteTransport for TcpAgentTransport {
    async fn update_remote_container(
        &self,
        host_id: &str,
        name: &str,
        target_image: Option<&str>,
        target_digest: Option<&str>,
    ) -> Result<UpdateReport> {
        let request = AgentRequest::Update {
            name: name.to_string(),
            target_image: target_image.map(str::to_string),
            target_digest: target_digest.map(str::to_string),
        };
        let response = self.call(host_id, &request).await?;
        Self::into_report(host_id, response)
    }

    async fn rollback_remote_container(&self, host_id: &str, name: &str) -> Result<UpdateReport> {
        let request = AgentRequest::Rollback {
            name: name.to_string(),
        };
        let response = self.call(host_id, &request).await?;
        Self::into_report(host_id, response)
    }

    async fn list_remote_containers(&self, host_id: &str) -> Result<Vec<ContainerInfo>> {
        match self.call(host_id, &AgentRequest::List).await? {
            AgentResponse::Containers { containers } => Ok(containers),
            AgentResponse::Error { message } => Err(EngineError::Remote {
                host: host_id.to_string(),
                reason: message,
            }),
            other => Err(EngineError::Remote {
                host: host_id.to_string(),
                reason: format!("unexpected reply to list: {:?}", other),
            }),
        }
    }

    async fn list_remote_snapshots(&self, host_id: &str, name: &str) -> Result<Vec<Snapshot>> {
        let request = AgentRequest::Snapshots {
            name: name.to_string(),
        };
        match self.call(host_id, &request).await? {
            AgentResponse::Snapshots { snapshots } => Ok(snapshots),
            AgentResponse::Error { message } => Err(EngineError::Remote {
                host: host_id.to_string(),
                reason: message,
            }),
            other => Err(EngineError::Remote {
                host: host_id.to_string(),
                reason: format!("unexpected reply to snapshots: {:?}", other),
            }),
        }
    }
}

fn respond(result: Result<UpdateReport>) -> AgentResponse {
    match result {
        Ok(report) => AgentResponse::Report { report },
        Err(EngineError::UpdateInProgress(name)) => AgentResponse::Busy { name },
        Err(EngineError::RollbackFailed { name, reason }) => {
            AgentResponse::RollbackFailed { name, reason }
        }
        Err(e) => AgentResponse::Error {
            message: e.to_string(),
        },
    }
}

/// Agent side: executes requests against this host's engine.
pub struct AgentServer {
    dispatcher: Arc<Dispatcher>,
    lister: Arc<dyn ContainerLister>,
    secret: String,
}

impl AgentServer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        lister: Arc<dyn ContainerLister>,
        secret: String,
    ) -> Self {
        Self {
            dispatcher,
            lister,
            secret,
        }
    }

    pub async fn handle_line(&self, line: &str) -> AgentResponse {
        let request: AgentRequest = match unseal(&self.secret, line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected agent request: {}", e);
                return AgentResponse::Error {
                    message: e.to_string(),
                };
            }
        };
        debug!("Agent request: {:?}", request);

        match request {
            AgentRequest::Update {
                name,
                target_image,
                target_digest,
            } => {
                let mut request = UpdateRequest::manual("", &name, target_image);
                request.trigger = Trigger::Approved;
                request.target_digest = target_digest;
                respond(self.dispatcher.dispatch(request).await)
            }
            AgentRequest::Rollback { name } => respond(self.dispatcher.rollback(&name).await),
            AgentRequest::List => match self.lister.list().await {
                Ok(containers) => AgentResponse::Containers { containers },
                Err(e) => AgentResponse::Error {
                    message: e.to_string(),
                },
            },
            AgentRequest::Snapshots { name } => {
                match self.dispatcher.engine().list_snapshots(&name).await {
                    Ok(snapshots) => AgentResponse::Snapshots { snapshots },
                    Err(e) => AgentResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
        }
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Cluster agent listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!("Agent connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line).await;
            write.write_all(seal(&self.secret, &response)?.as_bytes()).await?;
        }
        Ok(())
    }
}

/// Local containers plus every configured remote host's containers, each
/// stamped with its host ID. Unreachable hosts are skipped for this scan.
pub struct FleetLister {
    local: Arc<dyn ContainerLister>,
    transport: Arc<dyn RemoteTransport>,
    hosts: Vec<String>,
}

impl FleetLister {
    pub fn new(
        local: Arc<dyn ContainerLister>,
        transport: Arc<dyn RemoteTransport>,
        hosts: Vec<String>,
    ) -> Self {
        Self {
            local,
            transport,
            hosts,
        }
    }
}

#[async_trait]
impl ContainerLister for FleetLister {
    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let mut containers = self.local.list().await?;
        for host in &self.hosts {
            match self.transport.list_remote_containers(host).await {
                Ok(remote) => containers.extend(remote.into_iter().map(|mut c| {
                    c.host_id = host.clone();
                    c
                })),
                Err(e) => warn!("Skipping host {} this scan: {}", host, e),
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, key: &str) -> Result<ContainerInfo> {
        let (host, name) = split_key(key);
        if host.is_empty() {
            return self.local.inspect(name).await;
        }
        self.transport
            .list_remote_containers(host)
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .map(|mut c| {
                c.host_id = host.to_string();
                c
            })
            .ok_or_else(|| EngineError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineSettings, UpdateEngine, UpdateState};
    use crate::guard::InFlightGuard;
    use crate::store::MemoryStore;
    use crate::testing::{container, FakeHooks, FakeRuntime, FakeTransport, RecordingPublisher};

    const SECRET: &str = "correct horse battery staple";

    fn agent(runtime: Arc<FakeRuntime>) -> (Arc<AgentServer>, Arc<InFlightGuard>) {
        let guard = Arc::new(InFlightGuard::new(Duration::from_secs(60)));
        let engine = Arc::new(UpdateEngine::new(
            runtime.clone(),
            runtime.clone(),
            Arc::new(FakeHooks::default()),
            Arc::new(MemoryStore::new()),
            guard.clone(),
            Arc::new(RecordingPublisher::default()),
            EngineSettings::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(engine, None));
        (
            Arc::new(AgentServer::new(dispatcher, runtime, SECRET.to_string())),
            guard,
        )
    }

    async fn spawn_agent(server: Arc<AgentServer>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(server.serve(listener));
        addr
    }

    fn transport(addr: &str, secret: &str) -> TcpAgentTransport {
        TcpAgentTransport::new(
            HashMap::from([("edge".to_string(), addr.to_string())]),
            secret.to_string(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let line = seal(SECRET, &AgentRequest::List).unwrap();
        assert_eq!(unseal::<AgentRequest>(SECRET, &line).unwrap(), AgentRequest::List);
        assert!(unseal::<AgentRequest>("other secret", &line).is_err());

        let tampered = line.replace("list", "rollback");
        assert!(unseal::<AgentRequest>(SECRET, &tampered).is_err());
    }

    #[test]
    fn forged_signatures_are_rejected() {
        let payload = serde_json::to_string(&AgentRequest::List).unwrap();
        let signature = sign(SECRET, &payload).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify(SECRET, &payload, &signature).is_ok());

        // Flip the last nibble of an otherwise valid tag.
        let mut forged = signature.clone();
        let last = if forged.ends_with('0') { "1" } else { "0" };
        forged.replace_range(63.., last);
        assert!(verify(SECRET, &payload, &forged).is_err());

        assert!(verify(SECRET, &payload, &signature[..32]).is_err());
        assert!(verify(SECRET, &payload, "not hex at all").is_err());

        let envelope = serde_json::to_string(&Envelope {
            payload,
            signature: forged,
        })
        .unwrap();
        let err = unseal::<AgentRequest>(SECRET, &envelope).unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "signature"));
    }

    #[tokio::test]
    async fn remote_update_runs_on_the_agent_engine() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add(container("web", "nginx:1.24", &[]));
        let (server, _) = agent(runtime.clone());
        let addr = spawn_agent(server).await;
        let client = transport(&addr, SECRET);

        let report = client
            .update_remote_container("edge", "web", Some("nginx:1.25"), Some("sha256:feed"))
            .await
            .unwrap();
        assert_eq!(report.state, UpdateState::Completed);
        assert_eq!(report.key, "edge::web");
        assert_eq!(runtime.image_of("web"), "nginx:1.25");

        let snapshots = client.list_remote_snapshots("edge", "web").await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].image, "nginx:1.24");

        let rolled = client.rollback_remote_container("edge", "web").await.unwrap();
        assert_eq!(rolled.state, UpdateState::RolledBack);
        assert_eq!(runtime.image_of("web"), "nginx:1.24");

        let listed = client.list_remote_containers("edge").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn remote_busy_maps_to_update_in_progress() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add(container("web", "nginx:1.24", &[]));
        let (server, guard) = agent(runtime);
        let addr = spawn_agent(server).await;
        let _lease = guard.try_acquire("web").unwrap();

        let err = transport(&addr, SECRET)
            .update_remote_container("edge", "web", None, None)
            .await
            .unwrap_err();
        assert!(err.is_busy());
        assert_eq!(err.to_string(), "update already in progress for edge::web");
    }

    #[tokio::test]
    async fn wrong_secret_is_refused() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add(container("web", "nginx:1.24", &[]));
        let (server, _) = agent(runtime.clone());
        let addr = spawn_agent(server).await;

        // The agent answers with its own signature, which the client
        // cannot verify either.
        let err = transport(&addr, "guess")
            .update_remote_container("edge", "web", Some("nginx:1.25"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert_eq!(runtime.image_of("web"), "nginx:1.24");
    }

    #[tokio::test]
    async fn unknown_host_is_a_remote_error() {
        let err = transport("127.0.0.1:1", SECRET)
            .list_remote_containers("nowhere")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Remote { .. }));
    }

    #[tokio::test]
    async fn fleet_lister_stamps_hosts_and_skips_unreachable_ones() {
        let local = Arc::new(FakeRuntime::new());
        local.add(container("web", "nginx:1.24", &[]));
        let transport = Arc::new(FakeTransport::default());
        transport
            .containers
            .lock()
            .unwrap()
            .insert("edge".into(), vec![container("web", "nginx:1.24", &[])]);

        let fleet = FleetLister::new(
            local,
            transport,
            vec!["edge".to_string(), "offline".to_string()],
        );
        let keys: Vec<String> = fleet.list().await.unwrap().iter().map(ContainerInfo::key).collect();
        assert_eq!(keys, vec!["web", "edge::web"]);
        assert_eq!(fleet.inspect("edge::web").await.unwrap().host_id, "edge");
        assert!(fleet.inspect("edge::db").await.is_err());
    }
}
