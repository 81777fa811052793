//! Sentinel daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use sentinel::config::Config;
use sentinel::controller::Controller;
use sentinel::dispatch::Dispatcher;
use sentinel::engine::UpdateEngine;
use sentinel::events::{BroadcastPublisher, EventPublisher, LogPublisher};
use sentinel::guard::InFlightGuard;
use sentinel::hooks::ShellHookRunner;
use sentinel::remote::{AgentServer, FleetLister, RemoteTransport, TcpAgentTransport};
use sentinel::runtime::{ContainerLister, DockerRuntime};
use sentinel::store::{FileStore, SettingsStore};
use sentinel::worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting Sentinel: default policy {}, scanning every {:?}, {} remote hosts",
        cfg.default_policy,
        cfg.scan_interval(),
        cfg.remote_hosts.len()
    );
    if cfg.uses_default_secret() && (cfg.agent_bind.is_some() || !cfg.remote_hosts.is_empty()) {
        warn!("Using the default cluster secret; set SENTINEL_CLUSTER_SECRET");
    }

    let docker = Arc::new(DockerRuntime::connect(cfg.stop_timeout())?);
    let store: Arc<dyn SettingsStore> = Arc::new(FileStore::open(&cfg.state_file).await?);
    let events = Arc::new(BroadcastPublisher::new(256));
    let guard = Arc::new(InFlightGuard::new(cfg.lease_ttl()));

    let engine = Arc::new(UpdateEngine::new(
        docker.clone(),
        docker.clone(),
        Arc::new(ShellHookRunner),
        Arc::clone(&store),
        guard,
        events.clone(),
        cfg.engine_settings(),
    ));

    // Remote hosts are reached through their agents
    let (lister, transport): (Arc<dyn ContainerLister>, Option<Arc<dyn RemoteTransport>>) =
        if cfg.remote_hosts.is_empty() {
            (docker.clone() as Arc<dyn ContainerLister>, None)
        } else {
            let transport = Arc::new(TcpAgentTransport::new(
                cfg.remote_hosts.clone(),
                cfg.cluster_secret.clone(),
                cfg.remote_timeout(),
            ));
            let hosts = transport.host_ids();
            info!("Managing remote hosts: {:?}", hosts);
            (
                Arc::new(FleetLister::new(docker.clone(), transport.clone(), hosts))
                    as Arc<dyn ContainerLister>,
                Some(transport as Arc<dyn RemoteTransport>),
            )
        };

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&engine), transport));
    let controller = Arc::new(Controller::new(
        lister,
        docker.clone(),
        dispatcher,
        Arc::clone(&store),
        events.clone(),
        cfg.default_policy,
        WorkerPool::new(cfg.workers, cfg.job_capacity),
    ));
    controller.restore_queue().await?;

    // Event log
    let mut subscription = events.subscribe();
    let events_handle = tokio::spawn(async move {
        loop {
            match subscription.recv().await {
                Ok(event) => LogPublisher.publish(event),
                Err(RecvError::Lagged(missed)) => warn!("Event log skipped {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Periodic scan
    let scanner = Arc::clone(&controller);
    let mut interval = tokio::time::interval(cfg.scan_interval());
    let scan_handle = tokio::spawn(async move {
        loop {
            interval.tick().await;
            if let Err(e) = scanner.scan().await {
                error!("Scan failed: {}", e);
            }
        }
    });

    // Cluster agent
    let agent_handle = match cfg.agent_bind {
        Some(bind) => {
            let listener = TcpListener::bind(bind).await?;
            let server = Arc::new(AgentServer::new(
                Arc::new(Dispatcher::new(engine, None)),
                docker,
                cfg.cluster_secret.clone(),
            ));
            Some(tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    error!("Cluster agent failed: {}", e);
                }
            }))
        }
        None => None,
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    scan_handle.abort();
    events_handle.abort();
    if let Some(handle) = agent_handle {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}
