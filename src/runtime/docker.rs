use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EndpointSettings, Service};
use bollard::service::{InspectServiceOptions, ListServicesOptions, UpdateServiceOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};

use super::{CheckOutcome, ContainerLister, ImageMutator, RegistryChecker};
use crate::error::{EngineError, Result};
use crate::types::{image_repository, image_tag, ContainerInfo, ContainerKind};

/// Suffix given to the previous container while its replacement starts.
const OLD_SUFFIX: &str = "-sentinel-old";
/// Set on task containers that belong to a Swarm service.
const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.id";

pub struct DockerRuntime {
    docker: Docker,
    stop_timeout: Duration,
}

impl DockerRuntime {
    pub fn connect(stop_timeout: Duration) -> anyhow::Result<Self> {
        // Unix socket on Linux, named pipe on Windows, or DOCKER_HOST.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            stop_timeout,
        })
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!("Pulling {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull {}: {}", image, status);
                    }
                }
                Err(e) => {
                    error!("Failed to pull {}: {}", image, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn list_services(&self) -> Vec<ContainerInfo> {
        match self
            .docker
            .list_services(None::<ListServicesOptions<String>>)
            .await
        {
            Ok(services) => services.into_iter().filter_map(service_info).collect(),
            Err(e) => {
                // Expected when the daemon is not a Swarm manager.
                debug!("Not listing services: {}", e);
                Vec::new()
            }
        }
    }

    async fn create_replacement(
        &self,
        name: &str,
        target_image: &str,
        current: ContainerInspectResponse,
    ) -> Result<()> {
        let config = replacement_config(current, target_image);
        let options = CreateContainerOptions {
            name,
            platform: None,
        };
        let created = self.docker.create_container(Some(options), config).await?;
        for warning in created.warnings {
            warn!("Creating {}: {}", name, warning);
        }
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Digest the running image was pulled under, looked up by image ID.
    async fn running_digest(&self, image_id: &str, image: &str) -> String {
        if image_id.is_empty() {
            return String::new();
        }
        match self.docker.inspect_image(image_id).await {
            Ok(detail) => repo_digest(&detail.repo_digests.unwrap_or_default(), image)
                .unwrap_or_default(),
            Err(e) => {
                debug!("Could not inspect image {} of {}: {}", image_id, image, e);
                String::new()
            }
        }
    }

    /// Puts the previous container back under its own name and starts it.
    async fn restore(&self, name: &str, old_name: &str) {
        let force = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(force)).await {
            debug!("No replacement to clean up for {}: {}", name, e);
        }
        let rename = RenameContainerOptions { name };
        if let Err(e) = self.docker.rename_container(old_name, rename).await {
            error!("Could not rename {} back to {}: {}", old_name, name, e);
            return;
        }
        if let Err(e) = self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            error!("Could not restart previous {}: {}", name, e);
        }
    }
}

#[async_trait]
impl ContainerLister for DockerRuntime {
    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;
        let mut digests: HashMap<(String, String), String> = HashMap::new();
        let mut found = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let image_id = summary.image_id.clone().unwrap_or_default();
            let Some(mut info) = container_info(summary) else {
                continue;
            };
            let lookup = (image_id, info.image.clone());
            let known = digests.get(&lookup).cloned();
            info.image_digest = match known {
                Some(digest) => digest,
                None => {
                    let digest = self.running_digest(&lookup.0, &lookup.1).await;
                    digests.insert(lookup, digest.clone());
                    digest
                }
            };
            found.push(info);
        }
        found.extend(self.list_services().await);
        Ok(found)
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => {
                let image_id = detail.image.clone().unwrap_or_default();
                let mut info = inspected_info(name, detail)?;
                info.image_digest = self.running_digest(&image_id, &info.image).await;
                Ok(info)
            }
            Err(_) => {
                let service = self
                    .docker
                    .inspect_service(name, None::<InspectServiceOptions>)
                    .await
                    .map_err(|_| EngineError::NotFound(name.to_string()))?;
                service_info(service).ok_or_else(|| EngineError::NotFound(name.to_string()))
            }
        }
    }
}

#[async_trait]
impl ImageMutator for DockerRuntime {
    async fn recreate_container(&self, name: &str, target_image: &str) -> Result<()> {
        // A failed pull leaves the running container untouched.
        self.pull(target_image).await?;
        let current = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;

        let old_name = format!("{}{}", name, OLD_SUFFIX);
        let stop = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };
        self.docker.stop_container(name, Some(stop)).await?;
        let rename = RenameContainerOptions {
            name: old_name.as_str(),
        };
        if let Err(e) = self.docker.rename_container(name, rename).await {
            if let Err(restart) = self
                .docker
                .start_container(name, None::<StartContainerOptions<String>>)
                .await
            {
                error!("Could not restart {} after failed rename: {}", name, restart);
            }
            return Err(e.into());
        }

        match self.create_replacement(name, target_image, current).await {
            Ok(()) => {
                let remove = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                if let Err(e) = self.docker.remove_container(&old_name, Some(remove)).await {
                    warn!("Could not remove previous container {}: {}", old_name, e);
                }
                info!("Recreated {} with {}", name, target_image);
                Ok(())
            }
            Err(e) => {
                warn!("Replacement of {} failed, restoring: {}", name, e);
                self.restore(name, &old_name).await;
                Err(e)
            }
        }
    }

    async fn update_service(&self, name: &str, target_image: &str) -> Result<()> {
        let service = self
            .docker
            .inspect_service(name, None::<InspectServiceOptions>)
            .await?;
        let version = service
            .version
            .and_then(|v| v.index)
            .ok_or_else(|| EngineError::Runtime(format!("service {} has no version", name)))?;
        let mut spec = service
            .spec
            .ok_or_else(|| EngineError::Runtime(format!("service {} has no spec", name)))?;
        spec.task_template
            .get_or_insert_with(Default::default)
            .container_spec
            .get_or_insert_with(Default::default)
            .image = Some(target_image.to_string());

        let options = UpdateServiceOptions {
            version,
            ..Default::default()
        };
        let response = self.docker.update_service(name, spec, options, None).await?;
        for warning in response.warnings.unwrap_or_default() {
            warn!("Updating service {}: {}", name, warning);
        }
        info!("Service {} now targets {}", name, target_image);
        Ok(())
    }
}

/// Digest-only check: compares the registry's current manifest with the
/// digests the local image was pulled under. Scans go through
/// [`RegistryChecker::check_container`], which judges each container by the
/// digest it reports instead. Version discovery needs a registry client and
/// is not done here.
#[async_trait]
impl RegistryChecker for DockerRuntime {
    async fn check(&self, image_ref: &str) -> Result<CheckOutcome> {
        let remote = self.docker.inspect_registry_image(image_ref, None).await?;
        let Some(remote_digest) = remote.descriptor.digest else {
            return Ok(CheckOutcome::default());
        };
        let local_digests = match self.docker.inspect_image(image_ref).await {
            Ok(image) => image.repo_digests.unwrap_or_default(),
            Err(e) => {
                debug!("{} not present locally: {}", image_ref, e);
                Vec::new()
            }
        };
        let current = local_digests
            .iter()
            .any(|d| d.rsplit('@').next() == Some(remote_digest.as_str()));
        Ok(CheckOutcome {
            update_available: !current,
            newer_versions: Vec::new(),
            resolved_current_version: image_tag(image_ref).unwrap_or("latest").to_string(),
            resolved_target_version: String::new(),
            remote_digest,
        })
    }
}

fn container_info(summary: ContainerSummary) -> Option<ContainerInfo> {
    let labels = summary.labels.unwrap_or_default();
    if labels.contains_key(SWARM_SERVICE_LABEL) {
        return None;
    }
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())?;
    Some(ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name,
        kind: ContainerKind::Container,
        image: summary.image.unwrap_or_default(),
        labels,
        host_id: String::new(),
        state: summary.state.unwrap_or_default(),
        image_digest: String::new(),
    })
}

fn inspected_info(name: &str, detail: ContainerInspectResponse) -> Result<ContainerInfo> {
    let config = detail
        .config
        .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
    Ok(ContainerInfo {
        id: detail.id.unwrap_or_default(),
        name: detail
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name.to_string()),
        kind: ContainerKind::Container,
        image: config.image.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        host_id: String::new(),
        state: detail
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default(),
        image_digest: String::new(),
    })
}

fn service_info(service: Service) -> Option<ContainerInfo> {
    let spec = service.spec?;
    let name = spec.name?;
    let image = spec
        .task_template
        .and_then(|t| t.container_spec)
        .and_then(|c| c.image)
        .unwrap_or_default();
    Some(ContainerInfo {
        id: service.id.unwrap_or_default(),
        name,
        kind: ContainerKind::Service,
        image: strip_digest(&image).to_string(),
        labels: spec.labels.unwrap_or_default(),
        host_id: String::new(),
        state: "running".to_string(),
        image_digest: image
            .split_once('@')
            .map(|(_, digest)| digest.to_string())
            .unwrap_or_default(),
    })
}

/// Swarm pins service images as `repo:tag@sha256:...`.
fn strip_digest(image: &str) -> &str {
    image.split('@').next().unwrap_or(image)
}

/// Picks the digest `image` was pulled under out of an image's
/// `repo@sha256:...` entries.
fn repo_digest(repo_digests: &[String], image: &str) -> Option<String> {
    let repository = hub_short_name(image_repository(image));
    repo_digests
        .iter()
        .filter_map(|entry| entry.split_once('@'))
        .find(|(repo, _)| hub_short_name(repo) == repository)
        .map(|(_, digest)| digest.to_string())
}

/// Docker Hub repositories may be written with or without
/// `docker.io/library/`.
fn hub_short_name(repository: &str) -> &str {
    let repository = repository.strip_prefix("docker.io/").unwrap_or(repository);
    repository.strip_prefix("library/").unwrap_or(repository)
}

/// Same configuration, networks and host settings as the running container,
/// with the image swapped.
fn replacement_config(current: ContainerInspectResponse, target_image: &str) -> Config<String> {
    let id = current.id.unwrap_or_default();
    let mut config: Config<String> = current.config.map(Config::from).unwrap_or_default();
    config.image = Some(target_image.to_string());
    // Docker defaults the hostname to the short ID; let the new one get its own.
    if let Some(hostname) = &config.hostname {
        if !hostname.is_empty() && id.starts_with(hostname.as_str()) {
            config.hostname = None;
        }
    }
    config.host_config = current.host_config;
    config.networking_config = current
        .network_settings
        .and_then(|settings| settings.networks)
        .map(|networks| NetworkingConfig {
            endpoints_config: networks
                .into_iter()
                .map(|(network, endpoint)| (network, reusable_endpoint(endpoint)))
                .collect::<HashMap<_, _>>(),
        });
    config
}

/// Keeps what the operator configured and drops addresses Docker assigned.
fn reusable_endpoint(endpoint: EndpointSettings) -> EndpointSettings {
    EndpointSettings {
        aliases: endpoint.aliases,
        links: endpoint.links,
        ipam_config: endpoint.ipam_config,
        driver_opts: endpoint.driver_opts,
        ..Default::default()
    }
}
