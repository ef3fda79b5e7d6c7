use super::{
    ContainerEngine, CreateRequest, Inspection, ManagedContainer, LABEL_HOST, LABEL_MANAGED,
    LABEL_SPEC,
};
use crate::error::EngineError;
use crate::types::{split_tag, EngineHandle, HostId, Mount, ObservedState};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;

/// Seconds bollard waits on the socket before giving up on its own.
const SOCKET_TIMEOUT_SECS: u64 = 120;

pub struct DockerEngine {
    docker: Docker,
    network: Option<String>,
}

impl DockerEngine {
    /// Connect to the engine socket, or to the local defaults
    /// (`DOCKER_HOST`, then the unix socket) when none is given.
    pub fn connect(socket: Option<&str>, network: Option<String>) -> Result<Self, EngineError> {
        let docker = match socket {
            Some(path) => {
                Docker::connect_with_socket(path, SOCKET_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(map_error)?;
        Ok(Self { docker, network })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, req: CreateRequest<'_>) -> Result<EngineHandle, EngineError> {
        let opts = CreateContainerOptions {
            name: req.name.to_string(),
            platform: None,
        };
        let config = container_config(&req, self.network.as_deref())?;
        let created = self
            .docker
            .create_container(Some(opts), config)
            .await
            .map_err(map_error)?;
        for warning in &created.warnings {
            debug!("Engine warning creating {}: {}", req.name, warning);
        }
        info!("Created container {} ({})", req.name, created.id);
        Ok(EngineHandle {
            name: req.name.to_string(),
            id: Some(created.id),
        })
    }

    async fn start(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        match self
            .docker
            .start_container(&handle.name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already running
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn stop(&self, handle: &EngineHandle, grace: Duration) -> Result<(), EngineError> {
        let opts = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(&handle.name, Some(opts)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn kill(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let opts = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(&handle.name, Some(opts)).await {
            Ok(()) => Ok(()),
            // 409: not running any more
            Err(BollardError::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&handle.name, Some(opts))
            .await
            .map_err(map_error)
    }

    async fn inspect(&self, handle: &EngineHandle) -> Result<Inspection, EngineError> {
        match self
            .docker
            .inspect_container(&handle.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => inspection_from(&handle.name, detail),
            // Removed out of band, or never created
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(Inspection::absent())
            }
            Err(e) => Err(map_error(e)),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                self.pull(image).await
            }
            Err(e) => Err(map_error(e)),
        }
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        let (repository, tag) = split_tag(image);
        info!("Pulling image {}", image);
        let opts = CreateImageOptions {
            from_image: repository.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull {}: {}", image, status);
                    }
                }
                Err(e) => return Err(map_error(e)),
            }
        }
        info!("Pulled image {}", image);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        let wanted = tagged(image);
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![wanted.clone()]);
        let opts = ListImagesOptions::<String> {
            filters,
            ..Default::default()
        };
        let images = self.docker.list_images(Some(opts)).await.map_err(map_error)?;
        Ok(images.iter().any(|i| {
            i.repo_tags.iter().any(|t| *t == wanted) || i.repo_digests.iter().any(|d| *d == wanted)
        }))
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        );
        let opts = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(map_error)?;

        let mut managed = Vec::new();
        for c in containers {
            let host = c
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_HOST))
                .cloned();
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string());
            let (host, name) = match (host, name) {
                (Some(h), Some(n)) => (h, n),
                _ => continue,
            };
            managed.push(ManagedContainer {
                host_id: HostId::new(host),
                handle: EngineHandle { name, id: c.id },
            });
        }
        Ok(managed)
    }

    async fn version(&self) -> Result<String, EngineError> {
        let version = self.docker.version().await.map_err(map_error)?;
        Ok(version.version.unwrap_or_else(|| "unknown".into()))
    }
}

fn container_config(
    req: &CreateRequest<'_>,
    network: Option<&str>,
) -> Result<ContainerConfig<String>, EngineError> {
    let spec = req.spec;

    let mut labels = HashMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_HOST.to_string(), req.host_id.to_string());
    labels.insert(LABEL_SPEC.to_string(), req.spec_digest.to_string());

    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let binds: Vec<String> = spec.mounts.iter().map(bind).collect();

    let memory = spec
        .memory_mb
        .map(|mb| scaled(mb, 1024 * 1024, "memory limit"))
        .transpose()?;
    let nano_cpus = spec
        .cpu_millis
        .map(|m| scaled(m, 1_000_000, "cpu limit"))
        .transpose()?;

    let host_config = HostConfig {
        memory,
        nano_cpus,
        binds: if binds.is_empty() { None } else { Some(binds) },
        network_mode: network.map(str::to_string),
        ..Default::default()
    };

    Ok(ContainerConfig {
        image: Some(spec.image_ref()),
        env: if env.is_empty() { None } else { Some(env) },
        cmd: spec.command.clone(),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// `image` in the form the engine lists it: `repo:tag`, or the digest
/// reference unchanged.
fn tagged(image: &str) -> String {
    match split_tag(image) {
        (repository, "") => repository.to_string(),
        (repository, tag) => format!("{}:{}", repository, tag),
    }
}

/// `value * unit` as the engine's signed integer, refusing to wrap.
fn scaled(value: u64, unit: u64, what: &str) -> Result<i64, EngineError> {
    value
        .checked_mul(unit)
        .and_then(|v| i64::try_from(v).ok())
        .ok_or_else(|| EngineError::failed(format!("{} {} is out of range", what, value)))
}

fn bind(mount: &Mount) -> String {
    if mount.read_only {
        format!("{}:{}:ro", mount.source, mount.target)
    } else {
        format!("{}:{}", mount.source, mount.target)
    }
}

fn inspection_from(name: &str, detail: ContainerInspectResponse) -> Result<Inspection, EngineError> {
    let status = detail.state.as_ref().and_then(|s| s.status);
    let state = observed_from_status(status)
        .ok_or_else(|| EngineError::unrecognized(format!("{} reported state {:?}", name, status)))?;
    let spec_digest = detail
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|l| l.get(LABEL_SPEC))
        .cloned();
    Ok(Inspection {
        state,
        handle: Some(EngineHandle {
            name: name.to_string(),
            id: detail.id,
        }),
        spec_digest,
    })
}

fn observed_from_status(status: Option<ContainerStateStatusEnum>) -> Option<ObservedState> {
    match status? {
        // A paused container still holds its resources; stop handles it
        ContainerStateStatusEnum::RUNNING
        | ContainerStateStatusEnum::RESTARTING
        | ContainerStateStatusEnum::PAUSED => Some(ObservedState::Running),
        ContainerStateStatusEnum::CREATED
        | ContainerStateStatusEnum::EXITED
        | ContainerStateStatusEnum::DEAD
        | ContainerStateStatusEnum::REMOVING => Some(ObservedState::Stopped),
        ContainerStateStatusEnum::EMPTY => None,
    }
}

fn map_error(e: BollardError) -> EngineError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::not_found(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::failed(format!("{} (status {})", message, status_code)),
        BollardError::RequestTimeoutError => EngineError::timeout(
            "request",
            Duration::from_secs(SOCKET_TIMEOUT_SECS),
        ),
        e @ (BollardError::JsonDataError { .. } | BollardError::JsonSerdeError { .. }) => {
            EngineError::unrecognized(e.to_string())
        }
        other => EngineError::failed(other.to_string()),
    }
}
