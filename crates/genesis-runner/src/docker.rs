//! Docker-backed container engine using bollard.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use genesis_core::ports::{ContainerEngine, ContainerObservation, ContainerSpec};
use genesis_core::{Error, Result};
use std::collections::HashMap;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Mount target for the shared workspace inside every step container.
const WORKSPACE_TARGET: &str = "/genesis";

/// Upper bound on a single log-draining call so a slow daemon cannot stall
/// a scheduler cycle.
const LOGS_DEADLINE: Duration = Duration::from_secs(5);

/// Container engine backed by a local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the ambient environment (`DOCKER_HOST` or the default
    /// socket).
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Engine(format!("failed to connect to Docker: {e}")))?;
        Ok(Self { docker })
    }

    /// Wrap an existing Docker client.
    pub fn with_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

fn port_bindings(spec: &ContainerSpec) -> Option<HashMap<String, Option<Vec<PortBinding>>>> {
    if spec.ports.is_empty() {
        return None;
    }
    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for mapping in &spec.ports {
        bindings.insert(
            format!("{}/{}", mapping.container, mapping.protocol),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(mapping.host.to_string()),
            }]),
        );
    }
    Some(bindings)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(spec.workspace.display().to_string()),
                target: Some(WORKSPACE_TARGET.to_string()),
                read_only: Some(true),
                ..Default::default()
            }]),
            port_bindings: port_bindings(spec),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                Error::Engine(format!(
                    "failed to create container for image '{}': {e}",
                    spec.image
                ))
            })?;

        debug!(container = %created.id, image = %spec.image, "Created step container");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Engine(format!("failed to start container {id}: {e}")))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerObservation> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Engine(format!("failed to inspect container {id}: {e}")))?;

        let state = match response.state {
            Some(state) => state,
            None => return Ok(ContainerObservation::Running),
        };

        // Anything short of an exit counts as still running.
        if state.status == Some(ContainerStateStatusEnum::EXITED) {
            Ok(ContainerObservation::Exited {
                exit_code: state.exit_code.unwrap_or(0),
            })
        } else {
            Ok(ContainerObservation::Running)
        }
    }

    async fn stream_logs(&self, id: &str) -> Result<()> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));

        let drain = async {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        let line = String::from_utf8_lossy(&message);
                        info!(container = %id, "{}", line.trim_end());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container = %id, error = %e, "Error reading container logs");
                        break;
                    }
                }
            }
        };

        if timeout(LOGS_DEADLINE, drain).await.is_err() {
            warn!(container = %id, "Timed out draining container logs");
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            link: false,
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| Error::Engine(format!("failed to remove container {id}: {e}")))
    }
}
