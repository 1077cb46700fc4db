use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
};
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use super::runtime::{
    ContainerRuntime, ContainerState, ContainerSummary, TYPE_LABEL_KEY, TYPE_LABEL_VALUE,
};
use super::types::{ContainerSpec, RestartPolicy as TaskRestartPolicy};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let client =
            Docker::connect_with_local_defaults().context("failed to connect to docker daemon")?;
        Ok(DockerRuntime { client })
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        info!(image = %reference, "Pulling image");

        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: reference.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            let info = msg.with_context(|| format!("failed to pull image {}", reference))?;
            if let Some(status) = info.status {
                debug!(image = %reference, status = %status, "Pull progress");
            }
        }

        info!(image = %reference, "Image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        // Docker applies its own restart policy on top of ours, so it is
        // only forwarded for `always`; fleet handles the failure cases.
        let restart_policy = RestartPolicy {
            name: Some(match spec.restart_policy {
                TaskRestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
                TaskRestartPolicy::OnFailure | TaskRestartPolicy::Never => {
                    RestartPolicyNameEnum::NO
                }
            }),
            maximum_retry_count: None,
        };

        let port_bindings = spec
            .exposed_ports
            .iter()
            .map(|port| {
                let binding = PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                };
                (format!("{}/tcp", port), Some(vec![binding]))
            })
            .collect();

        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            nano_cpus: Some((spec.required.cpu * 1_000_000_000.0) as i64),
            memory: Some(spec.required.memory as i64),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let mut labels = spec.labels.clone();
        labels.insert(TYPE_LABEL_KEY.to_string(), TYPE_LABEL_VALUE.to_string());

        let container_config = Config {
            image: Some(spec.image.reference()),
            env: Some(spec.env.clone()),
            labels: Some(labels),
            exposed_ports: Some(
                spec.exposed_ports
                    .iter()
                    .map(|port| (format!("{}/tcp", port), HashMap::new()))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await
            .context("failed to create container")?;

        debug!(container_id = %response.id, "Container created");
        Ok(response.id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let reference = spec.image.reference();
        self.pull_image(&reference).await?;

        let id = self.create_container(spec).await?;
        self.client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("failed to start container {}", id))?;

        info!(container_id = %id, image = %reference, "Container started");
        Ok(id)
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "Stopping container");
        self.client
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .with_context(|| format!("failed to stop container {}", container_id))?;

        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("failed to remove container {}", container_id))?;

        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", TYPE_LABEL_KEY, TYPE_LABEL_VALUE)],
        );

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: c.state.unwrap_or_default(),
            })
            .collect())
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        let response = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("failed to inspect container {}", container_id))?;

        let state = response
            .state
            .with_context(|| format!("container {} has no state", container_id))?;

        Ok(ContainerState {
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }
}
