//! Container runtime interface used by workers.
//!
//! The manager never talks to a runtime; it only learns about containers
//! through the messages workers send back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use super::types::ContainerSpec;

pub const TYPE_LABEL_KEY: &str = "com.fleet.type";
pub const TYPE_LABEL_VALUE: &str = "container";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub status: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Pulls, creates and starts a container, returning its runtime id.
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;

    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Containers started by fleet.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    async fn container_state(&self, container_id: &str) -> Result<ContainerState>;
}

/// In-memory runtime for development and tests.
#[derive(Default)]
pub struct MockRuntime {
    counter: AtomicU64,
    fail_starts: bool,
    containers: Mutex<HashMap<String, (ContainerSpec, ContainerState)>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime whose `run` always fails, as if the image could not be pulled.
    pub fn failing() -> Self {
        MockRuntime {
            fail_starts: true,
            ..Default::default()
        }
    }

    /// Simulates the container's process exiting.
    pub async fn exit(&self, container_id: &str, exit_code: i64) {
        if let Some((_, state)) = self.containers.lock().await.get_mut(container_id) {
            state.status = "exited".to_string();
            state.running = false;
            state.exit_code = Some(exit_code);
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_starts {
            anyhow::bail!("mock runtime configured to fail");
        }

        let id = format!("mock_{:08x}", self.counter.fetch_add(1, Ordering::SeqCst));
        info!(container_id = %id, image = %spec.image.reference(), "[MOCK] Starting container");

        let state = ContainerState {
            status: "running".to_string(),
            running: true,
            exit_code: None,
        };
        self.containers
            .lock()
            .await
            .insert(id.clone(), (spec.clone(), state));
        Ok(id)
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "[MOCK] Stopping container");
        match self.containers.lock().await.remove(container_id) {
            Some(_) => Ok(()),
            None => anyhow::bail!("no such container: {}", container_id),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let containers = self.containers.lock().await;
        Ok(containers
            .iter()
            .map(|(id, (spec, state))| ContainerSummary {
                id: id.clone(),
                image: spec.image.reference(),
                status: state.status.clone(),
            })
            .collect())
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        match self.containers.lock().await.get(container_id) {
            Some((_, state)) => Ok(state.clone()),
            None => anyhow::bail!("no such container: {}", container_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::Image;

    #[tokio::test]
    async fn mock_runtime_tracks_container_lifecycle() {
        let runtime = MockRuntime::new();
        let id = runtime
            .run(&ContainerSpec::new(Image::parse("busybox")))
            .await
            .unwrap();

        assert!(runtime.container_state(&id).await.unwrap().running);
        assert_eq!(runtime.list_containers().await.unwrap().len(), 1);

        runtime.exit(&id, 137).await;
        let state = runtime.container_state(&id).await.unwrap();
        assert!(!state.running);
        assert_eq!(state.exit_code, Some(137));

        runtime.stop(&id).await.unwrap();
        assert!(runtime.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_runtime_refuses_to_start() {
        let runtime = MockRuntime::failing();
        assert!(runtime
            .run(&ContainerSpec::new(Image::parse("busybox")))
            .await
            .is_err());
    }
}
