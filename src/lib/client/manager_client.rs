//! Client of the manager API, used by workers and the CLI.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::types::{
    RegisterRequest, RegisterResponse, SubmitResponse, TransportResult, WorkerInfo, check_status,
};
use crate::store::types::WorkerId;
use crate::tasks::types::{Task, TaskId};
use crate::worker::types::{Message, MessageSink};

#[derive(Clone)]
pub struct ManagerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ManagerClient {
    pub fn new(base_url: &str, timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ManagerClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Registers a worker reachable at `addr` and returns the id the manager
    /// assigned to it.
    pub async fn register(&self, addr: SocketAddr) -> TransportResult<WorkerId> {
        let response = self
            .client
            .post(self.url("/workers"))
            .json(&RegisterRequest { addr })
            .send()
            .await?;
        let body: RegisterResponse = check_status(response).await?.json().await?;
        Ok(body.worker_id)
    }

    pub async fn deregister(&self, worker_id: WorkerId) -> TransportResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/workers/{}", worker_id)))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn report(&self, message: &Message) -> TransportResult<()> {
        debug!(task_id = %message.task.id, state = %message.task.state, "Reporting task state");
        let response = self
            .client
            .post(self.url("/workers/messages"))
            .json(message)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn submit(&self, task: &Task) -> TransportResult<TaskId> {
        let response = self
            .client
            .post(self.url("/tasks"))
            .json(task)
            .send()
            .await?;
        let body: SubmitResponse = check_status(response).await?.json().await?;
        Ok(body.task_id)
    }

    pub async fn stop(&self, task_id: TaskId) -> TransportResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/tasks/{}", task_id)))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn list_tasks(&self) -> TransportResult<Vec<Task>> {
        let response = self.client.get(self.url("/tasks")).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    pub async fn list_workers(&self) -> TransportResult<Vec<WorkerInfo>> {
        let response = self.client.get(self.url("/workers")).send().await?;
        Ok(check_status(response).await?.json().await?)
    }
}

#[async_trait]
impl MessageSink for ManagerClient {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.report(&message).await?;
        Ok(())
    }
}
