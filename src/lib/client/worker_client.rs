//! Manager side of the manager/worker protocol.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::types::{
    HeartbeatRequest, LagResponse, TransportError, TransportResult, check_status,
};
use crate::scheduler::epvm::ResourceProbe;
use crate::scheduler::types::Resources;
use crate::store::types::{Command, LogIndex};
use crate::tasks::types::Task;

/// Calls the manager makes on a worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn run_task(&self, addr: SocketAddr, task: &Task) -> TransportResult<()>;

    async fn stop_task(&self, addr: SocketAddr, task: &Task) -> TransportResult<()>;

    /// Returns how many commands the worker's replica is missing.
    async fn heartbeat(
        &self,
        addr: SocketAddr,
        last_index: Option<LogIndex>,
    ) -> TransportResult<i64>;

    /// Pushes a log suffix. `TransportError::OutOfSync` carries the lag the
    /// worker reported if it could not apply the suffix.
    async fn push_commands(&self, addr: SocketAddr, commands: &[Command]) -> TransportResult<()>;
}

pub struct HttpWorkerClient {
    client: reqwest::Client,
    dispatch_timeout: Duration,
    heartbeat_timeout: Duration,
}

impl HttpWorkerClient {
    pub fn new(dispatch_timeout: Duration, heartbeat_timeout: Duration) -> Self {
        HttpWorkerClient {
            client: reqwest::Client::new(),
            dispatch_timeout,
            heartbeat_timeout,
        }
    }

    fn url(addr: SocketAddr, path: &str) -> String {
        format!("http://{}{}", addr, path)
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn run_task(&self, addr: SocketAddr, task: &Task) -> TransportResult<()> {
        debug!(addr = %addr, task_id = %task.id, "Sending run request");
        let response = self
            .client
            .post(Self::url(addr, "/tasks"))
            .timeout(self.dispatch_timeout)
            .json(task)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn stop_task(&self, addr: SocketAddr, task: &Task) -> TransportResult<()> {
        debug!(addr = %addr, task_id = %task.id, "Sending stop request");
        let response = self
            .client
            .post(Self::url(addr, "/tasks/stop"))
            .timeout(self.dispatch_timeout)
            .json(task)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        addr: SocketAddr,
        last_index: Option<LogIndex>,
    ) -> TransportResult<i64> {
        let response = self
            .client
            .post(Self::url(addr, "/heartbeat"))
            .timeout(self.heartbeat_timeout)
            .json(&HeartbeatRequest { last_index })
            .send()
            .await?;
        let body: LagResponse = check_status(response).await?.json().await?;
        Ok(body.lag)
    }

    async fn push_commands(&self, addr: SocketAddr, commands: &[Command]) -> TransportResult<()> {
        let response = self
            .client
            .post(Self::url(addr, "/store/commands"))
            .timeout(self.heartbeat_timeout)
            .json(commands)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let body: LagResponse = response.json().await?;
            return Err(TransportError::OutOfSync { lag: body.lag });
        }

        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceProbe for HttpWorkerClient {
    async fn available_resources(&self, addr: SocketAddr) -> anyhow::Result<Resources> {
        let response = self
            .client
            .get(Self::url(addr, "/resources"))
            .timeout(self.heartbeat_timeout)
            .send()
            .await?;
        let resources = check_status(response).await?.json().await?;
        Ok(resources)
    }
}
