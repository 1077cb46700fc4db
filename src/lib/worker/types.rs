use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::queue::WorkQueue;
use crate::scheduler::types::Resources;
use crate::store::Store;
use crate::store::types::{StoreError, WorkerId};
use crate::tasks::runtime::ContainerRuntime;
use crate::tasks::types::{Event, Task, TaskError, TaskId};

/// A worker's report of what it observed for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: WorkerId,
    pub task: Task,
}

/// Where a worker sends its reports.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: Message) -> anyhow::Result<()>;
}

/// Current resources of the host a worker runs on.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn resources(&self) -> Resources;
}

pub struct Worker {
    pub id: WorkerId,
    pub addr: SocketAddr,
    /// Run and stop requests waiting for the run loop.
    pub queue: WorkQueue<Event>,
    /// Tasks this worker has accepted, keyed by id.
    pub db: Mutex<HashMap<TaskId, Task>>,
    /// Read-only replica of the manager's store.
    pub store: Store,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub monitor: Arc<dyn ResourceMonitor>,
    pub sink: Arc<dyn MessageSink>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    InvalidStateTransition(#[from] TaskError),

    #[error("task {0} is not known to this worker")]
    UnknownTask(TaskId),

    #[error("task {0} has no container")]
    NoContainer(TaskId),

    #[error("container runtime error: {0}")]
    Runtime(#[source] anyhow::Error),

    #[error("replica is missing {lag} commands")]
    OutOfSync { lag: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// HTTP front of a worker.
pub struct TaskServer {
    pub worker: Arc<Worker>,
    pub addr: SocketAddr,
}
