use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::client::WorkerClient;
use crate::client::types::TransportError;
use crate::config::ManagerConfig;
use crate::queue::{DelayQueue, WorkQueue};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::Store;
use crate::store::types::StoreError;
use crate::tasks::types::{Event, TaskError, TaskId};
use crate::worker::types::Message;

/// Control loop of the cluster. Owns the store and the scheduler; everything
/// it decides ends up as commands in the store or requests to workers.
pub struct Manager {
    pub store: Store,
    pub scheduler: Mutex<Box<dyn Scheduler>>,
    pub workers: Arc<dyn WorkerClient>,
    /// Desired-state changes waiting for the event loop.
    pub events: WorkQueue<Event>,
    /// Events held back by a backoff or a failed placement.
    pub delayed: Mutex<DelayQueue<Event>>,
    /// Worker reports waiting for the message loop.
    pub messages: WorkQueue<Message>,
    pub config: ManagerConfig,
}

/// HTTP front of the manager.
pub struct ManagerServer {
    pub manager: Arc<Manager>,
    pub addr: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("task {0} was already submitted")]
    DuplicateTask(TaskId),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
