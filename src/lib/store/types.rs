use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::types::{Task, TaskId};

pub type WorkerId = Uuid;

/// Position of a command in the log. The first command has index 0.
pub type LogIndex = u64;

/// A worker as recorded in the store's projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub addr: SocketAddr,
    #[serde(default)]
    pub tasks: HashMap<TaskId, Task>,
}

impl WorkerEntry {
    pub fn new(addr: SocketAddr) -> Self {
        WorkerEntry {
            addr,
            tasks: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommandKind {
    SetWorker {
        worker_id: WorkerId,
        worker: WorkerEntry,
    },
    RemoveWorker {
        worker_id: WorkerId,
    },
    SetTask {
        worker_id: WorkerId,
        task: Task,
    },
    RemoveTask {
        task_id: TaskId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub index: LogIndex,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(index: LogIndex, kind: CommandKind) -> Self {
        Command { index, kind }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `gap` is `index - 1 - last_index`; negative for an already applied index.
    #[error("log is out of sync (gap {gap})")]
    LogOutOfSync { gap: i64 },

    #[error("worker {0} not found")]
    WorkerNotFound(WorkerId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),
}

pub type StoreResult<T> = Result<T, StoreError>;
