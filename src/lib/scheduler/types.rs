use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::types::{WorkerEntry, WorkerId};
use crate::tasks::types::Task;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStat {
    pub cores: u64,
    /// Percent of total CPU time in use.
    pub usage: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStat {
    pub total: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStat {
    pub total: u64,
    pub available: u64,
}

/// Resources a worker reports as currently available. Sizes are in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: CpuStat,
    pub memory: MemoryStat,
    pub disk: DiskStat,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("no worker has enough resources for the task")]
    NoCapableWorkers,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Placement policy. Implementations only read `workers`.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn select_worker(
        &mut self,
        task: &Task,
        workers: &HashMap<WorkerId, WorkerEntry>,
    ) -> SchedulerResult<(WorkerId, WorkerEntry)>;
}

/// Candidate ids in ascending order. The byte order of a `Uuid` matches the
/// lexicographic order of its hyphenated lowercase form.
pub fn sorted_ids(workers: &HashMap<WorkerId, WorkerEntry>) -> Vec<WorkerId> {
    let mut ids: Vec<WorkerId> = workers.keys().copied().collect();
    ids.sort();
    ids
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;

    use super::*;
    use crate::tasks::types::{ContainerSpec, Image};

    pub fn workers(n: u16) -> HashMap<WorkerId, WorkerEntry> {
        (0..n)
            .map(|i| {
                let addr = SocketAddr::from(([127, 0, 0, 1], 7000 + i));
                (uuid::Uuid::new_v4(), WorkerEntry::new(addr))
            })
            .collect()
    }

    pub fn task(cpu: f64, memory: u64) -> Task {
        let mut task = Task::new("job", ContainerSpec::new(Image::parse("busybox")));
        task.container.required.cpu = cpu;
        task.container.required.memory = memory;
        task
    }
}
