use std::collections::HashMap;

use async_trait::async_trait;

use super::types::{Scheduler, SchedulerError, SchedulerResult, sorted_ids};
use crate::store::types::{WorkerEntry, WorkerId};
use crate::tasks::types::Task;

/// Always picks the smallest worker id. Deterministic, handy for tests.
#[derive(Debug, Default)]
pub struct AlwaysFirst;

#[async_trait]
impl Scheduler for AlwaysFirst {
    fn name(&self) -> &'static str {
        "always-first"
    }

    async fn select_worker(
        &mut self,
        _task: &Task,
        workers: &HashMap<WorkerId, WorkerEntry>,
    ) -> SchedulerResult<(WorkerId, WorkerEntry)> {
        let id = sorted_ids(workers)
            .into_iter()
            .next()
            .ok_or(SchedulerError::NoWorkersAvailable)?;
        Ok((id, workers[&id].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::test_support::{task, workers};

    #[tokio::test]
    async fn picks_lexicographically_smallest_id() {
        let workers = workers(5);
        let smallest = workers.keys().map(|id| id.to_string()).min().unwrap();

        let mut scheduler = AlwaysFirst;
        for _ in 0..3 {
            let (id, _) = scheduler
                .select_worker(&task(0.5, 1024), &workers)
                .await
                .unwrap();
            assert_eq!(id.to_string(), smallest);
        }
    }

    #[tokio::test]
    async fn empty_candidates_are_an_error() {
        let err = AlwaysFirst
            .select_worker(&task(0.5, 1024), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::NoWorkersAvailable);
    }
}
