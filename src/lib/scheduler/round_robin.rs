use std::collections::HashMap;

use async_trait::async_trait;

use super::types::{Scheduler, SchedulerError, SchedulerResult, sorted_ids};
use crate::store::types::{WorkerEntry, WorkerId};
use crate::tasks::types::Task;

/// Cycles through the candidates in id order.
///
/// Holds a cursor, so callers must serialize `select_worker`.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Scheduler for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    async fn select_worker(
        &mut self,
        _task: &Task,
        workers: &HashMap<WorkerId, WorkerEntry>,
    ) -> SchedulerResult<(WorkerId, WorkerEntry)> {
        let ids = sorted_ids(workers);
        if ids.is_empty() {
            return Err(SchedulerError::NoWorkersAvailable);
        }

        let next = match self.last {
            Some(last) if last + 1 < ids.len() => last + 1,
            _ => 0,
        };
        self.last = Some(next);

        let id = ids[next];
        Ok((id, workers[&id].clone()))
    }
}
