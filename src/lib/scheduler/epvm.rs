//! Enhanced PVM placement.
//!
//! Each candidate is charged `L^before - L^after` where `before` is the
//! worker's available memory and `after` what would be left once the task is
//! placed, both in GiB. Best-fit takes the highest cost, worst-fit the lowest.
//! Candidates are scanned in id order and the first of equal costs wins.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::types::{Resources, Scheduler, SchedulerError, SchedulerResult, sorted_ids};
use crate::store::types::{WorkerEntry, WorkerId};
use crate::tasks::types::{RequiredResources, Task};

pub const LIEB: f64 = 1.539600717839002;

const BYTES_PER_GIB: f64 = (1u64 << 30) as f64;

/// Asks a worker for its currently available resources.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn available_resources(&self, addr: SocketAddr) -> anyhow::Result<Resources>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpvmStrategy {
    BestFit,
    WorstFit,
}

pub struct Epvm {
    strategy: EpvmStrategy,
    probe: Arc<dyn ResourceProbe>,
}

impl Epvm {
    pub fn new(strategy: EpvmStrategy, probe: Arc<dyn ResourceProbe>) -> Self {
        Epvm { strategy, probe }
    }

    async fn query_resources(
        &self,
        ids: &[WorkerId],
        workers: &HashMap<WorkerId, WorkerEntry>,
    ) -> Vec<(WorkerId, Resources)> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let addr = workers[id].addr;
            match self.probe.available_resources(addr).await {
                Ok(resources) => found.push((*id, resources)),
                Err(e) => {
                    warn!(
                        worker_id = %id,
                        addr = %addr,
                        error = %e,
                        "Failed to query worker resources"
                    );
                }
            }
        }
        found
    }
}

fn is_capable(required: &RequiredResources, resources: &Resources) -> bool {
    resources.memory.available >= required.memory && resources.cpu.cores as f64 >= required.cpu
}

/// Natural log of `L^before - L^after`, written as
/// `before * ln L + ln(1 - L^-required)` so it stays finite on hosts with
/// terabytes of free memory. The log keeps the ordering of the raw cost.
pub fn cost(required: &RequiredResources, resources: &Resources) -> f64 {
    let before = resources.memory.available as f64 / BYTES_PER_GIB;
    let required = required.memory as f64 / BYTES_PER_GIB;
    before * LIEB.ln() + (-LIEB.powf(-required)).ln_1p()
}

fn pick(costs: &[(WorkerId, f64)], strategy: EpvmStrategy) -> Option<WorkerId> {
    let mut best: Option<(WorkerId, f64)> = None;
    for &(id, cost) in costs {
        let better = match (best, strategy) {
            (None, _) => true,
            (Some((_, current)), EpvmStrategy::BestFit) => cost > current,
            (Some((_, current)), EpvmStrategy::WorstFit) => cost < current,
        };
        if better {
            best = Some((id, cost));
        }
    }
    best.map(|(id, _)| id)
}

#[async_trait]
impl Scheduler for Epvm {
    fn name(&self) -> &'static str {
        match self.strategy {
            EpvmStrategy::BestFit => "best-fit",
            EpvmStrategy::WorstFit => "worst-fit",
        }
    }

    async fn select_worker(
        &mut self,
        task: &Task,
        workers: &HashMap<WorkerId, WorkerEntry>,
    ) -> SchedulerResult<(WorkerId, WorkerEntry)> {
        if workers.is_empty() {
            return Err(SchedulerError::NoWorkersAvailable);
        }

        let required = task.container.required;
        let ids = sorted_ids(workers);
        let costs: Vec<(WorkerId, f64)> = self
            .query_resources(&ids, workers)
            .await
            .into_iter()
            .filter(|(_, resources)| is_capable(&required, resources))
            .map(|(id, resources)| (id, cost(&required, &resources)))
            .collect();

        debug!(
            task_id = %task.id,
            candidates = workers.len(),
            capable = costs.len(),
            "Computed placement costs"
        );

        let id = pick(&costs, self.strategy).ok_or(SchedulerError::NoCapableWorkers)?;
        Ok((id, workers[&id].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::test_support::{task, workers};
    use crate::scheduler::types::{CpuStat, MemoryStat};

    const GIB: u64 = 1 << 30;

    struct FixedProbe(HashMap<SocketAddr, Resources>);

    #[async_trait]
    impl ResourceProbe for FixedProbe {
        async fn available_resources(&self, addr: SocketAddr) -> anyhow::Result<Resources> {
            self.0
                .get(&addr)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unreachable"))
        }
    }

    fn resources(cores: u64, memory: u64) -> Resources {
        Resources {
            cpu: CpuStat { cores, usage: 0.0 },
            memory: MemoryStat {
                total: memory,
                available: memory,
            },
            ..Default::default()
        }
    }

    /// Workers with (cores, available memory) assigned in id order.
    fn cluster(
        specs: &[(u64, u64)],
    ) -> (HashMap<WorkerId, WorkerEntry>, Vec<WorkerId>, Arc<FixedProbe>) {
        let workers = workers(specs.len() as u16);
        let ids = sorted_ids(&workers);
        let probe = ids
            .iter()
            .zip(specs)
            .map(|(id, (cores, memory))| (workers[id].addr, resources(*cores, *memory)))
            .collect();
        (workers, ids, Arc::new(FixedProbe(probe)))
    }

    #[tokio::test]
    async fn never_picks_an_incapable_worker() {
        let (workers, ids, probe) = cluster(&[(1, 8 * GIB), (8, GIB / 2), (4, 4 * GIB)]);
        let task = task(2.0, GIB);

        for strategy in [EpvmStrategy::BestFit, EpvmStrategy::WorstFit] {
            let mut scheduler = Epvm::new(strategy, probe.clone());
            let (id, _) = scheduler.select_worker(&task, &workers).await.unwrap();
            assert_eq!(id, ids[2]);
        }
    }

    #[tokio::test]
    async fn best_fit_takes_highest_cost_and_worst_fit_lowest() {
        let (workers, ids, probe) = cluster(&[(4, 2 * GIB), (4, 6 * GIB), (4, 4 * GIB)]);
        let task = task(1.0, GIB);

        let costs: Vec<f64> = [2 * GIB, 6 * GIB, 4 * GIB]
            .iter()
            .map(|memory| cost(&task.container.required, &resources(4, *memory)))
            .collect();
        assert!(costs[1] > costs[2] && costs[2] > costs[0]);

        let mut best = Epvm::new(EpvmStrategy::BestFit, probe.clone());
        assert_eq!(best.select_worker(&task, &workers).await.unwrap().0, ids[1]);

        let mut worst = Epvm::new(EpvmStrategy::WorstFit, probe);
        assert_eq!(worst.select_worker(&task, &workers).await.unwrap().0, ids[0]);
    }

    #[tokio::test]
    async fn costs_stay_ordered_on_large_hosts() {
        let (workers, ids, probe) = cluster(&[(4, 2000 * GIB), (4, 4000 * GIB)]);
        let task = task(1.0, GIB);

        let large = cost(&task.container.required, &resources(4, 4000 * GIB));
        assert!(large.is_finite());

        let mut best = Epvm::new(EpvmStrategy::BestFit, probe.clone());
        assert_eq!(best.select_worker(&task, &workers).await.unwrap().0, ids[1]);

        let mut worst = Epvm::new(EpvmStrategy::WorstFit, probe);
        assert_eq!(worst.select_worker(&task, &workers).await.unwrap().0, ids[0]);
    }

    #[tokio::test]
    async fn reports_why_nothing_was_picked() {
        let (workers, _, probe) = cluster(&[(1, GIB), (1, GIB)]);
        let mut scheduler = Epvm::new(EpvmStrategy::BestFit, probe.clone());

        let err = scheduler
            .select_worker(&task(4.0, GIB), &workers)
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::NoCapableWorkers);

        let err = scheduler
            .select_worker(&task(0.5, GIB), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::NoWorkersAvailable);
    }

    #[tokio::test]
    async fn unreachable_workers_are_skipped() {
        let (mut workers, ids, probe) = cluster(&[(4, 4 * GIB)]);
        let stranger = uuid::Uuid::new_v4();
        workers.insert(
            stranger,
            WorkerEntry::new(SocketAddr::from(([10, 0, 0, 1], 9000))),
        );

        let mut scheduler = Epvm::new(EpvmStrategy::WorstFit, probe);
        let (id, _) = scheduler
            .select_worker(&task(1.0, GIB), &workers)
            .await
            .unwrap();
        assert_eq!(id, ids[0]);
    }
}
