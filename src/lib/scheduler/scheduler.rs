use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::always_first::AlwaysFirst;
use super::epvm::{Epvm, EpvmStrategy, ResourceProbe};
use super::round_robin::RoundRobin;
use super::types::Scheduler;

/// Placement policy chosen when the manager starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    AlwaysFirst,
    #[default]
    RoundRobin,
    BestFit,
    WorstFit,
}

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 4] = [
        SchedulerKind::AlwaysFirst,
        SchedulerKind::RoundRobin,
        SchedulerKind::BestFit,
        SchedulerKind::WorstFit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::AlwaysFirst => "always-first",
            SchedulerKind::RoundRobin => "round-robin",
            SchedulerKind::BestFit => "best-fit",
            SchedulerKind::WorstFit => "worst-fit",
        }
    }

    /// `probe` is only used by the resource-aware policies.
    pub fn build(self, probe: Arc<dyn ResourceProbe>) -> Box<dyn Scheduler> {
        match self {
            SchedulerKind::AlwaysFirst => Box::new(AlwaysFirst),
            SchedulerKind::RoundRobin => Box::new(RoundRobin::new()),
            SchedulerKind::BestFit => Box::new(Epvm::new(EpvmStrategy::BestFit, probe)),
            SchedulerKind::WorstFit => Box::new(Epvm::new(EpvmStrategy::WorstFit, probe)),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SchedulerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown scheduler: {}", s))
    }
}
