pub mod always_first;
pub mod epvm;
pub mod round_robin;
pub mod scheduler;
pub mod types;

pub use scheduler::SchedulerKind;
pub use types::{Resources, Scheduler, SchedulerError};
