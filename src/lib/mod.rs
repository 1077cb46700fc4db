//! fleet: a small container orchestrator.
//!
//! A manager accepts tasks, places them on workers with a pluggable
//! scheduler and records every placement in a replicated command log.
//! Workers run the tasks in containers and report what they observe.

pub mod client;
pub mod config;
pub mod manager;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod worker;
