//! Tuning knobs for the manager and worker nodes.

use std::net::SocketAddr;
use std::time::Duration;

use crate::scheduler::SchedulerKind;

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Address the manager's HTTP API listens on.
    pub addr: SocketAddr,

    pub scheduler: SchedulerKind,

    /// Time between two heartbeat rounds.
    pub heartbeat_interval: Duration,

    /// Deadline for a heartbeat or catch-up push before the worker is
    /// considered dead.
    pub heartbeat_timeout: Duration,

    /// Timeout for run/stop requests sent to workers.
    pub dispatch_timeout: Duration,

    /// A run longer than this resets the restart backoff.
    pub long_uptime: Duration,

    /// Upper bound for a single backoff delay.
    pub max_backoff: Duration,

    /// Sleep used while waiting for workers to register.
    pub idle_poll_interval: Duration,

    /// Pause before retrying an event whose placement failed.
    pub requeue_delay: Duration,

    /// Drop an event after this many failed placements. `None` retries forever.
    pub max_placement_attempts: Option<u32>,

    /// How many times a catch-up push is resent when the worker answers with
    /// a lag, before waiting for the next heartbeat.
    pub catchup_retries: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 7878)),
            scheduler: SchedulerKind::default(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(2),
            dispatch_timeout: Duration::from_secs(30),
            long_uptime: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
            idle_poll_interval: Duration::from_millis(100),
            requeue_delay: Duration::from_secs(1),
            max_placement_attempts: None,
            catchup_retries: 3,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address the worker's HTTP API listens on.
    pub addr: SocketAddr,

    /// Address other nodes use to reach this worker, when it differs from
    /// `addr` (e.g. when listening on 0.0.0.0).
    pub advertise_addr: Option<SocketAddr>,

    /// Base URL of the manager API.
    pub manager_url: String,

    /// How often running containers are checked for exits.
    pub watch_interval: Duration,

    /// Timeout for requests to the manager.
    pub request_timeout: Duration,
}

impl WorkerConfig {
    pub fn public_addr(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.addr)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 7879)),
            advertise_addr: None,
            manager_url: "http://127.0.0.1:7878".to_string(),
            watch_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}
