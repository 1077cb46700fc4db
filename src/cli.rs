//! Command-line surface of the `fleet` binary.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use fleet::config::{ManagerConfig, WorkerConfig};
use fleet::scheduler::SchedulerKind;
use fleet::tasks::types::{ContainerSpec, Image, RequiredResources, RestartPolicy, Task};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "fleet", version, about = "A small container orchestrator")]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "FLEET_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a manager node.
    Manager(ManagerArgs),
    /// Run a worker node.
    Worker(WorkerArgs),
    /// Submit, stop and list tasks.
    #[command(subcommand)]
    Task(TaskCommands),
    /// List registered workers.
    Workers(ManagerUrl),
}

#[derive(Debug, Args)]
pub struct ManagerUrl {
    /// Base URL of the manager API.
    #[arg(long = "manager", env = "FLEET_MANAGER", default_value = "http://127.0.0.1:7878")]
    pub url: String,
}

#[derive(Debug, Args)]
pub struct ManagerArgs {
    #[arg(long, env = "FLEET_ADDR", default_value = "0.0.0.0:7878")]
    pub addr: SocketAddr,

    /// Placement policy: always-first, round-robin, best-fit or worst-fit.
    #[arg(long, env = "FLEET_SCHEDULER", default_value = "round-robin")]
    pub scheduler: SchedulerKind,

    #[arg(long, env = "FLEET_HEARTBEAT_INTERVAL_SECS", default_value_t = 5)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "FLEET_HEARTBEAT_TIMEOUT_SECS", default_value_t = 2)]
    pub heartbeat_timeout_secs: u64,

    /// Runs longer than this reset the restart backoff.
    #[arg(long, env = "FLEET_LONG_UPTIME_SECS", default_value_t = 60)]
    pub long_uptime_secs: u64,

    #[arg(long, env = "FLEET_MAX_BACKOFF_SECS", default_value_t = 300)]
    pub max_backoff_secs: u64,

    /// Give up on a task after this many failed placements.
    #[arg(long, env = "FLEET_MAX_PLACEMENT_ATTEMPTS")]
    pub max_placement_attempts: Option<u32>,
}

impl ManagerArgs {
    pub fn config(&self) -> ManagerConfig {
        ManagerConfig {
            addr: self.addr,
            scheduler: self.scheduler,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            long_uptime: Duration::from_secs(self.long_uptime_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            max_placement_attempts: self.max_placement_attempts,
            ..ManagerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuntimeKind {
    Docker,
    Mock,
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    #[arg(long, env = "FLEET_ADDR", default_value = "127.0.0.1:7879")]
    pub addr: SocketAddr,

    /// Address the manager uses to reach this worker, if not `--addr`.
    #[arg(long, env = "FLEET_ADVERTISE_ADDR")]
    pub advertise_addr: Option<SocketAddr>,

    #[command(flatten)]
    pub manager: ManagerUrl,

    #[arg(long, env = "FLEET_RUNTIME", value_enum, default_value_t = RuntimeKind::Docker)]
    pub runtime: RuntimeKind,

    #[arg(long, env = "FLEET_WATCH_INTERVAL_SECS", default_value_t = 5)]
    pub watch_interval_secs: u64,
}

impl WorkerArgs {
    pub fn config(&self) -> WorkerConfig {
        WorkerConfig {
            addr: self.addr,
            advertise_addr: self.advertise_addr,
            manager_url: self.manager.url.clone(),
            watch_interval: Duration::from_secs(self.watch_interval_secs),
            ..WorkerConfig::default()
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum TaskCommands {
    /// Submit a task.
    Run(RunArgs),
    /// Stop a running task.
    Stop {
        #[command(flatten)]
        manager: ManagerUrl,
        id: uuid::Uuid,
    },
    /// List tasks known to the manager.
    List(ManagerUrl),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RestartArg {
    Always,
    OnFailure,
    Never,
}

impl From<RestartArg> for RestartPolicy {
    fn from(arg: RestartArg) -> Self {
        match arg {
            RestartArg::Always => RestartPolicy::Always,
            RestartArg::OnFailure => RestartPolicy::OnFailure,
            RestartArg::Never => RestartPolicy::Never,
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub manager: ManagerUrl,

    /// Image reference, e.g. `nginx:1.27`.
    #[arg(long)]
    pub image: String,

    /// Task name, defaults to the image repository.
    #[arg(long)]
    pub name: Option<String>,

    /// CPU cores the task needs.
    #[arg(long, default_value_t = 0.0)]
    pub cpu: f64,

    /// Memory the task needs, in MiB.
    #[arg(long, default_value_t = 0)]
    pub memory: u64,

    /// Container port to expose. Repeatable.
    #[arg(long = "port")]
    pub ports: Vec<u16>,

    /// `KEY=VALUE` environment entry. Repeatable.
    #[arg(long = "env")]
    pub env: Vec<String>,

    #[arg(long, value_enum, default_value_t = RestartArg::Never)]
    pub restart: RestartArg,
}

impl RunArgs {
    pub fn task(&self) -> Task {
        let image = Image::parse(&self.image);
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| image.repository.clone());

        let mut container = ContainerSpec::new(image);
        container.exposed_ports = self.ports.clone();
        container.env = self.env.clone();
        container.restart_policy = self.restart.into();
        container.required = RequiredResources {
            cpu: self.cpu,
            memory: self.memory * MIB,
        };
        Task::new(name, container)
    }
}
