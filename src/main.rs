use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fleet::client::{HttpWorkerClient, ManagerClient};
use fleet::manager::types::{Manager, ManagerServer};
use fleet::tasks::docker::DockerRuntime;
use fleet::tasks::runtime::{ContainerRuntime, MockRuntime};
use fleet::worker::stats::SysinfoMonitor;
use fleet::worker::types::{TaskServer, Worker};

mod cli;

use cli::{Cli, Commands, ManagerArgs, RuntimeKind, TaskCommands, WorkerArgs};

/// How long a node waits for its background activities after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Manager(args) => run_manager(args).await,
        Commands::Worker(args) => run_worker(args).await,
        Commands::Task(TaskCommands::Run(args)) => {
            let client = ManagerClient::new(&args.manager.url, Duration::from_secs(30))?;
            let task_id = client.submit(&args.task()).await?;
            println!("{}", task_id);
            Ok(())
        }
        Commands::Task(TaskCommands::Stop { manager, id }) => {
            let client = ManagerClient::new(&manager.url, Duration::from_secs(30))?;
            client.stop(id).await?;
            println!("stopping {}", id);
            Ok(())
        }
        Commands::Task(TaskCommands::List(manager)) => {
            let client = ManagerClient::new(&manager.url, Duration::from_secs(30))?;
            for task in client.list_tasks().await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    task.id,
                    task.name,
                    task.state,
                    task.container.image.reference(),
                    task.restarts.len()
                );
            }
            Ok(())
        }
        Commands::Workers(manager) => {
            let client = ManagerClient::new(&manager.url, Duration::from_secs(30))?;
            for worker in client.list_workers().await? {
                println!("{}\t{}\t{}", worker.id, worker.addr, worker.task_count);
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn run_manager(args: ManagerArgs) -> Result<()> {
    let config = args.config();
    info!(addr = %config.addr, scheduler = %config.scheduler, "Starting fleet manager");

    let client = Arc::new(HttpWorkerClient::new(
        config.dispatch_timeout,
        config.heartbeat_timeout,
    ));
    let scheduler = config.scheduler.build(client.clone());
    let manager = Arc::new(Manager::new(config.clone(), scheduler, client));

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding manager API to {}", config.addr))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control = tokio::spawn(manager.clone().run(shutdown_rx.clone()));
    let server = tokio::spawn(
        ManagerServer::new(manager, config.addr).start_server(listener, shutdown_rx),
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        let (control, server) = tokio::join!(control, server);
        if let Err(e) = control {
            error!(error = %e, "Control loop panicked");
        }
        match server {
            Ok(Err(e)) => error!(error = %e, "Manager API exited with an error"),
            Err(e) => error!(error = %e, "Manager API panicked"),
            Ok(Ok(())) => {}
        }
    })
    .await
    .is_err()
    {
        warn!("Manager did not shut down in time");
    }

    info!("Manager shutdown complete");
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let config = args.config();
    let public_addr = config.public_addr();

    let runtime: Arc<dyn ContainerRuntime> = match args.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::connect().context("connecting to docker")?),
        RuntimeKind::Mock => Arc::new(MockRuntime::new()),
    };

    // Bound before registering: the manager may dispatch as soon as the
    // worker is known, and those requests wait in the accept backlog.
    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding worker API to {}", config.addr))?;

    let client = ManagerClient::new(&config.manager_url, config.request_timeout)?;
    let worker_id = client
        .register(public_addr)
        .await
        .with_context(|| format!("registering with manager at {}", config.manager_url))?;
    info!(
        worker_id = %worker_id,
        addr = %public_addr,
        runtime = runtime.name(),
        "Registered with manager"
    );

    let worker = Arc::new(Worker::new(
        worker_id,
        public_addr,
        runtime,
        Arc::new(SysinfoMonitor::new()),
        Arc::new(client.clone()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = [
        tokio::spawn(worker.clone().run(shutdown_rx.clone())),
        tokio::spawn(
            worker
                .clone()
                .watch(config.watch_interval, shutdown_rx.clone()),
        ),
    ];
    let server =
        tokio::spawn(TaskServer::new(worker, config.addr).start_server(listener, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if let Err(e) = client.deregister(worker_id).await {
        warn!(worker_id = %worker_id, error = %e, "Failed to deregister from manager");
    }
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker loop panicked");
            }
        }
        if let Ok(Err(e)) = server.await {
            error!(error = %e, "Worker API exited with an error");
        }
    })
    .await;
    if drained.is_err() {
        warn!("Worker did not shut down in time");
    }

    info!("Worker shutdown complete");
    Ok(())
}
