use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::types::{Manager, ManagerError, ManagerResult};
use crate::client::WorkerClient;
use crate::client::types::{TransportError, WorkerInfo};
use crate::config::ManagerConfig;
use crate::queue::{DelayQueue, WorkQueue};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::store::types::{Command, CommandKind, StoreError, WorkerEntry, WorkerId};
use crate::tasks::restart::{backoff_delay, restart_kind};
use crate::tasks::types::{DesiredState, Event, RestartPolicy, State, Task, TaskId};
use crate::worker::types::Message;

impl Manager {
    pub fn new(
        config: ManagerConfig,
        scheduler: Box<dyn Scheduler>,
        workers: Arc<dyn WorkerClient>,
    ) -> Self {
        debug!(scheduler = scheduler.name(), "Creating manager");
        Manager {
            store: Store::new(),
            scheduler: Mutex::new(scheduler),
            workers,
            events: WorkQueue::new(),
            delayed: Mutex::new(DelayQueue::new()),
            messages: WorkQueue::new(),
            config,
        }
    }

    async fn commit(&self, kind: CommandKind) -> ManagerResult<Command> {
        let cmd = self.store.append(kind).await?;
        debug!(index = cmd.index, "Appended command");
        Ok(cmd)
    }

    pub async fn register_worker(&self, addr: SocketAddr) -> ManagerResult<WorkerId> {
        let worker_id = Uuid::new_v4();
        self.commit(CommandKind::SetWorker {
            worker_id,
            worker: WorkerEntry::new(addr),
        })
        .await?;
        info!(worker_id = %worker_id, addr = %addr, "Worker registered");
        Ok(worker_id)
    }

    /// Graceful leave. The worker's tasks are placed elsewhere.
    pub async fn deregister_worker(&self, worker_id: WorkerId) -> ManagerResult<usize> {
        info!(worker_id = %worker_id, "Worker leaving");
        self.evict_worker(worker_id).await
    }

    /// Accepts a task and queues it for placement. Placement happens later,
    /// so this only fails for a task that is already known.
    pub async fn submit(&self, mut task: Task) -> ManagerResult<TaskId> {
        if self.store.get_task(task.id).await.is_ok() {
            return Err(ManagerError::DuplicateTask(task.id));
        }

        task.state = State::Pending;
        let task_id = task.id;
        info!(task_id = %task_id, image = %task.container.image.reference(), "Task submitted");
        self.events.push(Event::new(task, DesiredState::Running)).await;
        Ok(task_id)
    }

    /// Stops a placed task. A task waiting out a restart backoff is no longer
    /// in the store; its pending restart is cancelled instead.
    pub async fn stop(&self, task_id: TaskId) -> ManagerResult<()> {
        match self.store.get_task(task_id).await {
            Ok(task) => {
                info!(task_id = %task_id, "Stop requested");
                self.events.push(Event::new(task, DesiredState::Finished)).await;
                Ok(())
            }
            Err(StoreError::TaskNotFound(_)) => {
                let cancelled = self
                    .delayed
                    .lock()
                    .await
                    .cancel(|event| event.task.id == task_id);
                if cancelled == 0 {
                    return Err(StoreError::TaskNotFound(task_id).into());
                }
                info!(task_id = %task_id, "Cancelled pending restart");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn report(&self, message: Message) {
        self.messages.push(message).await;
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks = self.store.all_tasks().await;
        tasks.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        tasks
    }

    pub async fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .store
            .all_workers()
            .await
            .into_iter()
            .map(|(id, worker)| WorkerInfo {
                id,
                addr: worker.addr,
                task_count: worker.tasks.len(),
            })
            .collect();
        workers.sort_by_key(|worker| worker.id);
        workers
    }

    /// Removes a worker and queues a fresh placement for every task it held.
    /// Returns how many tasks were queued.
    pub async fn evict_worker(&self, worker_id: WorkerId) -> ManagerResult<usize> {
        let (cmd, entry) = self.store.remove_worker(worker_id).await?;
        warn!(
            worker_id = %worker_id,
            index = cmd.index,
            tasks = entry.tasks.len(),
            "Worker removed"
        );

        let count = entry.tasks.len();
        for mut task in entry.tasks.into_values() {
            task.state = State::Pending;
            task.container_id = None;
            self.events.push(Event::new(task, DesiredState::Running)).await;
        }
        Ok(count)
    }

    /// Eviction triggered by a failed call. A worker already gone is fine.
    async fn evict_unreachable(&self, worker_id: WorkerId, reason: &TransportError) {
        warn!(worker_id = %worker_id, error = %reason, "Worker unreachable");
        match self.evict_worker(worker_id).await {
            Ok(_) | Err(ManagerError::Store(StoreError::WorkerNotFound(_))) => {}
            Err(e) => error!(worker_id = %worker_id, error = %e, "Failed to evict worker"),
        }
    }

    async fn delay(&self, event: Event, delay: Duration) {
        debug!(task_id = %event.task.id, delay_ms = delay.as_millis() as u64, "Delaying event");
        self.delayed.lock().await.push_at(Instant::now() + delay, event);
    }

    /// Moves delayed events whose deadline passed to the event queue.
    pub async fn release_due_events(&self) -> usize {
        let due = self.delayed.lock().await.pop_due(Instant::now());
        let count = due.len();
        for event in due {
            self.events.push(event).await;
        }
        count
    }

    #[instrument(skip(self, event), fields(task_id = %event.task.id, desired = ?event.desired))]
    pub async fn process_event(&self, event: Event) -> ManagerResult<()> {
        if self.store.worker_count().await == 0 {
            debug!("No workers registered, requeueing");
            self.events.push(event).await;
            tokio::time::sleep(self.config.idle_poll_interval).await;
            return Ok(());
        }

        match event.desired {
            DesiredState::Running => self.place(event).await,
            DesiredState::Finished => self.stop_task(event.task).await,
            DesiredState::RestartingImmediately => {
                let mut task = event.task;
                task.transition(State::RestartingImmediately)?;
                task.restarts.push(Utc::now());
                info!(restarts = task.restarts.len(), "Restarting task");
                self.place(Event::new(task, DesiredState::Running)).await
            }
            DesiredState::RestartingWithBackOff => {
                let mut task = event.task;
                task.transition(State::RestartingWithBackOff)?;
                task.restarts.push(Utc::now());
                let delay = backoff_delay(&task, self.config.long_uptime, self.config.max_backoff);
                info!(
                    restarts = task.restarts.len(),
                    delay_ms = delay.as_millis() as u64,
                    "Restarting task with backoff"
                );
                self.delay(Event::new(task, DesiredState::Running), delay).await;
                Ok(())
            }
        }
    }

    async fn place(&self, mut event: Event) -> ManagerResult<()> {
        let workers = self.store.all_workers().await;
        let selected = self
            .scheduler
            .lock()
            .await
            .select_worker(&event.task, &workers)
            .await;

        let (worker_id, worker) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                warn!(error = %e, attempts = event.attempts + 1, "Placement failed");
                self.requeue(event).await;
                return Ok(());
            }
        };

        let mut task = event.task.clone();
        task.transition(State::Scheduled)?;

        let placed = self
            .commit(CommandKind::SetTask {
                worker_id,
                task: task.clone(),
            })
            .await;
        match placed {
            Ok(_) => {}
            // Evicted since the snapshot was taken.
            Err(ManagerError::Store(StoreError::WorkerNotFound(_))) => {
                self.requeue(event).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        info!(worker_id = %worker_id, addr = %worker.addr, "Task scheduled");

        match self.workers.run_task(worker.addr, &task).await {
            Ok(()) => Ok(()),
            Err(e @ TransportError::Status { .. }) => {
                warn!(worker_id = %worker_id, error = %e, "Worker rejected run request");
                self.commit(CommandKind::RemoveTask { task_id: task.id })
                    .await?;
                event.task.state = State::Pending;
                self.requeue(event).await;
                Ok(())
            }
            Err(e) => {
                self.evict_unreachable(worker_id, &e).await;
                Ok(())
            }
        }
    }

    /// Retries a failed placement after `requeue_delay`, unless the attempt
    /// budget is spent.
    async fn requeue(&self, mut event: Event) {
        event.attempts += 1;
        if self
            .config
            .max_placement_attempts
            .is_some_and(|max| event.attempts >= max)
        {
            error!(
                task_id = %event.task.id,
                attempts = event.attempts,
                "Giving up on task placement"
            );
            return;
        }
        self.delay(event, self.config.requeue_delay).await;
    }

    async fn stop_task(&self, requested: Task) -> ManagerResult<()> {
        let (worker_id, worker) = self.store.get_worker_by_task_id(requested.id).await?;
        let Some(mut task) = worker.tasks.get(&requested.id).cloned() else {
            return Err(StoreError::TaskNotFound(requested.id).into());
        };

        // The Finished report this stop produces must not restart the task.
        task.container.restart_policy = RestartPolicy::Never;
        self.commit(CommandKind::SetTask {
            worker_id,
            task: task.clone(),
        })
        .await?;

        if !matches!(task.state, State::Scheduled | State::Running) {
            debug!(state = %task.state, "Task is not running, nothing to stop");
            return Ok(());
        }

        match self.workers.stop_task(worker.addr, &task).await {
            Ok(()) => {
                info!(worker_id = %worker_id, "Stop request sent");
                Ok(())
            }
            Err(e @ TransportError::Status { .. }) => {
                warn!(worker_id = %worker_id, error = %e, "Worker rejected stop request");
                Ok(())
            }
            Err(e) => {
                self.evict_unreachable(worker_id, &e).await;
                Ok(())
            }
        }
    }

    #[instrument(
        skip(self, message),
        fields(worker_id = %message.from, task_id = %message.task.id, state = %message.task.state)
    )]
    pub async fn process_message(&self, message: Message) -> ManagerResult<()> {
        let Message { from, task: reported } = message;

        let stored = match self.store.get_worker_by_task_id(reported.id).await {
            Ok((owner, entry)) if owner == from => entry.tasks.get(&reported.id).cloned(),
            _ => None,
        };
        let Some(mut task) = stored else {
            debug!("Dropping report from a worker that does not own the task");
            return Ok(());
        };

        // Workers only report what they observed. The container definition
        // and restart history stay as the manager last recorded them.
        task.state = reported.state;
        task.container_id = reported.container_id;
        task.started_at = reported.started_at;
        task.finished_at = reported.finished_at;

        self.commit(CommandKind::SetTask {
            worker_id: from,
            task: task.clone(),
        })
        .await?;

        if let Some(desired) = restart_kind(&task) {
            // Forget the old placement before the task is placed again.
            self.commit(CommandKind::RemoveTask { task_id: task.id })
                .await?;
            info!(desired = ?desired, "Task will be restarted");
            self.events.push(Event::new(task, desired)).await;
        }
        Ok(())
    }

    /// Pings every worker once. Unreachable workers are evicted, lagging ones
    /// get a catch-up push in the background.
    pub async fn heartbeat_once(self: &Arc<Self>) {
        let last_index = self.store.last_index().await;
        let workers = self.store.all_workers().await;

        let pings = workers.into_iter().map(|(worker_id, worker)| async move {
            let result = self.workers.heartbeat(worker.addr, last_index).await;
            (worker_id, worker.addr, result)
        });

        for (worker_id, addr, result) in join_all(pings).await {
            match result {
                Ok(lag) if lag > 0 => {
                    debug!(worker_id = %worker_id, lag, "Worker replica is behind");
                    tokio::spawn(self.clone().catch_up(worker_id, addr, lag));
                }
                Ok(_) => {}
                Err(e) => self.evict_unreachable(worker_id, &e).await,
            }
        }
    }

    /// Pushes the last `lag` commands to a worker. A push the worker cannot
    /// apply is resent with the lag it reports.
    pub async fn catch_up(self: Arc<Self>, worker_id: WorkerId, addr: SocketAddr, lag: i64) {
        let mut lag = lag;
        for attempt in 0..=self.config.catchup_retries {
            let commands = self.store.get_last_n_commands(lag as usize).await;
            let Some(end) = commands.last().map(|cmd| cmd.index + 1) else {
                return;
            };

            match self.workers.push_commands(addr, &commands).await {
                Ok(()) => {
                    debug!(worker_id = %worker_id, pushed = commands.len(), "Worker caught up");
                    return;
                }
                Err(TransportError::OutOfSync { lag: reported }) => {
                    let worker_next = end as i64 - reported;
                    lag = self.store.next_index().await as i64 - worker_next;
                    debug!(worker_id = %worker_id, attempt, lag, "Catch-up push rejected");
                    if lag <= 0 {
                        return;
                    }
                }
                Err(e @ TransportError::Status { .. }) => {
                    warn!(worker_id = %worker_id, error = %e, "Catch-up push failed");
                    return;
                }
                Err(e) => {
                    self.evict_unreachable(worker_id, &e).await;
                    return;
                }
            }
        }
        warn!(worker_id = %worker_id, lag, "Worker still behind, retrying next heartbeat");
    }

    pub async fn run_event_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Event loop started");
        loop {
            self.release_due_events().await;

            let idle = Instant::now() + self.config.idle_poll_interval;
            let wake = match self.delayed.lock().await.next_deadline() {
                Some(deadline) => deadline.min(idle),
                None => idle,
            };

            tokio::select! {
                event = self.events.pop() => {
                    if let Err(e) = self.process_event(event).await {
                        log_error("event", &e);
                    }
                }
                _ = tokio::time::sleep_until(wake) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn run_message_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Message loop started");
        loop {
            tokio::select! {
                message = self.messages.pop() => {
                    if let Err(e) = self.process_message(message).await {
                        log_error("message", &e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Message loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn run_heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.heartbeat_interval.as_millis() as u64,
            "Heartbeat loop started"
        );
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.heartbeat_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Heartbeat loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs the three control activities until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let handles = [
            tokio::spawn(self.clone().run_event_loop(shutdown.clone())),
            tokio::spawn(self.clone().run_message_loop(shutdown.clone())),
            tokio::spawn(self.clone().run_heartbeat_loop(shutdown)),
        ];
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Control loop task panicked");
            }
        }
    }
}

/// Lookups that miss are expected under churn; a refused state transition
/// means the control loop itself went wrong.
fn log_error(source: &str, e: &ManagerError) {
    match e {
        ManagerError::Task(_) => error!(source, error = %e, "Control loop invariant violated"),
        _ => warn!(source, error = %e, "Failed to process item"),
    }
}
