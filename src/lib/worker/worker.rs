use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, warn};

use super::types::{Message, MessageSink, ResourceMonitor, Worker, WorkerError, WorkerResult};
use crate::queue::WorkQueue;
use crate::scheduler::types::Resources;
use crate::store::Store;
use crate::store::types::{Command, LogIndex, StoreError, WorkerId};
use crate::tasks::runtime::ContainerRuntime;
use crate::tasks::types::{DesiredState, Event, State, Task, TaskError};

impl Worker {
    pub fn new(
        id: WorkerId,
        addr: SocketAddr,
        runtime: Arc<dyn ContainerRuntime>,
        monitor: Arc<dyn ResourceMonitor>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Worker {
            id,
            addr,
            queue: WorkQueue::new(),
            db: Mutex::new(HashMap::new()),
            store: Store::new(),
            runtime,
            monitor,
            sink,
        }
    }

    /// Queues a run or stop request for the run loop. Requests execute in
    /// arrival order, so a stop queued behind a run stops what the run started.
    pub async fn add_task(&self, task: Task, desired: DesiredState) {
        if desired == DesiredState::Running {
            let mut db = self.db.lock().await;
            let running = db
                .get(&task.id)
                .is_some_and(|known| known.state == State::Running);
            if !running {
                db.insert(task.id, task.clone());
            }
        }
        debug!(task_id = %task.id, desired = ?desired, "Queued task");
        self.queue.push(Event::new(task, desired)).await;
    }

    pub async fn get_tasks(&self) -> Vec<Task> {
        self.db.lock().await.values().cloned().collect()
    }

    pub async fn resources(&self) -> Resources {
        self.monitor.resources().await
    }

    /// Executes one request and reports the resulting task state.
    #[instrument(skip(self, event), fields(worker_id = %self.id, task_id = %event.task.id))]
    pub async fn execute(&self, event: Event) -> WorkerResult<Task> {
        let task = match event.desired {
            DesiredState::Running => self.start_task(event.task).await?,
            DesiredState::Finished => self.stop_task(event.task).await?,
            other => {
                return Err(TaskError::StateTransitionNotAllowed {
                    from: event.task.state,
                    to: other.into(),
                }
                .into());
            }
        };

        self.report(task.clone()).await;
        Ok(task)
    }

    async fn start_task(&self, mut task: Task) -> WorkerResult<Task> {
        // Validate before touching the runtime.
        let mut probe = task.clone();
        probe.transition(State::Running)?;

        match self.runtime.run(&task.container).await {
            Ok(container_id) => {
                info!(
                    container_id = %container_id,
                    image = %task.container.image.reference(),
                    "Task started"
                );
                task.transition(State::Running)?;
                task.container_id = Some(container_id);
                task.started_at = Some(Utc::now());
                task.finished_at = None;
            }
            Err(e) => {
                warn!(error = %e, "Task failed to start");
                task.transition(State::FailedOnStartup)?;
                task.container_id = None;
                task.started_at = None;
                task.finished_at = Some(Utc::now());
            }
        }

        self.db.lock().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn stop_task(&self, requested: Task) -> WorkerResult<Task> {
        let mut task = self
            .db
            .lock()
            .await
            .get(&requested.id)
            .cloned()
            .ok_or(WorkerError::UnknownTask(requested.id))?;
        let container_id = task
            .container_id
            .clone()
            .ok_or(WorkerError::NoContainer(task.id))?;

        // The manager's copy decides what happens after the stop.
        task.container = requested.container;
        task.transition(State::Finished)?;

        self.runtime
            .stop(&container_id)
            .await
            .map_err(WorkerError::Runtime)?;
        task.finished_at = Some(Utc::now());
        info!(container_id = %container_id, "Task stopped");

        self.db.lock().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn report(&self, task: Task) {
        let message = Message { from: self.id, task };
        if let Err(e) = self.sink.send(message).await {
            warn!(error = %e, "Failed to report task state");
        }
    }

    /// Lag of the local replica behind a manager whose latest command is
    /// `last_index`.
    pub async fn heartbeat(&self, last_index: Option<LogIndex>) -> i64 {
        let manager_next = last_index.map(|index| index + 1).unwrap_or(0);
        manager_next as i64 - self.store.next_index().await as i64
    }

    /// Applies a log suffix pushed by the manager to the local replica.
    pub async fn commit_changes(&self, commands: Vec<Command>) -> WorkerResult<usize> {
        let end = commands.last().map(|cmd| cmd.index + 1);
        match self.store.commit_changes(commands).await {
            Ok(applied) => {
                debug!(applied, "Replica caught up");
                Ok(applied)
            }
            Err(StoreError::LogOutOfSync { gap }) => {
                let next = self.store.next_index().await;
                let lag = end.map(|end| end as i64 - next as i64).unwrap_or(gap);
                warn!(gap, lag, "Replica rejected pushed commands");
                Err(WorkerError::OutOfSync { lag })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Checks running containers once and reports the ones that exited.
    /// Returns how many exits were found.
    pub async fn check_containers(&self) -> usize {
        let running: Vec<Task> = self
            .db
            .lock()
            .await
            .values()
            .filter(|task| task.state == State::Running)
            .cloned()
            .collect();

        let mut exited = 0;
        for mut task in running {
            let Some(container_id) = task.container_id.clone() else {
                continue;
            };

            let state = match self.runtime.container_state(&container_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to inspect container");
                    continue;
                }
            };
            if state.running {
                continue;
            }

            let observed = match state.exit_code {
                Some(0) => State::Finished,
                _ => State::FailedAfterStartup,
            };

            {
                let mut db = self.db.lock().await;
                // A stop may have landed while the runtime was queried.
                match db.get(&task.id) {
                    Some(current) if current.state == State::Running => {}
                    _ => continue,
                }
                if let Err(e) = task.transition(observed) {
                    warn!(task_id = %task.id, error = %e, "Ignoring container exit");
                    continue;
                }
                task.finished_at = Some(Utc::now());
                db.insert(task.id, task.clone());
            }

            info!(
                task_id = %task.id,
                exit_code = ?state.exit_code,
                state = %observed,
                "Container exited"
            );
            self.report(task).await;
            exited += 1;
        }
        exited
    }

    /// Executes queued requests until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        match self.runtime.list_containers().await {
            Ok(containers) if !containers.is_empty() => {
                warn!(
                    count = containers.len(),
                    runtime = self.runtime.name(),
                    "Found containers from a previous run"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to list containers"),
        }

        loop {
            tokio::select! {
                event = self.queue.pop() => {
                    if let Err(e) = self.execute(event).await {
                        warn!(worker_id = %self.id, error = %e, "Failed to execute task request");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Worker run loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Polls running containers every `interval` until shutdown.
    pub async fn watch(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_containers().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Worker watch loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{CommandKind, WorkerEntry};
    use crate::tasks::runtime::MockRuntime;
    use crate::tasks::types::{ContainerSpec, Image, RestartPolicy};
    use crate::worker::stats::StaticMonitor;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct ChannelSink(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageSink for ChannelSink {
        async fn send(&self, message: Message) -> anyhow::Result<()> {
            self.0
                .send(message)
                .map_err(|_| anyhow::anyhow!("receiver dropped"))
        }
    }

    fn worker(runtime: Arc<MockRuntime>) -> (Worker, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(
            Uuid::new_v4(),
            SocketAddr::from(([127, 0, 0, 1], 7879)),
            runtime,
            Arc::new(StaticMonitor(Resources::default())),
            Arc::new(ChannelSink(tx)),
        );
        (worker, rx)
    }

    fn scheduled_task() -> Task {
        let mut task = Task::new("web", ContainerSpec::new(Image::parse("nginx")));
        task.state = State::Scheduled;
        task
    }

    #[tokio::test]
    async fn run_request_starts_container_and_reports_running() {
        let runtime = Arc::new(MockRuntime::new());
        let (worker, mut rx) = worker(runtime.clone());

        let task = worker
            .execute(Event::new(scheduled_task(), DesiredState::Running))
            .await
            .unwrap();

        assert_eq!(task.state, State::Running);
        assert!(task.container_id.is_some());
        assert!(task.started_at.is_some());

        let message = rx.recv().await.unwrap();
        assert_eq!(message.from, worker.id);
        assert_eq!(message.task.state, State::Running);
        assert_eq!(runtime.list_containers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_start_reports_failed_on_startup() {
        let (worker, mut rx) = worker(Arc::new(MockRuntime::failing()));

        let task = worker
            .execute(Event::new(scheduled_task(), DesiredState::Running))
            .await
            .unwrap();

        assert_eq!(task.state, State::FailedOnStartup);
        assert_eq!(rx.recv().await.unwrap().task.state, State::FailedOnStartup);
    }

    #[tokio::test]
    async fn stop_takes_restart_policy_from_request() {
        let runtime = Arc::new(MockRuntime::new());
        let (worker, mut rx) = worker(runtime.clone());

        let mut task = scheduled_task();
        task.container.restart_policy = RestartPolicy::Always;
        let running = worker
            .execute(Event::new(task, DesiredState::Running))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        let mut request = running.clone();
        request.container.restart_policy = RestartPolicy::Never;
        let stopped = worker
            .execute(Event::new(request, DesiredState::Finished))
            .await
            .unwrap();

        assert_eq!(stopped.state, State::Finished);
        assert_eq!(stopped.container.restart_policy, RestartPolicy::Never);
        assert!(runtime.list_containers().await.unwrap().is_empty());
        assert_eq!(rx.recv().await.unwrap().task.state, State::Finished);
    }

    #[tokio::test]
    async fn stop_queued_behind_run_stops_the_started_container() {
        let runtime = Arc::new(MockRuntime::new());
        let (worker, mut rx) = worker(runtime.clone());

        let mut task = scheduled_task();
        task.container.restart_policy = RestartPolicy::Always;
        worker.add_task(task.clone(), DesiredState::Running).await;
        assert_eq!(worker.get_tasks().await[0].state, State::Scheduled);

        let mut request = task;
        request.container.restart_policy = RestartPolicy::Never;
        worker.add_task(request, DesiredState::Finished).await;

        while let Some(event) = worker.queue.try_pop().await {
            worker.execute(event).await.unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().task.state, State::Running);
        let stopped = rx.recv().await.unwrap().task;
        assert_eq!(stopped.state, State::Finished);
        assert_eq!(stopped.container.restart_policy, RestartPolicy::Never);
        assert!(runtime.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stopping_an_unknown_task_fails() {
        let (worker, _rx) = worker(Arc::new(MockRuntime::new()));
        let err = worker
            .execute(Event::new(scheduled_task(), DesiredState::Finished))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn container_exit_is_reported() {
        let runtime = Arc::new(MockRuntime::new());
        let (worker, mut rx) = worker(runtime.clone());

        let first = worker
            .execute(Event::new(scheduled_task(), DesiredState::Running))
            .await
            .unwrap();
        let second = worker
            .execute(Event::new(scheduled_task(), DesiredState::Running))
            .await
            .unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        runtime.exit(first.container_id.as_deref().unwrap(), 0).await;
        runtime.exit(second.container_id.as_deref().unwrap(), 1).await;
        assert_eq!(worker.check_containers().await, 2);

        let mut states = vec![
            rx.recv().await.unwrap().task,
            rx.recv().await.unwrap().task,
        ];
        states.sort_by_key(|task| task.id != first.id);
        assert_eq!(states[0].state, State::Finished);
        assert_eq!(states[1].state, State::FailedAfterStartup);

        // Already reported exits are not reported twice.
        assert_eq!(worker.check_containers().await, 0);
    }

    #[tokio::test]
    async fn heartbeat_reports_replica_lag() {
        let (worker, _rx) = worker(Arc::new(MockRuntime::new()));
        assert_eq!(worker.heartbeat(None).await, 0);
        assert_eq!(worker.heartbeat(Some(2)).await, 3);

        let commands = vec![Command::new(
            0,
            CommandKind::SetWorker {
                worker_id: worker.id,
                worker: WorkerEntry::new(worker.addr),
            },
        )];
        worker.commit_changes(commands).await.unwrap();
        assert_eq!(worker.heartbeat(Some(2)).await, 2);
        assert_eq!(worker.heartbeat(Some(0)).await, 0);
    }

    #[tokio::test]
    async fn replica_replays_resent_suffix_and_rejects_gaps() {
        let (worker, _rx) = worker(Arc::new(MockRuntime::new()));
        let set_worker = |index| {
            Command::new(
                index,
                CommandKind::SetWorker {
                    worker_id: Uuid::new_v4(),
                    worker: WorkerEntry::new(SocketAddr::from(([127, 0, 0, 1], 9000))),
                },
            )
        };

        let suffix = vec![set_worker(0), set_worker(1)];
        assert_eq!(worker.commit_changes(suffix.clone()).await.unwrap(), 2);
        assert_eq!(worker.commit_changes(suffix).await.unwrap(), 0);

        let err = worker
            .commit_changes(vec![set_worker(4), set_worker(5)])
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::OutOfSync { lag: 4 }));
        assert_eq!(worker.store.len().await, 2);
    }
}
