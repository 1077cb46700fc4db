use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use super::types::{
    Command, CommandKind, LogIndex, StoreError, StoreResult, WorkerEntry, WorkerId,
};
use crate::tasks::types::{Task, TaskId};

/// Worker/task projection built by folding an ordered command log.
///
/// The log and the projection sit behind one lock, so a reader never sees a
/// command in the log that is not yet reflected in the projection.
#[derive(Default)]
pub struct Store {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    state: HashMap<WorkerId, WorkerEntry>,
    log: Vec<Command>,
}

impl Inner {
    fn next_index(&self) -> LogIndex {
        self.log.last().map(|cmd| cmd.index + 1).unwrap_or(0)
    }

    fn gap(&self, index: LogIndex) -> i64 {
        index as i64 - self.next_index() as i64
    }

    fn owner_of(&self, task_id: &TaskId) -> Option<WorkerId> {
        self.state
            .iter()
            .find(|(_, worker)| worker.tasks.contains_key(task_id))
            .map(|(id, _)| *id)
    }

    fn commit(&mut self, cmd: Command) -> StoreResult<()> {
        let gap = self.gap(cmd.index);
        if gap != 0 {
            return Err(StoreError::LogOutOfSync { gap });
        }

        self.apply(&cmd.kind)?;
        debug!(index = cmd.index, "Committed command");
        self.log.push(cmd);
        Ok(())
    }

    /// Applies one command. Fails without touching the projection.
    fn apply(&mut self, kind: &CommandKind) -> StoreResult<()> {
        match kind {
            CommandKind::SetWorker { worker_id, worker } => {
                for task_id in worker.tasks.keys() {
                    self.detach_task(task_id, worker_id);
                }
                self.state.insert(*worker_id, worker.clone());
            }
            CommandKind::RemoveWorker { worker_id } => {
                self.state
                    .remove(worker_id)
                    .ok_or(StoreError::WorkerNotFound(*worker_id))?;
            }
            CommandKind::SetTask { worker_id, task } => {
                if !self.state.contains_key(worker_id) {
                    return Err(StoreError::WorkerNotFound(*worker_id));
                }
                self.detach_task(&task.id, worker_id);
                if let Some(worker) = self.state.get_mut(worker_id) {
                    worker.tasks.insert(task.id, task.clone());
                }
            }
            CommandKind::RemoveTask { task_id } => {
                let owner = self
                    .owner_of(task_id)
                    .ok_or(StoreError::TaskNotFound(*task_id))?;
                if let Some(worker) = self.state.get_mut(&owner) {
                    worker.tasks.remove(task_id);
                }
            }
        }
        Ok(())
    }

    /// Drops `task_id` from every worker other than `keep`, so a task is never
    /// recorded under two workers.
    fn detach_task(&mut self, task_id: &TaskId, keep: &WorkerId) {
        for (id, worker) in self.state.iter_mut() {
            if id != keep {
                worker.tasks.remove(task_id);
            }
        }
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a fresh store by committing `commands` in order.
    pub async fn replay(commands: impl IntoIterator<Item = Command>) -> StoreResult<Self> {
        let store = Store::new();
        {
            let mut inner = store.inner.write().await;
            for cmd in commands {
                inner.commit(cmd)?;
            }
        }
        Ok(store)
    }

    /// Index of the most recent command, `None` while the log is empty.
    pub async fn last_index(&self) -> Option<LogIndex> {
        self.inner.read().await.log.last().map(|cmd| cmd.index)
    }

    /// Index the next committed command must carry.
    pub async fn next_index(&self) -> LogIndex {
        self.inner.read().await.next_index()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.log.is_empty()
    }

    /// Commits a command produced elsewhere. Only `last_index() + 1` is
    /// accepted; anything else is rejected with the gap and changes nothing.
    pub async fn commit_change(&self, cmd: Command) -> StoreResult<()> {
        self.inner.write().await.commit(cmd)
    }

    /// Commits a suffix of another store's log. Commands already present are
    /// skipped so a resent suffix replays cleanly; the first gap aborts.
    /// Returns how many commands were applied.
    pub async fn commit_changes(&self, cmds: Vec<Command>) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut applied = 0;
        for cmd in cmds {
            if inner.gap(cmd.index) < 0 {
                continue;
            }
            inner.commit(cmd)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Assigns the next index to `kind` and commits it.
    pub async fn append(&self, kind: CommandKind) -> StoreResult<Command> {
        let mut inner = self.inner.write().await;
        let cmd = Command::new(inner.next_index(), kind);
        inner.commit(cmd.clone())?;
        Ok(cmd)
    }

    /// Commits `RemoveWorker` and returns the entry as it was right before,
    /// so no task placed on the worker concurrently is missed.
    pub async fn remove_worker(&self, worker_id: WorkerId) -> StoreResult<(Command, WorkerEntry)> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .state
            .get(&worker_id)
            .cloned()
            .ok_or(StoreError::WorkerNotFound(worker_id))?;
        let cmd = Command::new(inner.next_index(), CommandKind::RemoveWorker { worker_id });
        inner.commit(cmd.clone())?;
        Ok((cmd, entry))
    }

    pub async fn all_workers(&self) -> HashMap<WorkerId, WorkerEntry> {
        self.inner.read().await.state.clone()
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.read().await.state.len()
    }

    pub async fn get_worker(&self, worker_id: WorkerId) -> StoreResult<WorkerEntry> {
        self.inner
            .read()
            .await
            .state
            .get(&worker_id)
            .cloned()
            .ok_or(StoreError::WorkerNotFound(worker_id))
    }

    pub async fn get_task(&self, task_id: TaskId) -> StoreResult<Task> {
        self.inner
            .read()
            .await
            .state
            .values()
            .find_map(|worker| worker.tasks.get(&task_id))
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    pub async fn get_worker_by_task_id(
        &self,
        task_id: TaskId,
    ) -> StoreResult<(WorkerId, WorkerEntry)> {
        self.inner
            .read()
            .await
            .state
            .iter()
            .find(|(_, worker)| worker.tasks.contains_key(&task_id))
            .map(|(id, worker)| (*id, worker.clone()))
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    pub async fn all_tasks(&self) -> Vec<Task> {
        self.inner
            .read()
            .await
            .state
            .values()
            .flat_map(|worker| worker.tasks.values().cloned())
            .collect()
    }

    /// The last `min(n, len)` commands, oldest first.
    pub async fn get_last_n_commands(&self, n: usize) -> Vec<Command> {
        let inner = self.inner.read().await;
        let n = n.min(inner.log.len());
        inner.log[inner.log.len() - n..].to_vec()
    }
}
