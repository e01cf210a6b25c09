use std::time::Duration;

use api_types::{ExecutorInfo, PodKey, PodSnapshot, TaskId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use utils::keyed_lock::{KeyedLock, KeyedLockGuard};

use super::error::{Result, TaskError};
use super::task::{Task, TaskState};

/// Lookup key accepted by [`TaskRegistry::get`].
#[derive(Debug, Clone, Copy)]
pub enum TaskKey<'a> {
    Pod(&'a PodKey),
    Task(&'a TaskId),
}

impl<'a> From<&'a PodKey> for TaskKey<'a> {
    fn from(key: &'a PodKey) -> Self {
        TaskKey::Pod(key)
    }
}

impl<'a> From<&'a TaskId> for TaskKey<'a> {
    fn from(id: &'a TaskId) -> Self {
        TaskKey::Task(id)
    }
}

/// In-memory store of scheduling tasks, indexed by task ID and by pod key.
///
/// Every state change is checked against the stored entry, so a caller holding a
/// stale copy cannot move a task backwards. Multi-step read-modify-write sequences
/// take [`TaskRegistry::lock`] for the pod first.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Task>,
    by_pod: DashMap<PodKey, TaskId>,
    locks: KeyedLock<PodKey>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-pod lock serializing deleter, status handling and scheduling.
    pub async fn lock(&self, pod: &PodKey) -> KeyedLockGuard<PodKey> {
        self.locks.lock(pod).await
    }

    /// Creates a task in `Created` state for a pod that has none.
    pub fn register(&self, pod: &PodSnapshot, executor: ExecutorInfo) -> Result<Task> {
        let task = Task::new(pod, executor);
        match self.by_pod.entry(task.pod.clone()) {
            Entry::Occupied(_) => Err(TaskError::AlreadyExists {
                pod: task.pod.clone(),
            }),
            Entry::Vacant(vacant) => {
                self.tasks.insert(task.id.clone(), task.clone());
                vacant.insert(task.id.clone());
                tracing::debug!(pod = %task.pod, task_id = %task.id, "task registered");
                Ok(task)
            }
        }
    }

    pub fn get<'a>(&self, key: impl Into<TaskKey<'a>>) -> Option<Task> {
        let task_id = match key.into() {
            TaskKey::Task(id) => id.clone(),
            TaskKey::Pod(pod) => self.by_pod.get(pod)?.value().clone(),
        };
        self.tasks.get(&task_id).map(|task| task.value().clone())
    }

    /// Replaces the stored task with `task` if the move from the stored state is allowed.
    ///
    /// Keeping the state unchanged is a field update and is accepted unless the task
    /// is already terminal.
    pub fn update(&self, task: &Task) -> Result<Task> {
        let mut stored = self.tasks.get_mut(&task.id).ok_or_else(|| TaskError::NotFound {
            key: task.id.to_string(),
        })?;

        let from = stored.state;
        let allowed = if from == task.state {
            !from.is_terminal()
        } else {
            from.can_transition_to(task.state)
        };
        if !allowed {
            return Err(TaskError::IllegalTransition {
                task_id: task.id.clone(),
                from,
                to: task.state,
            });
        }

        let mut updated = task.clone();
        updated.updated_at = Instant::now();
        *stored = updated.clone();

        if from != updated.state {
            tracing::debug!(
                pod = %updated.pod,
                task_id = %updated.id,
                from = %from,
                to = %updated.state,
                "task state changed"
            );
        }
        Ok(updated)
    }

    /// Removes a task that is not launched. Launched tasks must be killed first.
    pub fn delete(&self, task_id: &TaskId) -> Result<Task> {
        let (_, task) = self
            .tasks
            .remove_if(task_id, |_, task| !task.state.is_launched())
            .ok_or_else(|| match self.tasks.get(task_id) {
                Some(task) => TaskError::IllegalTransition {
                    task_id: task_id.clone(),
                    from: task.state,
                    to: TaskState::Deleted,
                },
                None => TaskError::NotFound {
                    key: task_id.to_string(),
                },
            })?;

        self.by_pod.remove_if(&task.pod, |_, id| id == task_id);
        tracing::debug!(pod = %task.pod, task_id = %task.id, state = %task.state, "task removed");
        Ok(task)
    }

    /// All tasks ordered by pod key.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|task| task.value().clone()).collect();
        tasks.sort_by(|a, b| a.pod.cmp(&b.pod));
        tasks
    }

    /// Drops terminal tasks whose last update is older than `retention`.
    pub fn collect_garbage(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let is_stale =
            |task: &Task| task.state.is_terminal() && now.saturating_duration_since(task.updated_at) >= retention;

        let stale: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|task| is_stale(task.value()))
            .map(|task| task.key().clone())
            .collect();

        let mut collected = 0;
        for task_id in stale {
            if let Some((_, task)) = self.tasks.remove_if(&task_id, |_, task| is_stale(task)) {
                self.by_pod.remove_if(&task.pod, |_, id| *id == task_id);
                collected += 1;
            }
        }
        if collected > 0 {
            tracing::info!(collected, "collected terminal tasks");
        }
        collected
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
