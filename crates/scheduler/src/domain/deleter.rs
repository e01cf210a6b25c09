//! Withdrawing a pod's scheduling intent

use std::sync::Arc;

use api_types::{PodKey, TaskId};
use thiserror::Error;

use crate::domain::podtask::{TaskError, TaskRegistry, TaskState};
use crate::domain::queue::PendingQueue;
use crate::domain::traits::SchedulerDriver;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeleteError {
    #[error("invalid pod identity (namespace: {namespace:?}, name: {name:?})")]
    InvalidPod { namespace: String, name: String },

    #[error("no scheduling task for pod {pod}")]
    NoSuchPod { pod: PodKey },

    #[error("failed to kill task {task_id}: {message}")]
    KillFailed { task_id: TaskId, message: String },

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// What a successful deletion did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Task had not launched; dropped from queue and registry
    Dequeued,
    /// Kill requested and task marked deleted
    Killed,
    /// Task was already finished or deleted
    AlreadyGone,
}

pub struct Deleter {
    tasks: Arc<TaskRegistry>,
    queue: Arc<PendingQueue>,
    driver: Arc<dyn SchedulerDriver>,
}

impl Deleter {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        queue: Arc<PendingQueue>,
        driver: Arc<dyn SchedulerDriver>,
    ) -> Self {
        Self {
            tasks,
            queue,
            driver,
        }
    }

    #[tracing::instrument(skip(self), fields(pod = %pod))]
    pub async fn delete_one(&self, pod: &PodKey) -> Result<DeleteOutcome, DeleteError> {
        if pod.name.is_empty() || pod.namespace.is_empty() {
            return Err(DeleteError::InvalidPod {
                namespace: pod.namespace.clone(),
                name: pod.name.clone(),
            });
        }

        let _guard = self.tasks.lock(pod).await;
        let task = self
            .tasks
            .get(pod)
            .ok_or_else(|| DeleteError::NoSuchPod { pod: pod.clone() })?;

        match task.state {
            TaskState::Created | TaskState::Pending => {
                self.queue.delete(pod);
                self.tasks.delete(&task.id)?;
                tracing::info!(task_id = %task.id, "removed pod that had not launched");
                Ok(DeleteOutcome::Dequeued)
            }
            TaskState::Launched | TaskState::Running => {
                self.driver
                    .kill_task(&task.id)
                    .await
                    .map_err(|err| DeleteError::KillFailed {
                        task_id: task.id.clone(),
                        message: err.to_string(),
                    })?;
                self.queue.delete(pod);
                self.tasks.update(&task.with_state(TaskState::Deleted))?;
                tracing::info!(task_id = %task.id, "kill requested for launched pod");
                Ok(DeleteOutcome::Killed)
            }
            TaskState::Finished | TaskState::Lost | TaskState::Failed | TaskState::Deleted => {
                self.queue.delete(pod);
                tracing::debug!(task_id = %task.id, state = %task.state, "pod already gone");
                Ok(DeleteOutcome::AlreadyGone)
            }
        }
    }
}
