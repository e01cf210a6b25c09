use std::sync::Arc;

use api_types::{TaskStatus, TaskStatusState};

use super::decision::ReconcileCause;
use super::reconciler::Reconciler;
use crate::domain::podtask::{Task, TaskRegistry, TaskState};
use crate::domain::traits::SchedulerDriver;

/// Status message sent by executors that launched a pod but could not bind it.
pub const CREATE_BINDING_FAILURE: &str = "create-binding-failure";
/// Framework message prefix telling an executor its task was lost.
pub const TASK_LOST: &str = "task-lost";
/// Framework message prefix telling an executor its task failed.
pub const TASK_FAILED: &str = "task-failed";

/// How a status update was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// No task with this ID
    Unknown,
    /// Nothing to change
    Ignored,
    /// Task moved to the given state
    Applied(TaskState),
    /// Kill of a deleted task confirmed, entry dropped
    Removed,
    /// A store read will decide
    Reconciling,
}

/// Applies task status updates from the resource manager.
pub struct StatusHandler {
    tasks: Arc<TaskRegistry>,
    driver: Arc<dyn SchedulerDriver>,
    reconciler: Arc<Reconciler>,
}

impl StatusHandler {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        driver: Arc<dyn SchedulerDriver>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            tasks,
            driver,
            reconciler,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    #[tracing::instrument(skip_all, fields(task_id = %status.task_id, state = %status.state))]
    pub async fn handle(&self, status: TaskStatus) -> StatusOutcome {
        let Some(pod) = self.tasks.get(&status.task_id).map(|task| task.pod) else {
            tracing::debug!("status update for unknown task");
            return StatusOutcome::Unknown;
        };

        let _guard = self.tasks.lock(&pod).await;
        let Some(mut task) = self.tasks.get(&status.task_id) else {
            tracing::debug!("task removed while waiting for its lock");
            return StatusOutcome::Unknown;
        };

        let next = TaskState::from(status.state);
        let bind_failure = status.state == TaskStatusState::Failed
            && status.message.as_deref() == Some(CREATE_BINDING_FAILURE);

        if task.state.is_terminal() {
            if task.state == TaskState::Deleted && next.is_terminal() {
                return match self.tasks.delete(&task.id) {
                    Ok(_) => {
                        tracing::info!(pod = %pod, "deleted task confirmed gone");
                        StatusOutcome::Removed
                    }
                    Err(err) => {
                        tracing::warn!(pod = %pod, "failed to drop deleted task: {err}");
                        StatusOutcome::Ignored
                    }
                };
            }
            tracing::debug!(current = %task.state, "status for finished task ignored");
            return StatusOutcome::Ignored;
        }

        task.last_status = Some(status.clone());

        if bind_failure && task.state.is_launched() {
            if task.reconciling {
                // Starts over only if an earlier check gave up.
                self.reconciler.dispatch(&task, ReconcileCause::BindFailure);
                return StatusOutcome::Reconciling;
            }
            task.reconciling = true;
            return match self.tasks.update(&task) {
                Ok(task) => {
                    tracing::warn!(pod = %pod, "executor failed to bind pod");
                    self.reconciler.dispatch(&task, ReconcileCause::BindFailure);
                    StatusOutcome::Reconciling
                }
                Err(err) => {
                    tracing::warn!(pod = %pod, "could not mark task for reconciliation: {err}");
                    StatusOutcome::Ignored
                }
            };
        }

        if matches!(next, TaskState::Lost | TaskState::Failed) && task.state.is_launched() {
            return self.handle_lost(task, next, &status).await;
        }

        if next == task.state {
            if let Err(err) = self.tasks.update(&task) {
                tracing::debug!("status not recorded: {err}");
            }
            return StatusOutcome::Ignored;
        }

        match self.tasks.update(&task.with_state(next)) {
            Ok(task) => {
                tracing::info!(pod = %pod, state = %task.state, "task state updated");
                StatusOutcome::Applied(next)
            }
            Err(err) => {
                tracing::warn!(pod = %pod, "status update rejected: {err}");
                StatusOutcome::Ignored
            }
        }
    }

    /// A launched task died without being deleted: tell its executor, then let the
    /// store decide whether the pod needs another attempt.
    async fn handle_lost(&self, task: Task, next: TaskState, status: &TaskStatus) -> StatusOutcome {
        let mut dead = task.with_state(next);
        dead.reconciling = false;
        let task = match self.tasks.update(&dead) {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(pod = %task.pod, "status update rejected: {err}");
                return StatusOutcome::Ignored;
            }
        };
        tracing::warn!(pod = %task.pod, state = %next, message = ?status.message, "task died");

        let executor_id = status
            .executor_id
            .clone()
            .unwrap_or_else(|| task.executor.executor_id.clone());
        let agent_id = status.agent_id.clone().or_else(|| task.agent_id.clone());
        match agent_id {
            Some(agent_id) => {
                let prefix = if next == TaskState::Lost { TASK_LOST } else { TASK_FAILED };
                let message = format!("{prefix}:{}", task.id);
                if let Err(report) = self
                    .driver
                    .send_framework_message(&executor_id, &agent_id, message)
                    .await
                {
                    tracing::warn!(pod = %task.pod, "failed to notify executor: {report:?}");
                }
            }
            None => tracing::warn!(pod = %task.pod, "no agent known, executor not notified"),
        }

        self.reconciler.dispatch(&task, ReconcileCause::TaskLost);
        StatusOutcome::Applied(next)
    }
}
