use api_types::{PodKey, TaskId};
use thiserror::Error;

use crate::domain::podtask::TaskState;

/// Errors from the task registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {key} not found")]
    NotFound { key: String },

    #[error("a task for pod {pod} already exists")]
    AlreadyExists { pod: PodKey },

    #[error("task {task_id} cannot move from {from} to {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

pub type Result<T> = std::result::Result<T, TaskError>;
