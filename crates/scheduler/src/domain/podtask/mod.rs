//! Scheduling tasks and their lifecycle

mod error;
mod registry;
mod task;

pub use error::{Result, TaskError};
pub use registry::{TaskKey, TaskRegistry};
pub use task::{Task, TaskState};
