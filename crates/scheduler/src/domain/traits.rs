//! Collaborators the scheduling engine talks to

use core::error::Error;

use api_types::{AgentId, ExecutorId, OfferId, PodKey, PodSnapshot, TaskDescriptor, TaskId, TaskStatus};
use error_stack::Report;

/// Errors reading the orchestration store.
#[derive(Debug, derive_more::Display)]
pub enum StoreError {
    #[display("Failed to read pod {pod} from the store")]
    ReadFailed { pod: PodKey },
    #[display("Failed to list pods from the store")]
    ListFailed,
}

impl Error for StoreError {}

/// Errors submitting a request to the resource manager.
#[derive(Debug, derive_more::Display)]
pub enum DriverError {
    #[display("Resource manager driver is not connected")]
    NotConnected,
    #[display("Failed to submit {call} request")]
    SubmitFailed { call: &'static str },
}

impl Error for DriverError {}

/// Read access to the authoritative pod store.
#[async_trait::async_trait]
pub trait PodStore: Send + Sync {
    /// Current state of a pod; `None` when the store no longer has it.
    async fn get(&self, key: &PodKey) -> Result<Option<PodSnapshot>, Report<StoreError>>;

    async fn list(&self) -> Result<Vec<PodSnapshot>, Report<StoreError>>;
}

/// Outbound requests to the resource manager. Success means the request was accepted
/// for submission, not that it took effect.
#[async_trait::async_trait]
pub trait SchedulerDriver: Send + Sync {
    async fn launch_tasks(
        &self,
        offer_id: &OfferId,
        tasks: Vec<TaskDescriptor>,
    ) -> Result<(), Report<DriverError>>;

    async fn kill_task(&self, task_id: &TaskId) -> Result<(), Report<DriverError>>;

    async fn decline_offer(&self, offer_id: &OfferId) -> Result<(), Report<DriverError>>;

    async fn send_framework_message(
        &self,
        executor_id: &ExecutorId,
        agent_id: &AgentId,
        data: String,
    ) -> Result<(), Report<DriverError>>;

    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> Result<(), Report<DriverError>>;
}

/// Why an event was recorded against a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EventReason {
    #[display("failedScheduling")]
    FailedScheduling,
    #[display("scheduled")]
    Scheduled,
}

/// Fire-and-forget sink for user-visible scheduling events.
pub trait EventRecorder: Send + Sync {
    fn event(&self, pod: &PodKey, reason: EventReason, message: String);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn event(&self, pod: &PodKey, reason: EventReason, message: String) {
        tracing::info!(target: "events", pod = %pod, reason = %reason, "{message}");
    }
}
