//! Driver that buffers outbound calls for an external resource-manager shim

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use api_types::{AgentId, DriverCall, ExecutorId, OfferId, TaskDescriptor, TaskId, TaskStatus};
use error_stack::{bail, Report};
use tokio::sync::Notify;

use crate::domain::traits::{DriverError, SchedulerDriver};

/// Buffers every [`DriverCall`] until the shim collects it.
///
/// Calls are accepted only while connected; the shim connects by reporting a
/// registration and the buffer is kept across reconnects.
#[derive(Default)]
pub struct QueuedDriver {
    calls: Mutex<VecDeque<DriverCall>>,
    connected: AtomicBool,
    available: Notify,
}

impl QueuedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.locked().len()
    }

    /// Takes every buffered call, oldest first.
    pub fn drain(&self) -> Vec<DriverCall> {
        self.locked().drain(..).collect()
    }

    /// Like [`drain`](Self::drain) but waits up to `wait` for the first call.
    pub async fn next_batch(&self, wait: Duration) -> Vec<DriverCall> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            let calls = self.drain();
            if !calls.is_empty() {
                return calls;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    fn locked(&self) -> MutexGuard<'_, VecDeque<DriverCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, call: DriverCall) -> Result<(), Report<DriverError>> {
        if !self.is_connected() {
            bail!(DriverError::NotConnected);
        }
        tracing::debug!(?call, "driver call queued");
        self.locked().push_back(call);
        self.available.notify_waiters();
        Ok(())
    }
}

#[async_trait::async_trait]
impl SchedulerDriver for QueuedDriver {
    async fn launch_tasks(
        &self,
        offer_id: &OfferId,
        tasks: Vec<TaskDescriptor>,
    ) -> Result<(), Report<DriverError>> {
        self.submit(DriverCall::LaunchTasks {
            offer_id: offer_id.clone(),
            tasks,
        })
    }

    async fn kill_task(&self, task_id: &TaskId) -> Result<(), Report<DriverError>> {
        self.submit(DriverCall::KillTask {
            task_id: task_id.clone(),
        })
    }

    async fn decline_offer(&self, offer_id: &OfferId) -> Result<(), Report<DriverError>> {
        self.submit(DriverCall::DeclineOffer {
            offer_id: offer_id.clone(),
        })
    }

    async fn send_framework_message(
        &self,
        executor_id: &ExecutorId,
        agent_id: &AgentId,
        data: String,
    ) -> Result<(), Report<DriverError>> {
        self.submit(DriverCall::SendFrameworkMessage {
            executor_id: executor_id.clone(),
            agent_id: agent_id.clone(),
            data,
        })
    }

    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> Result<(), Report<DriverError>> {
        self.submit(DriverCall::ReconcileTasks { statuses })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn rejects_calls_until_connected() {
        let driver = QueuedDriver::new();

        let err = driver.kill_task(&TaskId::from("t1")).await.unwrap_err();
        assert!(matches!(err.current_context(), DriverError::NotConnected));

        driver.set_connected(true);
        driver.kill_task(&TaskId::from("t1")).await.unwrap();
        assert_eq!(driver.pending(), 1);
    }

    #[test(tokio::test)]
    async fn drains_in_submission_order() {
        let driver = QueuedDriver::new();
        driver.set_connected(true);
        driver.decline_offer(&OfferId::from("o1")).await.unwrap();
        driver.kill_task(&TaskId::from("t1")).await.unwrap();

        assert_eq!(
            driver.drain(),
            vec![
                DriverCall::DeclineOffer {
                    offer_id: OfferId::from("o1")
                },
                DriverCall::KillTask {
                    task_id: TaskId::from("t1")
                },
            ]
        );
        assert!(driver.drain().is_empty());
    }

    #[test(tokio::test)]
    async fn next_batch_waits_for_a_call() {
        let driver = Arc::new(QueuedDriver::new());
        driver.set_connected(true);

        let waiter = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.next_batch(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.kill_task(&TaskId::from("t1")).await.unwrap();

        assert_eq!(waiter.await.unwrap().len(), 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn next_batch_times_out_empty() {
        let driver = QueuedDriver::new();

        assert!(driver.next_batch(Duration::from_millis(100)).await.is_empty());
    }
}
