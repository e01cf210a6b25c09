use std::sync::Arc;

use api_types::{PodKey, PodSnapshot, TaskId};
use dashmap::DashSet;
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::decision::{decide, ReconcileAction, ReconcileCause};
use crate::config::RetryPolicy;
use crate::domain::podtask::{Task, TaskError, TaskRegistry, TaskState};
use crate::domain::queue::{AddMode, PendingQueue};
use crate::domain::traits::{PodStore, StoreError};

/// Result of applying a reconciliation decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Task forgotten, pod not queued
    Abandoned,
    /// Task forgotten, pod queued again
    Requeued,
    /// Task advanced to `Running`
    Running,
    /// Someone else already settled the task
    Stale,
}

/// Runs store reads for doubtful tasks in the background and applies the outcome.
pub struct Reconciler {
    tasks: Arc<TaskRegistry>,
    queue: Arc<PendingQueue>,
    store: Arc<dyn PodStore>,
    retry: RetryPolicy,
    in_flight: DashSet<(TaskId, ReconcileCause)>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Reconciler {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        queue: Arc<PendingQueue>,
        store: Arc<dyn PodStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tasks,
            queue,
            store,
            retry,
            in_flight: DashSet::new(),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// Starts a background reconciliation for `task`; returns immediately.
    /// A no-op while the same check for the same task is still running.
    pub fn dispatch(self: &Arc<Self>, task: &Task, cause: ReconcileCause) {
        if self.token.is_cancelled() {
            tracing::debug!(task_id = %task.id, "reconciler stopped, dropping {cause}");
            return;
        }
        if !self.in_flight.insert((task.id.clone(), cause)) {
            tracing::debug!(task_id = %task.id, "{cause} check already running");
            return;
        }

        let this = Arc::clone(self);
        let task_id = task.id.clone();
        let pod = task.pod.clone();
        let host = task.hostname.clone();
        tracing::info!(pod = %pod, task_id = %task_id, cause = %cause, "reconciling task");

        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                outcome = this.reconcile(&task_id, &pod, host.as_deref(), cause) => Some(outcome),
                _ = this.token.cancelled() => None,
            };
            this.in_flight.remove(&(task_id.clone(), cause));
            match outcome {
                Some(Ok(applied)) => {
                    tracing::info!(pod = %pod, task_id = %task_id, ?applied, "reconciliation finished");
                }
                // The task keeps its doubt; the next trigger or sweep dispatches again.
                Some(Err(report)) => {
                    tracing::error!(pod = %pod, task_id = %task_id, "reconciliation gave up: {report:?}");
                }
                None => {}
            }
        });
    }

    /// Re-dispatches bind-failure checks that gave up before reaching the store.
    /// Returns how many were started.
    pub fn retry_stalled(self: &Arc<Self>) -> usize {
        let stalled: Vec<Task> = self
            .tasks
            .list()
            .into_iter()
            .filter(|task| task.reconciling && task.state.is_launched())
            .filter(|task| !self.in_flight.contains(&(task.id.clone(), ReconcileCause::BindFailure)))
            .collect();
        for task in &stalled {
            self.dispatch(task, ReconcileCause::BindFailure);
        }
        stalled.len()
    }

    pub fn is_checking(&self, task_id: &TaskId) -> bool {
        self.in_flight.iter().any(|entry| entry.key().0 == *task_id)
    }

    async fn reconcile(
        &self,
        task_id: &TaskId,
        pod: &PodKey,
        host: Option<&str>,
        cause: ReconcileCause,
    ) -> Result<Applied, Report<StoreError>> {
        let snapshot = self.read(pod).await?;
        let action = decide(cause, host, snapshot.as_ref());
        Ok(self.apply(task_id, pod, cause, action).await)
    }

    /// Pod read with bounded exponential backoff.
    async fn read(&self, pod: &PodKey) -> Result<Option<PodSnapshot>, Report<StoreError>> {
        let mut delay = None;
        let mut attempt = 1;
        loop {
            match self.store.get(pod).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(report) if attempt < self.retry.attempts => {
                    let next = self.retry.backoff.next(delay);
                    tracing::warn!(pod = %pod, attempt, "store read failed, retrying in {next:?}: {report}");
                    tokio::time::sleep(next).await;
                    delay = Some(next);
                    attempt += 1;
                }
                Err(report) => {
                    return Err(report.attach_printable(format!("gave up after {attempt} attempts")));
                }
            }
        }
    }

    /// Feeds a pod snapshot seen on the watch into the same decision as a store read.
    /// Only tasks waiting on a bind-failure check are affected.
    pub async fn converge(&self, pod: &PodSnapshot) -> Option<Applied> {
        let key = pod.key();
        let task = self.tasks.get(&key).filter(|task| task.reconciling)?;
        let action = decide(ReconcileCause::BindFailure, task.hostname.as_deref(), Some(pod));
        Some(self.apply(&task.id, &key, ReconcileCause::BindFailure, action).await)
    }

    /// Applies a decision. Safe to call repeatedly: once the task has been settled,
    /// later calls are [`Applied::Stale`].
    pub async fn apply(
        &self,
        task_id: &TaskId,
        pod: &PodKey,
        cause: ReconcileCause,
        action: ReconcileAction,
    ) -> Applied {
        let _guard = self.tasks.lock(pod).await;
        let Some(task) = self.tasks.get(task_id) else {
            return Applied::Stale;
        };
        // Deletion wins over any reconciliation.
        if task.state == TaskState::Deleted {
            return Applied::Stale;
        }
        if !still_in_doubt(cause, &task) {
            tracing::debug!(pod = %pod, state = %task.state, "task settled since the {cause} check started");
            return Applied::Stale;
        }

        let result = match action {
            ReconcileAction::MarkRunning => self.mark_running(&task),
            ReconcileAction::Abandon => self.retire(&task).map(|_| Applied::Abandoned),
            ReconcileAction::Requeue(snapshot) => self.retire(&task).map(|_| {
                self.queue.add(snapshot, AddMode::IfAbsent);
                Applied::Requeued
            }),
        };

        result.unwrap_or_else(|err| {
            tracing::warn!(pod = %pod, task_id = %task_id, "reconciliation lost a race: {err}");
            Applied::Stale
        })
    }

    fn mark_running(&self, task: &Task) -> Result<Applied, TaskError> {
        if task.state.is_terminal() {
            return Ok(Applied::Stale);
        }
        let mut next = task.clone();
        next.reconciling = false;
        if next.state == TaskState::Pending {
            next = self.tasks.update(&next.with_state(TaskState::Launched))?;
        }
        next.state = TaskState::Running;
        self.tasks.update(&next)?;
        Ok(Applied::Running)
    }

    /// Closes out a task and drops it from the registry.
    fn retire(&self, task: &Task) -> Result<(), TaskError> {
        if task.state.is_launched() || task.state == TaskState::Pending {
            let mut failed = task.with_state(TaskState::Failed);
            failed.reconciling = false;
            self.tasks.update(&failed)?;
        }
        self.tasks.delete(&task.id)?;
        Ok(())
    }

    /// Waits for every dispatched reconciliation to finish.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancels outstanding reconciliations and waits for them to stop.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Whether `task` is still in the condition that started a `cause` check.
fn still_in_doubt(cause: ReconcileCause, task: &Task) -> bool {
    match cause {
        ReconcileCause::BindFailure => task.reconciling,
        // A status arriving meanwhile has already settled the launch.
        ReconcileCause::ColdStart => task.state == TaskState::Pending,
        ReconcileCause::TaskLost => matches!(task.state, TaskState::Lost | TaskState::Failed),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::{ExecutorId, ExecutorInfo};
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::config::Backoff;
    use crate::testing::{new_test_offer, new_test_pod, InMemoryPodStore};

    struct Fixture {
        tasks: Arc<TaskRegistry>,
        queue: Arc<PendingQueue>,
        store: Arc<InMemoryPodStore>,
        reconciler: Arc<Reconciler>,
    }

    fn fixture(attempts: u32) -> Fixture {
        let tasks = Arc::new(TaskRegistry::new());
        let queue = Arc::new(PendingQueue::new());
        let store = Arc::new(InMemoryPodStore::new());
        let retry = RetryPolicy {
            attempts,
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        };
        let reconciler = Arc::new(Reconciler::new(tasks.clone(), queue.clone(), store.clone(), retry));
        Fixture {
            tasks,
            queue,
            store,
            reconciler,
        }
    }

    fn running_task(f: &Fixture, reconciling: bool) -> Task {
        let pod = new_test_pod(1);
        let executor = ExecutorInfo {
            executor_id: ExecutorId::from("executor-id"),
            command: String::new(),
            data: Vec::new(),
        };
        let mut task = f.tasks.register(&pod, executor).unwrap();
        task.assign(&new_test_offer(1), vec![8000]);
        let task = f.tasks.update(&task).unwrap();
        let task = f.tasks.update(&task.with_state(TaskState::Launched)).unwrap();
        let mut task = f.tasks.update(&task.with_state(TaskState::Running)).unwrap();
        task.reconciling = reconciling;
        f.tasks.update(&task).unwrap()
    }

    #[test(tokio::test)]
    async fn retries_failed_reads() {
        let f = fixture(3);
        let task = running_task(&f, true);
        f.store.fail_next_reads(2);

        f.reconciler.dispatch(&task, ReconcileCause::BindFailure);
        f.reconciler.wait_idle().await;

        assert_eq!(f.store.lookups(), 3);
        assert!(f.tasks.get(&task.id).is_none());
        assert!(f.queue.is_empty());
    }

    #[test(tokio::test)]
    async fn stalled_check_runs_again_after_giving_up() {
        let f = fixture(2);
        let task = running_task(&f, true);
        f.store.fail_next_reads(2);
        f.store.insert(new_test_pod(1));

        f.reconciler.dispatch(&task, ReconcileCause::BindFailure);
        f.reconciler.wait_idle().await;

        assert_eq!(f.store.lookups(), 2);
        let kept = f.tasks.get(&task.id).unwrap();
        assert!(kept.reconciling);
        assert!(!f.reconciler.is_checking(&task.id));

        assert_eq!(f.reconciler.retry_stalled(), 1);
        f.reconciler.wait_idle().await;

        assert_eq!(f.store.lookups(), 3);
        assert!(f.tasks.get(&task.id).is_none());
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.reconciler.retry_stalled(), 0);
    }

    #[test(tokio::test)]
    async fn duplicate_dispatch_reads_once() {
        let f = fixture(1);
        let task = running_task(&f, true);

        f.reconciler.dispatch(&task, ReconcileCause::BindFailure);
        f.reconciler.dispatch(&task, ReconcileCause::BindFailure);
        f.reconciler.wait_idle().await;

        assert_eq!(f.store.lookups(), 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn cold_start_check_yields_to_a_confirmed_launch() {
        let f = fixture(3);
        let pod = new_test_pod(1);
        f.store.insert(pod.clone());
        let executor = ExecutorInfo {
            executor_id: ExecutorId::from("executor-id"),
            command: String::new(),
            data: Vec::new(),
        };
        let mut task = f.tasks.register(&pod, executor).unwrap();
        task.assign(&new_test_offer(1), vec![8000]);
        let pending = f.tasks.update(&task).unwrap();
        f.store.fail_next_reads(1);

        f.reconciler.dispatch(&pending, ReconcileCause::ColdStart);
        // The launch is confirmed while the read backs off.
        tokio::task::yield_now().await;
        let launched = f.tasks.update(&pending.with_state(TaskState::Launched)).unwrap();
        f.tasks.update(&launched.with_state(TaskState::Running)).unwrap();
        f.reconciler.wait_idle().await;

        assert_eq!(f.store.lookups(), 2);
        assert_eq!(f.tasks.get(&pending.id).unwrap().state, TaskState::Running);
        assert!(f.queue.is_empty());
    }

    #[test(tokio::test)]
    async fn apply_is_idempotent() {
        let f = fixture(1);
        let task = running_task(&f, true);

        let first = f
            .reconciler
            .apply(&task.id, &task.pod, ReconcileCause::BindFailure, ReconcileAction::MarkRunning)
            .await;
        let second = f
            .reconciler
            .apply(&task.id, &task.pod, ReconcileCause::BindFailure, ReconcileAction::MarkRunning)
            .await;

        assert_eq!(first, Applied::Running);
        assert_eq!(second, Applied::Stale);
        assert!(!f.tasks.get(&task.id).unwrap().reconciling);
    }

    #[test(tokio::test)]
    async fn deletion_wins() {
        let f = fixture(1);
        let task = running_task(&f, true);
        f.tasks.update(&task.with_state(TaskState::Deleted)).unwrap();

        let applied = f
            .reconciler
            .apply(
                &task.id,
                &task.pod,
                ReconcileCause::BindFailure,
                ReconcileAction::Requeue(new_test_pod(1)),
            )
            .await;

        assert_eq!(applied, Applied::Stale);
        assert!(f.queue.is_empty());
    }

    #[test(tokio::test)]
    async fn watch_snapshot_converges_like_a_read() {
        let f = fixture(1);
        let task = running_task(&f, true);
        let mut bound = new_test_pod(1);
        bound.node_name = Some("h1".to_string());

        assert_eq!(f.reconciler.converge(&bound).await, Some(Applied::Running));
        assert_eq!(f.reconciler.converge(&bound).await, None);
        assert_eq!(f.tasks.get(&task.id).unwrap().state, TaskState::Running);
    }

    #[test(tokio::test)]
    async fn shutdown_stops_pending_work() {
        let f = fixture(10);
        let task = running_task(&f, true);
        f.store.fail_next_reads(100);

        f.reconciler.dispatch(&task, ReconcileCause::BindFailure);
        tokio::time::timeout(Duration::from_secs(1), f.reconciler.shutdown())
            .await
            .expect("shutdown should not wait for retries");

        f.reconciler.dispatch(&task, ReconcileCause::BindFailure);
        assert!(f.store.lookups() < 10);
    }
}
