//! Test doubles for the scheduler's collaborators

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use api_types::{
    AgentId, DriverCall, ExecutorId, Offer, OfferId, PodKey, PodSnapshot, PortRange, Resource,
    ResourceRequest, TaskDescriptor, TaskId, TaskStatus, CPUS, DEFAULT_NAMESPACE, MEM, PORTS,
};
use dashmap::DashMap;
use error_stack::{bail, Report};
use tokio::sync::watch;

use crate::domain::traits::{
    DriverError, EventReason, EventRecorder, PodStore, SchedulerDriver, StoreError,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Offer with 3.75 cpus, 940 MB and ports 8000-9000 on host `h{i}`.
pub fn new_test_offer(i: usize) -> Offer {
    Offer {
        id: OfferId(format!("offer{i}")),
        agent_id: AgentId(format!("agent{i}")),
        hostname: format!("h{i}"),
        resources: vec![
            Resource::scalar(CPUS, 3.75),
            Resource::scalar(MEM, 940.0),
            Resource::ranges(PORTS, vec![PortRange::new(8000, 9000)]),
        ],
    }
}

/// Unbound pod `default/pod{i}` asking for 1 cpu, 32 MB and one port.
pub fn new_test_pod(i: usize) -> PodSnapshot {
    PodSnapshot {
        namespace: DEFAULT_NAMESPACE.to_string(),
        name: format!("pod{i}"),
        uid: format!("uid-{i}"),
        resources: ResourceRequest {
            cpus: 1.0,
            mem_mb: 32.0,
            ports: 1,
        },
        node_name: None,
        deleting: false,
    }
}

/// Records every driver call; can be told to fail.
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    failures: AtomicUsize,
    count: watch::Sender<usize>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            count: watch::Sender::new(0),
        }
    }

    /// The next `n` calls return an error without being recorded.
    pub fn fail_next_calls(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        locked(&self.calls).clone()
    }

    pub fn launched(&self) -> Vec<(OfferId, Vec<TaskDescriptor>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::LaunchTasks { offer_id, tasks } => Some((offer_id, tasks)),
                _ => None,
            })
            .collect()
    }

    pub fn killed(&self) -> Vec<TaskId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::KillTask { task_id } => Some(task_id),
                _ => None,
            })
            .collect()
    }

    pub fn declined(&self) -> Vec<OfferId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::DeclineOffer { offer_id } => Some(offer_id),
                _ => None,
            })
            .collect()
    }

    pub fn framework_messages(&self) -> Vec<(ExecutorId, AgentId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::SendFrameworkMessage {
                    executor_id,
                    agent_id,
                    data,
                } => Some((executor_id, agent_id, data)),
                _ => None,
            })
            .collect()
    }

    pub fn reconciled(&self) -> Vec<Vec<TaskStatus>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::ReconcileTasks { statuses } => Some(statuses),
                _ => None,
            })
            .collect()
    }

    /// Waits until at least `n` calls were recorded.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let mut count = self.count.subscribe();
        tokio::time::timeout(timeout, count.wait_for(|seen| *seen >= n))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    fn record(&self, call: DriverCall, name: &'static str) -> Result<(), Report<DriverError>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            bail!(DriverError::SubmitFailed { call: name });
        }

        let len = {
            let mut calls = locked(&self.calls);
            calls.push(call);
            calls.len()
        };
        self.count.send_replace(len);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SchedulerDriver for MockDriver {
    async fn launch_tasks(
        &self,
        offer_id: &OfferId,
        tasks: Vec<TaskDescriptor>,
    ) -> Result<(), Report<DriverError>> {
        self.record(
            DriverCall::LaunchTasks {
                offer_id: offer_id.clone(),
                tasks,
            },
            "launch",
        )
    }

    async fn kill_task(&self, task_id: &TaskId) -> Result<(), Report<DriverError>> {
        self.record(
            DriverCall::KillTask {
                task_id: task_id.clone(),
            },
            "kill",
        )
    }

    async fn decline_offer(&self, offer_id: &OfferId) -> Result<(), Report<DriverError>> {
        self.record(
            DriverCall::DeclineOffer {
                offer_id: offer_id.clone(),
            },
            "decline",
        )
    }

    async fn send_framework_message(
        &self,
        executor_id: &ExecutorId,
        agent_id: &AgentId,
        data: String,
    ) -> Result<(), Report<DriverError>> {
        self.record(
            DriverCall::SendFrameworkMessage {
                executor_id: executor_id.clone(),
                agent_id: agent_id.clone(),
                data,
            },
            "framework message",
        )
    }

    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> Result<(), Report<DriverError>> {
        self.record(DriverCall::ReconcileTasks { statuses }, "reconcile")
    }
}

/// Pod store backed by a map, counting lookups.
#[derive(Default)]
pub struct InMemoryPodStore {
    pods: DashMap<PodKey, PodSnapshot>,
    lookups: AtomicUsize,
    failures: AtomicUsize,
}

impl InMemoryPodStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pod: PodSnapshot) {
        self.pods.insert(pod.key(), pod);
    }

    pub fn remove(&self, key: &PodKey) -> Option<PodSnapshot> {
        self.pods.remove(key).map(|(_, pod)| pod)
    }

    /// Marks a stored pod as bound to `host` and returns the new snapshot.
    pub fn bind(&self, key: &PodKey, host: &str) -> Option<PodSnapshot> {
        let mut pod = self.pods.get_mut(key)?;
        pod.node_name = Some(host.to_string());
        Some(pod.clone())
    }

    /// Number of `get` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// The next `n` reads fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl PodStore for InMemoryPodStore {
    async fn get(&self, key: &PodKey) -> Result<Option<PodSnapshot>, Report<StoreError>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            bail!(StoreError::ReadFailed { pod: key.clone() });
        }
        Ok(self.pods.get(key).map(|pod| pod.clone()))
    }

    async fn list(&self) -> Result<Vec<PodSnapshot>, Report<StoreError>> {
        if self.should_fail() {
            bail!(StoreError::ListFailed);
        }
        let mut pods: Vec<_> = self.pods.iter().map(|pod| pod.clone()).collect();
        pods.sort_by_key(PodSnapshot::key);
        Ok(pods)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub pod: PodKey,
    pub reason: EventReason,
    pub message: String,
}

/// Keeps recorded events for inspection.
pub struct EventObserver {
    events: Mutex<Vec<RecordedEvent>>,
    count: watch::Sender<usize>,
}

impl Default for EventObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl EventObserver {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            count: watch::Sender::new(0),
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        locked(&self.events).clone()
    }

    pub fn reasons(&self) -> Vec<EventReason> {
        self.events().into_iter().map(|event| event.reason).collect()
    }

    /// Waits until an event with `reason` has been recorded `n` times.
    pub async fn wait_for(&self, reason: EventReason, n: usize, timeout: Duration) -> bool {
        let mut count = self.count.subscribe();
        tokio::time::timeout(
            timeout,
            count.wait_for(|_| self.reasons().iter().filter(|seen| **seen == reason).count() >= n),
        )
        .await
        .is_ok_and(|result| result.is_ok())
    }
}

impl EventRecorder for EventObserver {
    fn event(&self, pod: &PodKey, reason: EventReason, message: String) {
        let len = {
            let mut events = locked(&self.events);
            events.push(RecordedEvent {
                pod: pod.clone(),
                reason,
                message,
            });
            events.len()
        };
        self.count.send_replace(len);
    }
}
