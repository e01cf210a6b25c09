use std::sync::Arc;
use std::time::Duration;

use api_types::{TaskId, TaskStatus, TaskStatusState};
use scheduler::config::{Backoff, RetryPolicy, SchedulerConfig};
use scheduler::domain::podtask::TaskState;
use scheduler::domain::reconcile::{StatusOutcome, CREATE_BINDING_FAILURE};
use scheduler::domain::traits::EventReason;
use scheduler::testing::{new_test_offer, new_test_pod, EventObserver, InMemoryPodStore, MockDriver};
use scheduler::{PodUpdate, ScheduleOutcome, SchedulerCore};
use similar_asserts::assert_eq;
use test_log::test;

struct Harness {
    store: Arc<InMemoryPodStore>,
    events: Arc<EventObserver>,
    core: SchedulerCore,
}

fn harness() -> Harness {
    let config = SchedulerConfig {
        reconcile: RetryPolicy {
            attempts: 3,
            backoff: Backoff::new(Duration::from_millis(50), Duration::from_millis(50)),
        },
        ..SchedulerConfig::default()
    };
    let store = Arc::new(InMemoryPodStore::new());
    let events = Arc::new(EventObserver::new());
    let core = SchedulerCore::new(
        config,
        Arc::new(MockDriver::new()),
        store.clone(),
        events.clone(),
    );
    Harness {
        store,
        events,
        core,
    }
}

/// Launches pod 1 on offer 1 and reports the executor's bind failure.
async fn launch_and_fail_binding(h: &Harness) -> TaskId {
    h.core.resource_offers(vec![new_test_offer(1)]);
    let ScheduleOutcome::Launched(task_id) = h.core.schedule_one(new_test_pod(1)).await else {
        panic!("pod should launch");
    };
    assert_eq!(h.events.reasons(), vec![EventReason::Scheduled]);

    let failed = TaskStatus::new(task_id.clone(), TaskStatusState::Failed)
        .with_message(CREATE_BINDING_FAILURE);
    assert_eq!(h.core.status_update(failed).await, StatusOutcome::Reconciling);
    task_id
}

#[test(tokio::test)]
async fn deleted_pod_is_abandoned() {
    let h = harness();

    let task_id = launch_and_fail_binding(&h).await;
    h.core.reconciler().wait_idle().await;

    assert!(h.core.tasks().get(&task_id).is_none());
    assert!(h.core.queue().is_empty());
    assert_eq!(h.store.lookups(), 1);
}

#[test(tokio::test)]
async fn unbound_pod_is_requeued() {
    let h = harness();
    h.store.insert(new_test_pod(1));

    let task_id = launch_and_fail_binding(&h).await;
    h.core.reconciler().wait_idle().await;

    assert!(h.core.tasks().get(&task_id).is_none());
    assert_eq!(h.core.queue().list(), vec![new_test_pod(1)]);
    assert_eq!(h.store.lookups(), 1);
}

#[test(tokio::test)]
async fn pod_bound_by_poll_keeps_running() {
    let h = harness();
    h.store.insert(new_test_pod(1));
    h.store.bind(&new_test_pod(1).key(), "h1");

    let task_id = launch_and_fail_binding(&h).await;
    h.core.reconciler().wait_idle().await;

    let task = h.core.tasks().get(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Running);
    assert!(!task.reconciling);
    assert!(h.core.queue().is_empty());
    assert_eq!(h.store.lookups(), 1);
}

#[test(tokio::test)]
async fn pod_bound_by_delayed_watch_keeps_running() {
    let h = harness();
    h.store.insert(new_test_pod(1));
    h.store.fail_next_reads(1);

    let task_id = launch_and_fail_binding(&h).await;
    let bound = h.store.bind(&new_test_pod(1).key(), "h1").unwrap();
    h.core.handle_pod_update(PodUpdate::Modified(bound)).await;

    let task = h.core.tasks().get(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Running);
    assert!(!task.reconciling);

    // The retried read sees the same binding and changes nothing.
    h.core.reconciler().wait_idle().await;
    assert_eq!(h.store.lookups(), 2);
    assert_eq!(h.core.tasks().get(&task_id).unwrap().state, TaskState::Running);
    assert!(h.core.queue().is_empty());
}

#[test(tokio::test)]
async fn deletion_during_reconciliation_wins() {
    let h = harness();
    h.store.insert(new_test_pod(1));
    h.store.fail_next_reads(1);

    let task_id = launch_and_fail_binding(&h).await;
    h.core.handle_pod_update(PodUpdate::Deleted(new_test_pod(1))).await;
    h.core.reconciler().wait_idle().await;

    assert_eq!(h.core.tasks().get(&task_id).unwrap().state, TaskState::Deleted);
    assert!(h.core.queue().is_empty());
}
