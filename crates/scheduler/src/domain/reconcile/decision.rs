use api_types::PodSnapshot;

/// What made the scheduler doubt a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ReconcileCause {
    /// The executor could not write the pod's binding
    #[display("bind failure")]
    BindFailure,
    /// The task was lost or failed without being deleted
    #[display("task lost")]
    TaskLost,
    /// Launch outcome unknown after (re)registration
    #[display("cold start")]
    ColdStart,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// Forget the task; the pod is not queued again
    Abandon,
    /// Forget the task and queue the pod again
    Requeue(PodSnapshot),
    /// The pod ended up where the task put it
    MarkRunning,
}

/// Decides what to do with a task given the store's view of its pod.
///
/// `task_host` is the host the task was launched on; `pod` is `None` when the store
/// no longer has the pod.
pub fn decide(cause: ReconcileCause, task_host: Option<&str>, pod: Option<&PodSnapshot>) -> ReconcileAction {
    let Some(pod) = pod.filter(|pod| !pod.deleting) else {
        return ReconcileAction::Abandon;
    };

    if !pod.is_bound() {
        return ReconcileAction::Requeue(pod.clone());
    }

    let same_host = task_host.is_some() && pod.node_name.as_deref() == task_host;
    match cause {
        ReconcileCause::BindFailure | ReconcileCause::ColdStart if same_host => {
            ReconcileAction::MarkRunning
        }
        // Bound pods belong to the store; rebinding is not possible.
        _ => ReconcileAction::Abandon,
    }
}

#[cfg(test)]
mod tests {
    use api_types::ResourceRequest;
    use similar_asserts::assert_eq;

    use super::*;

    fn pod(node_name: Option<&str>) -> PodSnapshot {
        PodSnapshot {
            namespace: "default".to_string(),
            name: "foo".to_string(),
            uid: "uid".to_string(),
            resources: ResourceRequest::default(),
            node_name: node_name.map(str::to_string),
            deleting: false,
        }
    }

    #[test]
    fn absent_pod_is_abandoned() {
        for cause in [
            ReconcileCause::BindFailure,
            ReconcileCause::TaskLost,
            ReconcileCause::ColdStart,
        ] {
            assert_eq!(decide(cause, Some("h1"), None), ReconcileAction::Abandon);
        }
    }

    #[test]
    fn terminating_pod_is_abandoned() {
        let mut terminating = pod(None);
        terminating.deleting = true;

        assert_eq!(
            decide(ReconcileCause::BindFailure, Some("h1"), Some(&terminating)),
            ReconcileAction::Abandon
        );
    }

    #[test]
    fn unbound_pod_is_requeued() {
        let unbound = pod(None);
        assert_eq!(
            decide(ReconcileCause::BindFailure, Some("h1"), Some(&unbound)),
            ReconcileAction::Requeue(unbound.clone())
        );

        let empty_node = pod(Some(""));
        assert_eq!(
            decide(ReconcileCause::TaskLost, Some("h1"), Some(&empty_node)),
            ReconcileAction::Requeue(empty_node.clone())
        );
    }

    #[test]
    fn pod_bound_to_task_host_is_running() {
        assert_eq!(
            decide(ReconcileCause::BindFailure, Some("h1"), Some(&pod(Some("h1")))),
            ReconcileAction::MarkRunning
        );
        assert_eq!(
            decide(ReconcileCause::ColdStart, Some("h1"), Some(&pod(Some("h1")))),
            ReconcileAction::MarkRunning
        );
    }

    #[test]
    fn pod_bound_elsewhere_is_abandoned() {
        assert_eq!(
            decide(ReconcileCause::BindFailure, Some("h1"), Some(&pod(Some("h2")))),
            ReconcileAction::Abandon
        );
        assert_eq!(
            decide(ReconcileCause::BindFailure, None, Some(&pod(Some("h1")))),
            ReconcileAction::Abandon
        );
    }

    #[test]
    fn lost_task_never_resumes() {
        assert_eq!(
            decide(ReconcileCause::TaskLost, Some("h1"), Some(&pod(Some("h1")))),
            ReconcileAction::Abandon
        );
    }

    #[test]
    fn decision_is_repeatable() {
        let bound = pod(Some("h1"));
        let first = decide(ReconcileCause::BindFailure, Some("h1"), Some(&bound));
        let second = decide(ReconcileCause::BindFailure, Some("h1"), Some(&bound));
        assert_eq!(first, second);
    }
}
