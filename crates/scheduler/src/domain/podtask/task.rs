use api_types::{
    AgentId, ExecutorInfo, Offer, OfferId, PodKey, PodSnapshot, PortRange, Resource,
    ResourceRequest, TaskDescriptor, TaskId, TaskStatus, TaskStatusState, TaskView, CPUS, MEM,
    PORTS,
};
use tokio::time::Instant;

/// Lifecycle of a scheduling task.
///
/// `Created -> Pending -> Launched -> Running -> {Finished | Lost | Failed}`, with
/// `Deleted` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum TaskState {
    /// Registered for a pod, no offer yet
    Created,
    /// Offer claimed, launch not yet submitted
    Pending,
    /// Launch submitted to the resource manager
    Launched,
    Running,
    Finished,
    Lost,
    Failed,
    /// Removed on request of the store
    Deleted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Lost | TaskState::Failed | TaskState::Deleted
        )
    }

    /// Launch submitted and not terminal.
    pub fn is_launched(self) -> bool {
        matches!(self, TaskState::Launched | TaskState::Running)
    }

    pub fn successors(self) -> &'static [TaskState] {
        use TaskState::*;
        match self {
            Created => &[Pending, Deleted],
            Pending => &[Launched, Failed, Deleted],
            Launched => &[Running, Finished, Lost, Failed, Deleted],
            Running => &[Finished, Lost, Failed, Deleted],
            Finished | Lost | Failed | Deleted => &[],
        }
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        self.successors().contains(&next)
    }
}

impl From<TaskStatusState> for TaskState {
    fn from(state: TaskStatusState) -> Self {
        match state {
            TaskStatusState::Staging | TaskStatusState::Starting => TaskState::Launched,
            TaskStatusState::Running => TaskState::Running,
            TaskStatusState::Finished => TaskState::Finished,
            TaskStatusState::Failed | TaskStatusState::Error => TaskState::Failed,
            TaskStatusState::Killed | TaskStatusState::Lost => TaskState::Lost,
        }
    }
}

/// Scheduling intent for one pod.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub pod: PodKey,
    pub pod_uid: String,
    pub resources: ResourceRequest,
    pub state: TaskState,
    pub offer_id: Option<OfferId>,
    pub agent_id: Option<AgentId>,
    pub hostname: Option<String>,
    pub ports: Vec<u64>,
    pub executor: ExecutorInfo,
    /// A store read is deciding what happened to this task
    pub reconciling: bool,
    pub last_status: Option<TaskStatus>,
    pub updated_at: Instant,
}

impl Task {
    pub fn new(pod: &PodSnapshot, executor: ExecutorInfo) -> Self {
        Self {
            id: Self::id_for(pod),
            pod: pod.key(),
            pod_uid: pod.uid.clone(),
            resources: pod.resources,
            state: TaskState::Created,
            offer_id: None,
            agent_id: None,
            hostname: None,
            ports: Vec::new(),
            executor,
            reconciling: false,
            last_status: None,
            updated_at: Instant::now(),
        }
    }

    /// Task ID derived from pod identity.
    pub fn id_for(pod: &PodSnapshot) -> TaskId {
        if pod.uid.is_empty() {
            TaskId(format!("pod.{}.{}", pod.namespace, pod.name))
        } else {
            TaskId(format!("pod.{}.{}.{}", pod.namespace, pod.name, pod.uid))
        }
    }

    /// Binds the task to a claimed offer and moves it to `Pending`.
    pub fn assign(&mut self, offer: &Offer, ports: Vec<u64>) {
        self.offer_id = Some(offer.id.clone());
        self.agent_id = Some(offer.agent_id.clone());
        self.hostname = Some(offer.hostname.clone());
        self.ports = ports;
        self.state = TaskState::Pending;
    }

    pub fn with_state(&self, state: TaskState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Launch request body for this task.
    pub fn descriptor(&self) -> TaskDescriptor {
        let mut resources = vec![
            Resource::scalar(CPUS, self.resources.cpus),
            Resource::scalar(MEM, self.resources.mem_mb),
        ];
        if !self.ports.is_empty() {
            resources.push(Resource::ranges(
                PORTS,
                self.ports.iter().map(|port| PortRange::new(*port, *port)).collect(),
            ));
        }

        TaskDescriptor {
            task_id: self.id.clone(),
            name: format!("{}.{}.pod", self.pod.name, self.pod.namespace),
            agent_id: self.agent_id.clone().unwrap_or_else(|| AgentId(String::new())),
            executor: self.executor.clone(),
            resources,
            data: self.pod.to_string().into_bytes(),
        }
    }

    /// Status the resource manager last reported, or one derived from our state.
    pub fn known_status(&self) -> TaskStatus {
        self.last_status.clone().unwrap_or_else(|| {
            let state = match self.state {
                TaskState::Running => TaskStatusState::Running,
                _ => TaskStatusState::Staging,
            };
            TaskStatus {
                agent_id: self.agent_id.clone(),
                executor_id: Some(self.executor.executor_id.clone()),
                ..TaskStatus::new(self.id.clone(), state)
            }
        })
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.id.clone(),
            pod: self.pod.clone(),
            state: self.state.to_string(),
            hostname: self.hostname.clone(),
            offer_id: self.offer_id.clone(),
            reconciling: self.reconciling,
        }
    }
}

#[cfg(test)]
mod tests {
    use api_types::ExecutorId;
    use similar_asserts::assert_eq;

    use super::*;

    fn pod() -> PodSnapshot {
        PodSnapshot {
            namespace: "default".to_string(),
            name: "foo".to_string(),
            uid: "uid-1".to_string(),
            resources: ResourceRequest {
                cpus: 0.5,
                mem_mb: 32.0,
                ports: 2,
            },
            node_name: None,
            deleting: false,
        }
    }

    fn executor() -> ExecutorInfo {
        ExecutorInfo {
            executor_id: ExecutorId::from("executor-id"),
            command: "executor-cmd".to_string(),
            data: b"xyz".to_vec(),
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for state in [
            TaskState::Finished,
            TaskState::Lost,
            TaskState::Failed,
            TaskState::Deleted,
        ] {
            assert!(state.is_terminal());
            assert!(state.successors().is_empty());
        }
    }

    #[test]
    fn deleted_reachable_from_every_live_state() {
        for state in [
            TaskState::Created,
            TaskState::Pending,
            TaskState::Launched,
            TaskState::Running,
        ] {
            assert!(state.can_transition_to(TaskState::Deleted), "{state}");
        }
    }

    #[test]
    fn no_going_back() {
        assert!(!TaskState::Running.can_transition_to(TaskState::Launched));
        assert!(!TaskState::Launched.can_transition_to(TaskState::Pending));
        assert!(!TaskState::Created.can_transition_to(TaskState::Running));
    }

    #[test]
    fn status_states_map_onto_task_states() {
        assert_eq!(TaskState::from(TaskStatusState::Starting), TaskState::Launched);
        assert_eq!(TaskState::from(TaskStatusState::Error), TaskState::Failed);
        assert_eq!(TaskState::from(TaskStatusState::Killed), TaskState::Lost);
    }

    #[test]
    fn task_id_is_stable_for_a_pod() {
        assert_eq!(Task::id_for(&pod()), Task::id_for(&pod()));
        assert_eq!(Task::id_for(&pod()).to_string(), "pod.default.foo.uid-1");
    }

    #[test]
    fn descriptor_carries_assigned_resources() {
        let mut task = Task::new(&pod(), executor());
        let offer = Offer {
            id: "offer1".into(),
            agent_id: "agent1".into(),
            hostname: "h1".to_string(),
            resources: vec![],
        };
        task.assign(&offer, vec![8000, 8001]);

        let descriptor = task.descriptor();

        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(descriptor.agent_id, AgentId::from("agent1"));
        assert_eq!(descriptor.executor.data.len(), 3);
        assert_eq!(descriptor.resources.len(), 3);
        assert_eq!(descriptor.data, b"default/foo".to_vec());
    }
}
