//! Shared API type definitions
//!
//! This crate contains the data model exchanged between the scheduler core, the
//! resource-manager bridge and the orchestration store adapters: pod snapshots,
//! resource offers, task descriptors and task status updates.

use chrono::DateTime;
use chrono::Utc;
use derive_more::Display;
use derive_more::From;
use serde::Deserialize;
use serde::Serialize;

/// Namespace assumed for pods that arrive without one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Scalar resource carrying CPU shares.
pub const CPUS: &str = "cpus";
/// Scalar resource carrying memory in megabytes.
pub const MEM: &str = "mem";
/// Range resource carrying host ports.
pub const PORTS: &str = "ports";

/// Pod identity in the orchestration store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{namespace}/{name}")]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Resources a pod asks for.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: f64,
    pub mem_mb: f64,
    /// Number of host ports the pod needs
    pub ports: u32,
}

/// Read-only view of a pod as the orchestration store knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub resources: ResourceRequest,
    /// Host the pod is bound to, if any
    pub node_name: Option<String>,
    /// The store wants this pod gone
    #[serde(default)]
    pub deleting: bool,
}

impl PodSnapshot {
    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name)
    }

    pub fn is_bound(&self) -> bool {
        self.node_name.as_deref().is_some_and(|node| !node.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[serde(transparent)]
pub struct OfferId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[serde(transparent)]
pub struct AgentId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[serde(transparent)]
pub struct TaskId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[serde(transparent)]
pub struct ExecutorId(pub String);

impl From<&str> for OfferId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for ExecutorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Inclusive interval of port numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u64,
    pub end: u64,
}

impl PortRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Number of ports covered, saturating at `u64::MAX`.
    pub fn len(&self) -> u64 {
        if self.end < self.begin {
            0
        } else {
            (self.end - self.begin).saturating_add(1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceValue {
    Scalar(f64),
    Ranges(Vec<PortRange>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: ResourceValue,
}

impl Resource {
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: ResourceValue::Scalar(value),
        }
    }

    pub fn ranges(name: impl Into<String>, ranges: Vec<PortRange>) -> Self {
        Self {
            name: name.into(),
            value: ResourceValue::Ranges(ranges),
        }
    }
}

/// Resources advertised by one agent, usable by a single launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Vec<Resource>,
}

impl Offer {
    /// Sum of every scalar resource with the given name.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter(|resource| resource.name == name)
            .filter_map(|resource| match resource.value {
                ResourceValue::Scalar(value) => Some(value),
                ResourceValue::Ranges(_) => None,
            })
            .sum()
    }

    pub fn ranges<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PortRange> + 'a {
        self.resources
            .iter()
            .filter(move |resource| resource.name == name)
            .flat_map(|resource| match &resource.value {
                ResourceValue::Ranges(ranges) => ranges.as_slice(),
                ResourceValue::Scalar(_) => &[],
            })
    }

    pub fn cpus(&self) -> f64 {
        self.scalar(CPUS)
    }

    pub fn mem_mb(&self) -> f64 {
        self.scalar(MEM)
    }

    /// Port ranges sorted by start, with overlapping and adjacent ranges merged.
    pub fn port_ranges(&self) -> Vec<PortRange> {
        let mut ranges: Vec<PortRange> = self
            .ranges(PORTS)
            .filter(|range| !range.is_empty())
            .copied()
            .collect();
        ranges.sort_by_key(|range| range.begin);

        let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.begin <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        merged
    }

    pub fn free_ports(&self) -> u64 {
        self.port_ranges()
            .iter()
            .fold(0u64, |total, range| total.saturating_add(range.len()))
    }

    /// Picks the lowest `count` distinct ports.
    pub fn take_ports(&self, count: u32) -> Option<Vec<u64>> {
        let wanted = count as usize;
        let ports: Vec<u64> = self
            .port_ranges()
            .into_iter()
            .flat_map(|range| range.begin..=range.end)
            .take(wanted)
            .collect();
        (ports.len() == wanted).then_some(ports)
    }
}

/// Executor that runs launched pods on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub command: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// A single task handed to the resource manager inside a launch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub executor: ExecutorInfo,
    pub resources: Vec<Resource>,
    /// Serialized pod identity for the executor
    pub data: Vec<u8>,
}

/// Task states as reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatusState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

/// Status update for a launched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub agent_id: Option<AgentId>,
    pub executor_id: Option<ExecutorId>,
    pub state: TaskStatusState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskStatusState) -> Self {
        Self {
            task_id,
            agent_id: None,
            executor_id: None,
            state,
            timestamp: Utc::now(),
            message: None,
            data: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Outbound request towards the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverCall {
    LaunchTasks {
        offer_id: OfferId,
        tasks: Vec<TaskDescriptor>,
    },
    KillTask {
        task_id: TaskId,
    },
    DeclineOffer {
        offer_id: OfferId,
    },
    SendFrameworkMessage {
        executor_id: ExecutorId,
        agent_id: AgentId,
        data: String,
    },
    ReconcileTasks {
        statuses: Vec<TaskStatus>,
    },
}

/// Body of the `registered` callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredRequest {
    pub framework_id: String,
}

/// Body of the `offer rescinded` callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescindRequest {
    pub offer_id: OfferId,
}

/// Task as exposed by the introspection API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub pod: PodKey,
    pub state: String,
    pub hostname: Option<String>,
    pub offer_id: Option<OfferId>,
    pub reconciling: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(resources: Vec<Resource>) -> Offer {
        Offer {
            id: "offer1".into(),
            agent_id: "agent1".into(),
            hostname: "h1".to_string(),
            resources,
        }
    }

    #[test]
    fn pod_key_renders_namespace_and_name() {
        assert_eq!(PodKey::new("default", "foo").to_string(), "default/foo");
    }

    #[test]
    fn offer_sums_scalars_and_counts_ports() {
        let offer = offer(vec![
            Resource::scalar(CPUS, 1.5),
            Resource::scalar(CPUS, 0.5),
            Resource::scalar(MEM, 512.0),
            Resource::ranges(PORTS, vec![PortRange::new(31000, 31001), PortRange::new(40000, 40000)]),
        ]);

        assert_eq!(offer.cpus(), 2.0);
        assert_eq!(offer.mem_mb(), 512.0);
        assert_eq!(offer.free_ports(), 3);
        assert_eq!(offer.take_ports(3), Some(vec![31000, 31001, 40000]));
        assert_eq!(offer.take_ports(4), None);
    }

    #[test]
    fn huge_ranges_saturate_instead_of_overflowing() {
        let offer = offer(vec![Resource::ranges(
            PORTS,
            vec![PortRange::new(0, u64::MAX), PortRange::new(5, u64::MAX - 1)],
        )]);

        assert_eq!(PortRange::new(0, u64::MAX).len(), u64::MAX);
        assert_eq!(offer.free_ports(), u64::MAX);
        assert_eq!(offer.take_ports(2), Some(vec![0, 1]));
    }

    #[test]
    fn overlapping_ranges_yield_distinct_ports() {
        let offer = offer(vec![
            Resource::ranges(PORTS, vec![PortRange::new(8002, 8004), PortRange::new(8000, 8002)]),
            Resource::ranges(PORTS, vec![PortRange::new(8003, 8003), PortRange::new(8005, 8005)]),
        ]);

        assert_eq!(offer.port_ranges(), vec![PortRange::new(8000, 8005)]);
        assert_eq!(offer.free_ports(), 6);
        assert_eq!(offer.take_ports(6), Some(vec![8000, 8001, 8002, 8003, 8004, 8005]));
        assert_eq!(offer.take_ports(7), None);
    }

    #[test]
    fn inverted_range_is_empty() {
        assert!(PortRange::new(10, 9).is_empty());
    }

    #[test]
    fn status_state_uses_resource_manager_names() {
        let json = serde_json::to_string(&TaskStatusState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
