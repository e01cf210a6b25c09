//! Pod objects to scheduler snapshots

use api_types::{PodSnapshot, ResourceRequest, DEFAULT_NAMESPACE};
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const MIB: f64 = 1024.0 * 1024.0;

/// Requests assumed for containers that declare none.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerDefaults {
    pub cpus: f64,
    pub mem_mb: f64,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            cpus: 0.25,
            mem_mb: 64.0,
        }
    }
}

/// Builds a snapshot from a pod. Pods without a name yield `None`.
pub fn pod_snapshot(pod: &Pod, defaults: &ContainerDefaults) -> Option<PodSnapshot> {
    let metadata = &pod.metadata;
    let name = metadata.name.clone().filter(|name| !name.is_empty())?;
    let namespace = metadata
        .namespace
        .clone()
        .filter(|namespace| !namespace.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    let spec = pod.spec.as_ref();
    let resources = spec
        .map(|spec| pod_resources(&spec.containers, defaults))
        .unwrap_or_default();

    Some(PodSnapshot {
        namespace,
        name,
        uid: metadata.uid.clone().unwrap_or_default(),
        resources,
        node_name: spec
            .and_then(|spec| spec.node_name.clone())
            .filter(|node| !node.is_empty()),
        deleting: metadata.deletion_timestamp.is_some(),
    })
}

/// Sums container requests. Limits stand in for missing requests, then defaults.
fn pod_resources(containers: &[Container], defaults: &ContainerDefaults) -> ResourceRequest {
    let mut total = ResourceRequest::default();
    for container in containers {
        let cpus = container_quantity(container, "cpu").unwrap_or(defaults.cpus);
        let mem_mb = container_quantity(container, "memory")
            .map(|bytes| bytes / MIB)
            .unwrap_or(defaults.mem_mb);
        total.cpus += cpus;
        total.mem_mb += mem_mb;
        total.ports += container
            .ports
            .as_ref()
            .map_or(0, |ports| ports.len() as u32);
    }
    total
}

fn container_quantity(container: &Container, resource: &str) -> Option<f64> {
    let resources = container.resources.as_ref()?;
    let lookup = |map: &Option<std::collections::BTreeMap<String, Quantity>>| {
        map.as_ref()
            .and_then(|map| map.get(resource))
            .and_then(|quantity| parse_quantity(&quantity.0))
    };
    lookup(&resources.requests).or_else(|| lookup(&resources.limits))
}

const SUFFIXES: [(&str, f64); 13] = [
    ("Ki", 1024.0),
    ("Mi", MIB),
    ("Gi", MIB * 1024.0),
    ("Ti", MIB * MIB),
    ("Pi", MIB * MIB * 1024.0),
    ("Ei", MIB * MIB * MIB),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parses a Kubernetes quantity (`500m`, `2`, `64Mi`, `1G`, `1e3`) into base units.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            raw.strip_suffix(suffix)
                .filter(|number| number.parse::<f64>().is_ok())
                .map(|number| (number, *multiplier))
        })
        .unwrap_or((raw, 1.0));

    let parsed = number.parse::<f64>().ok()? * multiplier;
    (parsed.is_finite() && parsed >= 0.0).then_some(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{ContainerPort, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use similar_asserts::assert_eq;

    use super::*;

    fn container(requests: &[(&str, &str)], ports: usize) -> Container {
        let requests: BTreeMap<String, Quantity> = requests
            .iter()
            .map(|(name, value)| (name.to_string(), Quantity(value.to_string())))
            .collect();
        Container {
            name: "main".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ports: Some(
                (0..ports)
                    .map(|i| ContainerPort {
                        container_port: 80 + i as i32,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn pod(name: Option<&str>, namespace: Option<&str>, containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                namespace: namespace.map(str::to_string),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("500m"), Some(0.5));
        assert_eq!(parse_quantity("2"), Some(2.0));
        assert_eq!(parse_quantity("64Mi"), Some(64.0 * MIB));
        assert_eq!(parse_quantity("1G"), Some(1e9));
        assert_eq!(parse_quantity("1e3"), Some(1000.0));
        assert_eq!(parse_quantity("12Qi"), None);
        assert_eq!(parse_quantity("-1"), None);
        assert_eq!(parse_quantity(""), None);
    }

    #[test]
    fn sums_container_requests() {
        let pod = pod(
            Some("web"),
            Some("prod"),
            vec![
                container(&[("cpu", "500m"), ("memory", "128Mi")], 1),
                container(&[("cpu", "1"), ("memory", "64Mi")], 2),
            ],
        );

        let snapshot = pod_snapshot(&pod, &ContainerDefaults::default()).unwrap();

        assert_eq!(snapshot.namespace, "prod");
        assert_eq!(snapshot.name, "web");
        assert_eq!(snapshot.uid, "uid-1");
        assert_eq!(
            snapshot.resources,
            ResourceRequest {
                cpus: 1.5,
                mem_mb: 192.0,
                ports: 3,
            }
        );
        assert!(!snapshot.is_bound());
        assert!(!snapshot.deleting);
    }

    #[test]
    fn missing_requests_use_defaults() {
        let defaults = ContainerDefaults {
            cpus: 0.25,
            mem_mb: 64.0,
        };
        let pod = pod(Some("web"), None, vec![container(&[], 0)]);

        let snapshot = pod_snapshot(&pod, &defaults).unwrap();

        assert_eq!(snapshot.namespace, DEFAULT_NAMESPACE);
        assert_eq!(snapshot.resources.cpus, 0.25);
        assert_eq!(snapshot.resources.mem_mb, 64.0);
        assert_eq!(snapshot.resources.ports, 0);
    }

    #[test]
    fn binding_and_deletion_are_carried() {
        let mut pod = pod(Some("web"), Some("default"), vec![container(&[], 0)]);
        if let Some(spec) = pod.spec.as_mut() {
            spec.node_name = Some("h1".to_string());
        }
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let snapshot = pod_snapshot(&pod, &ContainerDefaults::default()).unwrap();

        assert_eq!(snapshot.node_name.as_deref(), Some("h1"));
        assert!(snapshot.deleting);
    }

    #[test]
    fn unnamed_pod_is_skipped() {
        assert!(pod_snapshot(&pod(None, None, vec![]), &ContainerDefaults::default()).is_none());
    }
}
