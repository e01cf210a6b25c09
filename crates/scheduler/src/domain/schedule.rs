//! Matching pods against offers

use api_types::{Offer, OfferId, PodKey, PodSnapshot};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no suitable offer for pod {pod}")]
    NoSuitableOffer { pod: PodKey },
}

/// Picks an offer for a pod. Implementations must be pure: same input, same answer.
pub trait ScheduleFunc: Send + Sync {
    fn schedule(&self, pod: &PodSnapshot, offers: &[Offer]) -> Result<OfferId, ScheduleError>;
}

/// First come first served: the first offer, in the given order, that covers the pod.
#[derive(Debug, Default, Clone, Copy)]
pub struct FcfsScheduler;

impl FcfsScheduler {
    pub fn fits(pod: &PodSnapshot, offer: &Offer) -> bool {
        let request = &pod.resources;
        offer.cpus() >= request.cpus
            && offer.mem_mb() >= request.mem_mb
            && offer.free_ports() >= u64::from(request.ports)
    }
}

impl ScheduleFunc for FcfsScheduler {
    fn schedule(&self, pod: &PodSnapshot, offers: &[Offer]) -> Result<OfferId, ScheduleError> {
        offers
            .iter()
            .find(|offer| Self::fits(pod, offer))
            .map(|offer| offer.id.clone())
            .ok_or_else(|| ScheduleError::NoSuitableOffer { pod: pod.key() })
    }
}

#[cfg(test)]
mod tests {
    use api_types::{PortRange, Resource, ResourceRequest, CPUS, MEM, PORTS};
    use similar_asserts::assert_eq;

    use super::*;

    fn pod(cpus: f64, mem_mb: f64, ports: u32) -> PodSnapshot {
        PodSnapshot {
            namespace: "default".to_string(),
            name: "pod1".to_string(),
            uid: String::new(),
            resources: ResourceRequest {
                cpus,
                mem_mb,
                ports,
            },
            node_name: None,
            deleting: false,
        }
    }

    fn offer(id: &str, cpus: f64, mem: f64, ports: Vec<PortRange>) -> Offer {
        Offer {
            id: id.into(),
            agent_id: "agent".into(),
            hostname: "host".to_string(),
            resources: vec![
                Resource::scalar(CPUS, cpus),
                Resource::scalar(MEM, mem),
                Resource::ranges(PORTS, ports),
            ],
        }
    }

    #[test]
    fn skips_offers_that_do_not_fit() {
        let no_fit = offer("no_fit", 0.5, 16.0, vec![]);
        let fits = offer("fits", 3.75, 940.0, vec![PortRange::new(8000, 9000)]);

        let chosen = FcfsScheduler.schedule(&pod(1.0, 32.0, 1), &[no_fit, fits]);

        assert_eq!(chosen, Ok(OfferId::from("fits")));
    }

    #[test]
    fn first_of_equal_fits_wins() {
        let a = offer("A", 2.0, 64.0, vec![PortRange::new(8000, 8001)]);
        let b = offer("B", 2.0, 64.0, vec![PortRange::new(8000, 8001)]);

        assert_eq!(
            FcfsScheduler.schedule(&pod(1.0, 32.0, 1), &[a.clone(), b.clone()]),
            Ok(OfferId::from("A"))
        );
        assert_eq!(
            FcfsScheduler.schedule(&pod(1.0, 32.0, 1), &[b, a]),
            Ok(OfferId::from("B"))
        );
    }

    #[test]
    fn ports_are_counted_across_ranges() {
        let split = offer(
            "split",
            1.0,
            32.0,
            vec![PortRange::new(8000, 8000), PortRange::new(9000, 9001)],
        );

        assert!(FcfsScheduler::fits(&pod(1.0, 32.0, 3), &split));
        assert!(!FcfsScheduler::fits(&pod(1.0, 32.0, 4), &split));
    }

    #[test]
    fn exact_fit_is_accepted() {
        assert!(FcfsScheduler::fits(
            &pod(1.0, 32.0, 0),
            &offer("exact", 1.0, 32.0, vec![])
        ));
    }

    #[test]
    fn nothing_fits() {
        let small = offer("small", 0.1, 8.0, vec![]);

        assert_eq!(
            FcfsScheduler.schedule(&pod(1.0, 32.0, 1), &[small]),
            Err(ScheduleError::NoSuitableOffer {
                pod: PodKey::new("default", "pod1")
            })
        );
        assert!(FcfsScheduler.schedule(&pod(1.0, 32.0, 1), &[]).is_err());
    }

    #[test]
    fn same_input_same_answer() {
        let offers = vec![
            offer("x", 0.5, 64.0, vec![]),
            offer("y", 1.0, 64.0, vec![PortRange::new(1, 10)]),
            offer("z", 4.0, 64.0, vec![PortRange::new(1, 10)]),
        ];
        let first = FcfsScheduler.schedule(&pod(1.0, 32.0, 2), &offers);
        for _ in 0..10 {
            assert_eq!(FcfsScheduler.schedule(&pod(1.0, 32.0, 2), &offers), first);
        }
    }
}
