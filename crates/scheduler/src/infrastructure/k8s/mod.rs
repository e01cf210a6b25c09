//! Kubernetes side of the scheduler: connection, pod conversion, store reads and the pod watch.

pub mod client;
pub mod convert;
pub mod pod_store;
pub mod pod_watcher;
pub mod types;

pub use client::connect;
pub use convert::ContainerDefaults;
pub use pod_store::KubePodStore;
pub use pod_watcher::PodWatcher;
pub use types::ClusterError;
