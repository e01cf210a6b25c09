use core::error::Error;

/// Failures talking to the cluster that owns the pods.
#[derive(Debug, derive_more::Display)]
pub enum ClusterError {
    #[display("cannot load kubeconfig {path}")]
    Kubeconfig { path: String },
    #[display("no usable cluster configuration found")]
    NoConfig,
    #[display("cannot build cluster client")]
    Client,
    #[display("pod watch for scheduler {scheduler_name} failed")]
    Watch { scheduler_name: String },
}

impl Error for ClusterError {}
