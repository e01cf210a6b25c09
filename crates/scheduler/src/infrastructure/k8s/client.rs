use std::path::Path;

use error_stack::{Report, ResultExt};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use super::types::ClusterError;

/// Connects to the cluster holding the pods this scheduler places.
///
/// An explicit kubeconfig wins; otherwise the in-cluster service account or
/// `~/.kube/config` is used. When the scheduler is limited to one namespace, that
/// namespace becomes the client's default.
pub async fn connect(
    kubeconfig: Option<&Path>,
    namespace: Option<&str>,
) -> Result<Client, Report<ClusterError>> {
    let mut config = match kubeconfig {
        Some(path) => {
            let not_loaded = || ClusterError::Kubeconfig {
                path: path.display().to_string(),
            };
            let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(not_loaded)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context_lazy(not_loaded)?
        }
        None => Config::infer().await.change_context(ClusterError::NoConfig)?,
    };
    if let Some(namespace) = namespace {
        config.default_namespace = namespace.to_string();
    }

    tracing::info!(cluster_url = %config.cluster_url, namespace = %config.default_namespace, "connecting to cluster");
    Client::try_from(config).change_context(ClusterError::Client)
}
