use api_types::{PodKey, PodSnapshot};
use error_stack::{Report, ResultExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use super::convert::{pod_snapshot, ContainerDefaults};
use crate::domain::traits::{PodStore, StoreError};

/// Reads pods straight from the API server.
#[derive(Clone)]
pub struct KubePodStore {
    client: Client,
    namespace: Option<String>,
    scheduler_name: String,
    defaults: ContainerDefaults,
}

impl KubePodStore {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        scheduler_name: String,
        defaults: ContainerDefaults,
    ) -> Self {
        Self {
            client,
            namespace,
            scheduler_name,
            defaults,
        }
    }
}

#[async_trait::async_trait]
impl PodStore for KubePodStore {
    #[tracing::instrument(skip(self), fields(pod = %key))]
    async fn get(&self, key: &PodKey) -> Result<Option<PodSnapshot>, Report<StoreError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let pod = api
            .get_opt(&key.name)
            .await
            .change_context(StoreError::ReadFailed { pod: key.clone() })?;
        Ok(pod.and_then(|pod| pod_snapshot(&pod, &self.defaults)))
    }

    async fn list(&self) -> Result<Vec<PodSnapshot>, Report<StoreError>> {
        let api: Api<Pod> = match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let params =
            ListParams::default().fields(&format!("spec.schedulerName={}", self.scheduler_name));
        let pods = api
            .list(&params)
            .await
            .change_context(StoreError::ListFailed)?;
        Ok(pods
            .items
            .iter()
            .filter_map(|pod| pod_snapshot(pod, &self.defaults))
            .collect())
    }
}
