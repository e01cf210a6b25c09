use std::collections::HashSet;
use std::time::Duration;

use api_types::{PodKey, PodSnapshot};
use error_stack::{Report, ResultExt};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::convert::{pod_snapshot, ContainerDefaults};
use super::types::ClusterError;
use crate::domain::scheduler::PodUpdate;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Watches pods assigned to this scheduler by `spec.schedulerName` and turns
/// watch events into [`PodUpdate`]s.
pub struct PodWatcher {
    client: Client,
    namespace: Option<String>,
    scheduler_name: String,
    defaults: ContainerDefaults,
    known: HashSet<PodKey>,
}

impl PodWatcher {
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
            known: HashSet::new(),
        }
    }

    /// Runs until cancelled, restarting the watch after stream failures.
    #[tracing::instrument(skip_all, fields(namespace = ?self.namespace, scheduler_name = %self.scheduler_name))]
    pub async fn run(
        mut self,
        updates: mpsc::Sender<PodUpdate>,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<ClusterError>> {
        info!("Starting pod watcher");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod watcher shutdown requested");
                    break;
                }
                result = self.watch_pods(&updates) => {
                    match result {
                        Ok(()) => warn!("Pod watch stream ended unexpectedly, restarting..."),
                        Err(e) => {
                            error!("Pod watch failed: {e:?}");
                            tokio::select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn watch_pods(
        &mut self,
        updates: &mpsc::Sender<PodUpdate>,
    ) -> Result<(), Report<ClusterError>> {
        let api: Api<Pod> = match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let config = watcher::Config::default()
            .fields(&format!("spec.schedulerName={}", self.scheduler_name));
        let mut stream = watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            let event = event.change_context_lazy(|| ClusterError::Watch {
                scheduler_name: self.scheduler_name.clone(),
            })?;
            for update in self.translate(event) {
                if updates.send(update).await.is_err() {
                    warn!("Pod update receiver dropped, stopping watch");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Maps a watch event onto updates, telling adds from modifications by the
    /// pods seen so far. A relist reports pods that vanished meanwhile as deleted.
    fn translate(&mut self, event: Event<Pod>) -> Vec<PodUpdate> {
        match event {
            Event::Applied(pod) => self.applied(&pod).into_iter().collect(),
            Event::Deleted(pod) => pod_snapshot(&pod, &self.defaults)
                .map(|snapshot| {
                    self.known.remove(&snapshot.key());
                    PodUpdate::Deleted(snapshot)
                })
                .into_iter()
                .collect(),
            Event::Restarted(pods) => {
                let previous = std::mem::take(&mut self.known);
                let mut updates: Vec<PodUpdate> =
                    pods.iter().filter_map(|pod| self.applied(pod)).collect();
                updates.extend(
                    previous
                        .into_iter()
                        .filter(|key| !self.known.contains(key))
                        .map(|key| {
                            PodUpdate::Deleted(PodSnapshot {
                                namespace: key.namespace,
                                name: key.name,
                                uid: String::new(),
                                resources: Default::default(),
                                node_name: None,
                                deleting: true,
                            })
                        }),
                );
                updates
            }
        }
    }

    fn applied(&mut self, pod: &Pod) -> Option<PodUpdate> {
        let snapshot = pod_snapshot(pod, &self.defaults)?;
        if self.known.insert(snapshot.key()) {
            Some(PodUpdate::Added(snapshot))
        } else {
            Some(PodUpdate::Modified(snapshot))
        }
    }
}
