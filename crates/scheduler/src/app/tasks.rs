use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiServer, ApiState};
use crate::app::core::Application;
use crate::domain::scheduler::{DriverEvent, PodUpdate, SchedulerCore, SchedulerHandle};
use crate::infrastructure::k8s::PodWatcher;

const EVENT_BUFFER: usize = 256;

/// Starts and supervises the background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let core = app.services().core.clone();
        let (handle, events) = SchedulerHandle::channel(EVENT_BUFFER);

        let scheduling_task = self.spawn_scheduling_task(core.clone());
        self.tasks.push(scheduling_task);

        let event_task = self.spawn_event_task(core.clone(), events);
        self.tasks.push(event_task);

        let decline_task = {
            let core = core.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting offer decline task");
                core.run_declines(token).await;
                tracing::info!("Offer decline task completed");
            })
        };
        self.tasks.push(decline_task);

        let housekeeping_task = {
            let core = core.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting housekeeping task");
                core.run_housekeeping(token).await;
                tracing::info!("Housekeeping task completed");
            })
        };
        self.tasks.push(housekeeping_task);

        let (pod_update_sender, pod_update_receiver) = mpsc::channel::<PodUpdate>(EVENT_BUFFER);
        let watcher_task = self.spawn_pod_watcher_task(app, pod_update_sender);
        self.tasks.push(watcher_task);

        let processor_task = self.spawn_pod_processor_task(pod_update_receiver, core.clone());
        self.tasks.push(processor_task);

        let api_server_task = self.spawn_api_server_task(app, handle);
        self.tasks.push(api_server_task);

        Ok(())
    }

    /// Waits for a shutdown signal or the first task to exit, then cancels the rest.
    pub async fn wait_for_completion(&mut self, timeout: Duration) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        let mut result = Ok(());
        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
            }
            finished = futures::future::select_all(&mut self.tasks) => {
                let (finished, _index, _remaining) = finished;
                match finished {
                    Ok(()) => tracing::warn!("Task completed unexpectedly"),
                    Err(e) => {
                        tracing::error!("Task completed with error: {e}");
                        result = Err(e.into());
                    }
                }
            }
        }

        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(timeout).await;
        result
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        let tasks = std::mem::take(&mut self.tasks);
        let pending = tasks.into_iter().filter(|task| !task.is_finished());
        if tokio::time::timeout(timeout, futures::future::join_all(pending))
            .await
            .is_err()
        {
            tracing::warn!("Task shutdown timed out after {timeout:?}");
        }
    }

    fn spawn_scheduling_task(&self, core: Arc<SchedulerCore>) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting scheduling task");
            core.run(token).await;
            tracing::info!("Scheduling task completed");
        })
    }

    fn spawn_event_task(
        &self,
        core: Arc<SchedulerCore>,
        events: mpsc::Receiver<DriverEvent>,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting driver event task");
            core.run_events(events, token).await;
            tracing::info!("Driver event task completed");
        })
    }

    fn spawn_pod_watcher_task(
        &self,
        app: &Application,
        pod_update_sender: mpsc::Sender<PodUpdate>,
    ) -> JoinHandle<()> {
        let args = app.run_args();
        let watcher = PodWatcher::new(
            app.services().kube_client.clone(),
            args.namespace.clone(),
            args.scheduler_name.clone(),
            app.services().container_defaults,
        );
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting Kubernetes pod watcher task");
            if let Err(e) = watcher.run(pod_update_sender, token).await {
                tracing::error!("Kubernetes pod watcher failed: {e:?}");
            } else {
                tracing::info!("Kubernetes pod watcher completed");
            }
        })
    }

    fn spawn_pod_processor_task(
        &self,
        mut pod_update_receiver: mpsc::Receiver<PodUpdate>,
        core: Arc<SchedulerCore>,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting Kubernetes update processor task");
            loop {
                tokio::select! {
                    update = pod_update_receiver.recv() => {
                        match update {
                            Some(update) => core.handle_pod_update(update).await,
                            None => {
                                tracing::info!("Kubernetes update receiver closed");
                                break;
                            }
                        }
                    }
                    _ = token.cancelled() => {
                        tracing::info!("Kubernetes update processor task cancelled");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_api_server_task(&self, app: &Application, events: SchedulerHandle) -> JoinHandle<()> {
        let state = ApiState {
            core: app.services().core.clone(),
            driver: app.services().driver.clone(),
            events,
        };
        let listen_addr = app.run_args().api_listen_addr.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let api_server = ApiServer::new(state, listen_addr);
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {e:?}");
            } else {
                tracing::info!("API server completed");
            }
        })
    }
}
