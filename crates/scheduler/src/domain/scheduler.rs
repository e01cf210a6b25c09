//! The scheduling engine: offers in, launches out

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use api_types::{Offer, OfferId, PodKey, PodSnapshot, TaskId, TaskStatus};
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::domain::deleter::{DeleteError, DeleteOutcome, Deleter};
use crate::domain::offers::{ClaimedOffer, OfferRegistry};
use crate::domain::podtask::{Task, TaskRegistry, TaskState};
use crate::domain::queue::{AddMode, PendingQueue, QueueError};
use crate::domain::reconcile::{ReconcileCause, Reconciler, StatusHandler, StatusOutcome};
use crate::domain::schedule::{FcfsScheduler, ScheduleFunc};
use crate::domain::traits::{EventReason, EventRecorder, PodStore, SchedulerDriver};

/// Callbacks from the resource manager.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Registered { framework_id: String },
    Disconnected,
    ResourceOffers(Vec<Offer>),
    OfferRescinded(OfferId),
    StatusUpdate(TaskStatus),
}

/// Changes to pods observed on the store.
#[derive(Debug, Clone)]
pub enum PodUpdate {
    Added(PodSnapshot),
    Modified(PodSnapshot),
    Deleted(PodSnapshot),
}

/// Cloneable entry point that feeds [`DriverEvent`]s to a running core.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    events: mpsc::Sender<DriverEvent>,
}

impl SchedulerHandle {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<DriverEvent>) {
        let (events, receiver) = mpsc::channel(buffer);
        (Self { events }, receiver)
    }

    /// Queues an event; fails only when the core has stopped.
    pub async fn send(&self, event: DriverEvent) -> Result<(), DriverEvent> {
        self.events.send(event).await.map_err(|err| err.0)
    }
}

/// What happened to a popped pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Launched(TaskId),
    /// No offer fit or the launch failed; the pod will be retried
    Requeued,
    /// The pod no longer needs scheduling
    Skipped,
}

pub struct SchedulerCore {
    config: SchedulerConfig,
    offers: Arc<OfferRegistry>,
    tasks: Arc<TaskRegistry>,
    queue: Arc<PendingQueue>,
    schedule: Arc<dyn ScheduleFunc>,
    driver: Arc<dyn SchedulerDriver>,
    recorder: Arc<dyn EventRecorder>,
    deleter: Deleter,
    status: StatusHandler,
    offer_arrived: Arc<Notify>,
    backoffs: DashMap<PodKey, Duration>,
    declines: Mutex<Option<mpsc::UnboundedReceiver<OfferId>>>,
    framework_id: Mutex<Option<String>>,
    retries: TaskTracker,
    token: CancellationToken,
}

impl SchedulerCore {
    pub fn new(
        config: SchedulerConfig,
        driver: Arc<dyn SchedulerDriver>,
        store: Arc<dyn PodStore>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let (offers, declines) = OfferRegistry::new(config.offer_ttl);
        let tasks = Arc::new(TaskRegistry::new());
        let queue = Arc::new(PendingQueue::new());
        let reconciler = Arc::new(Reconciler::new(
            tasks.clone(),
            queue.clone(),
            store,
            config.reconcile,
        ));

        Self {
            deleter: Deleter::new(tasks.clone(), queue.clone(), driver.clone()),
            status: StatusHandler::new(tasks.clone(), driver.clone(), reconciler),
            offers: Arc::new(offers),
            tasks,
            queue,
            schedule: Arc::new(FcfsScheduler),
            driver,
            recorder,
            offer_arrived: Arc::new(Notify::new()),
            backoffs: DashMap::new(),
            declines: Mutex::new(Some(declines)),
            framework_id: Mutex::new(None),
            retries: TaskTracker::new(),
            token: CancellationToken::new(),
            config,
        }
    }

    /// Swaps the matching strategy.
    pub fn with_schedule_func(mut self, schedule: Arc<dyn ScheduleFunc>) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn offers(&self) -> &Arc<OfferRegistry> {
        &self.offers
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        self.status.reconciler()
    }

    pub fn framework_id(&self) -> Option<String> {
        self.framework_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The resource manager accepted us. Asks it for the status of every launched
    /// task and re-checks tasks whose launch outcome is unknown.
    pub async fn registered(&self, framework_id: String) {
        tracing::info!(%framework_id, "registered with resource manager");
        *self
            .framework_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(framework_id);

        let tasks = self.tasks.list();
        let statuses: Vec<TaskStatus> = tasks
            .iter()
            .filter(|task| task.state.is_launched())
            .map(Task::known_status)
            .collect();
        let count = statuses.len();
        if let Err(report) = self.driver.reconcile_tasks(statuses).await {
            tracing::error!("failed to request task reconciliation: {report:?}");
        } else {
            tracing::info!(tasks = count, "requested task reconciliation");
        }

        for task in tasks.iter().filter(|task| task.state == TaskState::Pending) {
            self.reconciler().dispatch(task, ReconcileCause::ColdStart);
        }
    }

    pub fn disconnected(&self) {
        tracing::warn!("disconnected from resource manager");
        *self
            .framework_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn resource_offers(&self, offers: Vec<Offer>) {
        tracing::debug!(count = offers.len(), "received offers");
        for offer in offers {
            self.offers.add(offer);
        }
        self.offer_arrived.notify_waiters();
    }

    pub fn offer_rescinded(&self, offer_id: &OfferId) {
        self.offers.rescind(offer_id);
    }

    pub async fn status_update(&self, status: TaskStatus) -> StatusOutcome {
        self.status.handle(status).await
    }

    pub async fn delete_pod(&self, pod: &PodKey) -> Result<DeleteOutcome, DeleteError> {
        self.backoffs.remove(pod);
        self.deleter.delete_one(pod).await
    }

    pub async fn handle_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::Registered { framework_id } => self.registered(framework_id).await,
            DriverEvent::Disconnected => self.disconnected(),
            DriverEvent::ResourceOffers(offers) => self.resource_offers(offers),
            DriverEvent::OfferRescinded(offer_id) => self.offer_rescinded(&offer_id),
            DriverEvent::StatusUpdate(status) => {
                self.status_update(status).await;
            }
        }
    }

    pub async fn handle_pod_update(&self, update: PodUpdate) {
        match update {
            PodUpdate::Deleted(pod) => self.forget_pod(&pod.key()).await,
            PodUpdate::Added(pod) | PodUpdate::Modified(pod) if pod.deleting => {
                self.forget_pod(&pod.key()).await
            }
            PodUpdate::Added(pod) | PodUpdate::Modified(pod) if pod.is_bound() => {
                self.queue.delete(&pod.key());
                self.drop_waiting_task(&pod.key()).await;
                if let Some(applied) = self.reconciler().converge(&pod).await {
                    tracing::info!(pod = %pod.key(), ?applied, "bound pod settled reconciliation");
                }
            }
            PodUpdate::Added(pod) => self.enqueue(pod, AddMode::IfAbsent),
            PodUpdate::Modified(pod) => self.enqueue(pod, AddMode::ReplaceExisting),
        }
    }

    fn enqueue(&self, pod: PodSnapshot, mode: AddMode) {
        let key = pod.key();
        match self.tasks.get(&key) {
            None => {
                self.queue.add(pod, mode);
            }
            // Waiting for a retry: only refresh a queued snapshot.
            Some(task) if task.state == TaskState::Created => {
                if mode == AddMode::ReplaceExisting && self.queue.get(&key).is_some() {
                    self.queue.add(pod, mode);
                }
            }
            Some(task) => {
                tracing::trace!(pod = %key, state = %task.state, "pod already has a task");
            }
        }
    }

    /// A pod bound by someone else no longer needs the task waiting for an offer.
    async fn drop_waiting_task(&self, pod: &PodKey) {
        let _guard = self.tasks.lock(pod).await;
        let Some(task) = self.tasks.get(pod).filter(|task| task.state == TaskState::Created) else {
            return;
        };
        match self.tasks.delete(&task.id) {
            Ok(_) => {
                self.backoffs.remove(pod);
                tracing::info!(pod = %pod, "pod bound elsewhere, dropped waiting task");
            }
            Err(err) => tracing::warn!(pod = %pod, "failed to drop waiting task: {err}"),
        }
    }

    async fn forget_pod(&self, pod: &PodKey) {
        match self.delete_pod(pod).await {
            Ok(outcome) => tracing::info!(pod = %pod, ?outcome, "pod deleted"),
            Err(DeleteError::NoSuchPod { .. }) => {
                tracing::debug!(pod = %pod, "deleted pod was never scheduled");
            }
            Err(err) => tracing::warn!(pod = %pod, "failed to delete pod: {err}"),
        }
    }

    /// Drives one pod through match, claim and launch.
    #[tracing::instrument(skip_all, fields(pod = %pod.key()))]
    pub async fn schedule_one(&self, pod: PodSnapshot) -> ScheduleOutcome {
        let key = pod.key();
        let _guard = self.tasks.lock(&key).await;

        let task = match self.tasks.get(&key) {
            Some(task) if task.state == TaskState::Created => task,
            Some(task) => {
                tracing::debug!(state = %task.state, "pod already has a task");
                return ScheduleOutcome::Skipped;
            }
            None => match self.tasks.register(&pod, self.config.executor.clone()) {
                Ok(task) => task,
                Err(err) => {
                    tracing::warn!("failed to register task: {err}");
                    return ScheduleOutcome::Skipped;
                }
            },
        };

        loop {
            let offers = self.offers.snapshot();
            let offer_id = match self.schedule.schedule(&pod, &offers) {
                Ok(offer_id) => offer_id,
                Err(err) => {
                    tracing::debug!(offers = offers.len(), "{err}");
                    self.recorder
                        .event(&key, EventReason::FailedScheduling, err.to_string());
                    self.requeue_later(pod);
                    return ScheduleOutcome::Requeued;
                }
            };

            match self.offers.claim(&offer_id) {
                Ok(claimed) => return self.launch(task, pod, claimed).await,
                Err(err) => tracing::debug!("{err}, matching again"),
            }
        }
    }

    async fn launch(&self, mut task: Task, pod: PodSnapshot, claimed: ClaimedOffer) -> ScheduleOutcome {
        let key = pod.key();
        let Some(ports) = claimed.offer.take_ports(pod.resources.ports) else {
            tracing::warn!(offer_id = %claimed.offer.id, "matched offer lacks ports");
            self.offers.release(claimed);
            self.requeue_later(pod);
            return ScheduleOutcome::Requeued;
        };

        task.assign(&claimed.offer, ports);
        let pending = match self.tasks.update(&task) {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!("failed to assign offer: {err}");
                self.offers.release(claimed);
                return ScheduleOutcome::Skipped;
            }
        };

        let offer = claimed.offer;
        if let Err(report) = self
            .driver
            .launch_tasks(&offer.id, vec![pending.descriptor()])
            .await
        {
            tracing::error!(offer_id = %offer.id, "launch failed: {report:?}");
            if let Err(report) = self.driver.decline_offer(&offer.id).await {
                tracing::warn!(offer_id = %offer.id, "failed to decline offer: {report:?}");
            }
            self.reset_task(&pending, &pod);
            self.requeue_later(pod);
            return ScheduleOutcome::Requeued;
        }

        if let Err(err) = self.tasks.update(&pending.with_state(TaskState::Launched)) {
            tracing::warn!("launched task changed underneath: {err}");
        }
        self.backoffs.remove(&key);
        tracing::info!(task_id = %pending.id, hostname = %offer.hostname, "task launched");
        self.recorder.event(
            &key,
            EventReason::Scheduled,
            format!("Successfully assigned {key} to {}", offer.hostname),
        );
        ScheduleOutcome::Launched(pending.id)
    }

    /// Replaces a task whose launch failed with a fresh `Created` one.
    fn reset_task(&self, task: &Task, pod: &PodSnapshot) {
        let reset = self
            .tasks
            .update(&task.with_state(TaskState::Failed))
            .and_then(|failed| self.tasks.delete(&failed.id))
            .and_then(|_| self.tasks.register(pod, self.config.executor.clone()));
        if let Err(err) = reset {
            tracing::warn!(pod = %task.pod, "failed to reset task after launch failure: {err}");
        }
    }

    /// Puts the pod back once offers arrive or its backoff expires, whichever
    /// comes first. Skipped if the pod was deleted meanwhile.
    fn requeue_later(&self, pod: PodSnapshot) {
        let key = pod.key();
        let delay = {
            let current = self.backoffs.get(&key).map(|delay| *delay);
            let next = self.config.pod_backoff.next(current);
            self.backoffs.insert(key.clone(), next);
            next
        };
        tracing::debug!(pod = %key, "retrying in at most {delay:?}");

        let tasks = self.tasks.clone();
        let queue = self.queue.clone();
        let offer_arrived = self.offer_arrived.clone();
        let token = self.token.clone();
        self.retries.spawn(async move {
            tokio::select! {
                _ = offer_arrived.notified() => {}
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }

            let _guard = tasks.lock(&key).await;
            match tasks.get(&key) {
                Some(task) if task.state == TaskState::Created => {
                    queue.add(pod, AddMode::IfAbsent);
                }
                _ => tracing::debug!(pod = %key, "pod no longer waiting for an offer"),
            }
        });
    }

    /// Scheduling loop. Ends on cancellation or when the queue closes.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            let pod = tokio::select! {
                _ = token.cancelled() => break,
                pod = self.queue.pop() => match pod {
                    Ok(pod) => pod,
                    Err(QueueError::Closed) => break,
                },
            };
            self.schedule_one(pod).await;
        }
        tracing::info!("scheduling loop stopped");
    }

    /// Applies resource-manager callbacks in arrival order.
    pub async fn run_events(&self, mut events: mpsc::Receiver<DriverEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::info!("driver event channel closed");
                        break;
                    }
                },
            }
        }
    }

    /// Declines offers that expired unused.
    pub async fn run_declines(&self, token: CancellationToken) {
        let receiver = self
            .declines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut declines) = receiver else {
            tracing::warn!("offer decline loop already running");
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                offer_id = declines.recv() => match offer_id {
                    Some(offer_id) => {
                        if let Err(report) = self.driver.decline_offer(&offer_id).await {
                            tracing::warn!(%offer_id, "failed to decline offer: {report:?}");
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Sweeps expired offers, forgets old finished tasks and restarts bind-failure
    /// checks that gave up.
    pub fn housekeeping(&self) {
        let evicted = self.offers.evict_expired();
        let collected = self.tasks.collect_garbage(self.config.task_retention);
        let rechecked = self.reconciler().retry_stalled();
        tracing::debug!(evicted, collected, rechecked, "housekeeping done");
    }

    pub async fn run_housekeeping(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.housekeeping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.housekeeping(),
            }
        }
    }

    /// Stops accepting work and waits for background retries and reconciliations.
    pub async fn shutdown(&self) {
        self.queue.close();
        self.token.cancel();
        self.retries.close();
        self.retries.wait().await;
        self.reconciler().shutdown().await;
    }
}
