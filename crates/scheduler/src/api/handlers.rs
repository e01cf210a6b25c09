use std::sync::Arc;
use std::time::Duration;

use api_types::{
    DriverCall, Offer, PodSnapshot, RegisteredRequest, RescindRequest, TaskStatus, TaskView,
};
use poem::handler;
use poem::http::StatusCode;
use poem::web::{Data, Json, Query};
use serde::Deserialize;
use tracing::info;

use super::errors::ApiError;
use crate::domain::scheduler::{DriverEvent, SchedulerCore, SchedulerHandle};
use crate::infrastructure::driver::QueuedDriver;

/// Longest a call poll may wait for the first call.
const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

/// What the handlers share.
#[derive(Clone)]
pub struct ApiState {
    pub core: Arc<SchedulerCore>,
    pub driver: Arc<QueuedDriver>,
    pub events: SchedulerHandle,
}

impl ApiState {
    async fn forward(&self, event: DriverEvent) -> poem::Result<StatusCode> {
        self.events
            .send(event)
            .await
            .map_err(|_| ApiError::SchedulerStopped)?;
        Ok(StatusCode::ACCEPTED)
    }
}

#[handler]
pub async fn registered(
    state: Data<&ApiState>,
    Json(request): Json<RegisteredRequest>,
) -> poem::Result<StatusCode> {
    info!(framework_id = %request.framework_id, "resource manager registered us");
    state.driver.set_connected(true);
    state
        .forward(DriverEvent::Registered {
            framework_id: request.framework_id,
        })
        .await
}

#[handler]
pub async fn disconnected(state: Data<&ApiState>) -> poem::Result<StatusCode> {
    state.driver.set_connected(false);
    state.forward(DriverEvent::Disconnected).await
}

#[handler]
pub async fn offers(
    state: Data<&ApiState>,
    Json(offers): Json<Vec<Offer>>,
) -> poem::Result<StatusCode> {
    state.forward(DriverEvent::ResourceOffers(offers)).await
}

#[handler]
pub async fn rescind(
    state: Data<&ApiState>,
    Json(request): Json<RescindRequest>,
) -> poem::Result<StatusCode> {
    state
        .forward(DriverEvent::OfferRescinded(request.offer_id))
        .await
}

#[handler]
pub async fn status(
    state: Data<&ApiState>,
    Json(status): Json<TaskStatus>,
) -> poem::Result<StatusCode> {
    state.forward(DriverEvent::StatusUpdate(status)).await
}

#[derive(Debug, Deserialize)]
pub struct CallsQuery {
    /// Milliseconds to wait for a call when none is buffered
    #[serde(default)]
    pub wait_ms: u64,
}

/// Hands buffered driver calls to the shim, oldest first.
#[handler]
pub async fn calls(
    state: Data<&ApiState>,
    Query(query): Query<CallsQuery>,
) -> Json<Vec<DriverCall>> {
    let wait = Duration::from_millis(query.wait_ms).min(MAX_POLL_WAIT);
    if wait.is_zero() {
        Json(state.driver.drain())
    } else {
        Json(state.driver.next_batch(wait).await)
    }
}

#[handler]
pub async fn tasks(state: Data<&ApiState>) -> Json<Vec<TaskView>> {
    Json(state.core.tasks().list().iter().map(|task| task.view()).collect())
}

#[handler]
pub async fn queue(state: Data<&ApiState>) -> Json<Vec<PodSnapshot>> {
    Json(state.core.queue().list())
}

#[handler]
pub async fn healthz() -> &'static str {
    "ok"
}
