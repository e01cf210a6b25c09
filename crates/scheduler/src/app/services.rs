use std::sync::Arc;

use kube::Client;

use crate::domain::scheduler::SchedulerCore;
use crate::infrastructure::driver::QueuedDriver;
use crate::infrastructure::k8s::ContainerDefaults;

/// Application dependencies
pub struct ApplicationServices {
    pub core: Arc<SchedulerCore>,
    pub driver: Arc<QueuedDriver>,
    pub kube_client: Client,
    pub container_defaults: ContainerDefaults,
}
