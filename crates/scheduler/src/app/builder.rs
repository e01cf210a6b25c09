use std::sync::Arc;

use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::Application;
use crate::config::{RunArgs, SchedulerConfig};
use crate::domain::scheduler::SchedulerCore;
use crate::domain::traits::TracingEventRecorder;
use crate::infrastructure::driver::QueuedDriver;
use crate::infrastructure::k8s::{self, ContainerDefaults, KubePodStore};

pub struct ApplicationBuilder {
    run_args: RunArgs,
}

impl ApplicationBuilder {
    pub fn new(run_args: RunArgs) -> Self {
        Self { run_args }
    }

    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let config = SchedulerConfig::from(&self.run_args);
        let container_defaults = ContainerDefaults {
            cpus: config.default_container_cpus,
            mem_mb: config.default_container_mem_mb,
        };

        let kube_client = k8s::connect(
            self.run_args.kubeconfig.as_deref(),
            self.run_args.namespace.as_deref(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;
        let store = Arc::new(KubePodStore::new(
            kube_client.clone(),
            self.run_args.namespace.clone(),
            self.run_args.scheduler_name.clone(),
            container_defaults,
        ));

        let driver = Arc::new(QueuedDriver::new());
        let core = Arc::new(SchedulerCore::new(
            config,
            driver.clone(),
            store,
            Arc::new(TracingEventRecorder),
        ));

        let services = ApplicationServices {
            core,
            driver,
            kube_client,
            container_defaults,
        };
        Ok(Application::new(services, self.run_args))
    }
}
