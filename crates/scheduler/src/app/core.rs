use std::time::Duration;

use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::RunArgs;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Application {
    services: ApplicationServices,
    run_args: RunArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, run_args: RunArgs) -> Self {
        Self { services, run_args }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn run_args(&self) -> &RunArgs {
        &self.run_args
    }

    /// Starts every task and blocks until a shutdown signal or a task exits.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {e}");
            return Err(e);
        }
        tracing::info!("All application tasks started successfully");

        let result = tasks.wait_for_completion(SHUTDOWN_TIMEOUT).await;
        if let Err(e) = &result {
            tracing::error!("Error during task execution: {e}");
        }
        result
    }

    /// Closes the queue and waits for background retries and reconciliations.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.services.core.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("Scheduler shutdown timed out after {SHUTDOWN_TIMEOUT:?}");
        }
        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
