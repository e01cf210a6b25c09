use std::time::Duration;

use api_types::{ExecutorId, ExecutorInfo};

use crate::config::run::{ExecutorConfig, RunArgs};

/// Exponential delay between `initial` and `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay that follows `current`.
    pub fn next(&self, current: Option<Duration>) -> Duration {
        match current {
            None => self.initial,
            Some(current) => current.saturating_mul(2).clamp(self.initial, self.max),
        }
    }
}

/// Bounded retries for reconciliation store reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

/// Tunables of the scheduling engine, independent of how they were supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub offer_ttl: Duration,
    pub pod_backoff: Backoff,
    pub reconcile: RetryPolicy,
    pub housekeeping_interval: Duration,
    pub task_retention: Duration,
    pub default_container_cpus: f64,
    pub default_container_mem_mb: f64,
    pub executor: ExecutorInfo,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::from_secs(5),
            pod_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            reconcile: RetryPolicy {
                attempts: 5,
                backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(5)),
            },
            housekeeping_interval: Duration::from_secs(30),
            task_retention: Duration::from_secs(300),
            default_container_cpus: 0.25,
            default_container_mem_mb: 64.0,
            executor: executor_info(&ExecutorConfig::default()),
        }
    }
}

impl From<&RunArgs> for SchedulerConfig {
    fn from(args: &RunArgs) -> Self {
        let executor = args.executor_config.clone().unwrap_or_default();
        Self {
            offer_ttl: Duration::from_millis(args.offer_ttl_ms),
            pod_backoff: Backoff::new(
                Duration::from_millis(args.initial_pod_backoff_ms),
                Duration::from_millis(args.max_pod_backoff_ms),
            ),
            reconcile: RetryPolicy {
                attempts: args.reconcile_attempts.max(1),
                backoff: Backoff::new(
                    Duration::from_millis(args.reconcile_initial_backoff_ms),
                    Duration::from_millis(args.reconcile_max_backoff_ms),
                ),
            },
            housekeeping_interval: Duration::from_secs(args.housekeeping_interval_secs.max(1)),
            task_retention: Duration::from_secs(args.task_retention_secs),
            default_container_cpus: args.default_container_cpus,
            default_container_mem_mb: args.default_container_mem_mb,
            executor: executor_info(&executor),
        }
    }
}

fn executor_info(config: &ExecutorConfig) -> ExecutorInfo {
    ExecutorInfo {
        executor_id: ExecutorId(config.executor_id.clone()),
        command: config.command.clone(),
        data: config.data.clone(),
    }
}
