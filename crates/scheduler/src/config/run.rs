use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Deserializer};

/// Executor launched on agents to run scheduled pods.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_id")]
    pub executor_id: String,
    #[serde(default)]
    pub command: String,
    /// Opaque payload handed to the executor, sent as UTF-8 bytes
    #[serde(default, deserialize_with = "deserialize_data")]
    pub data: Vec<u8>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            executor_id: default_executor_id(),
            command: String::new(),
            data: Vec::new(),
        }
    }
}

fn default_executor_id() -> String {
    "offer-scheduler-executor".to_string()
}

/// Accepts either a string or any JSON value (which is re-serialized).
fn deserialize_data<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s.into_bytes(),
        serde_json::Value::Null => Vec::new(),
        other => other.to_string().into_bytes(),
    })
}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "SCHEDULER_NAMESPACE",
        help = "Kubernetes namespace to schedule pods from (empty for all namespaces)"
    )]
    pub namespace: Option<String>,

    #[arg(
        long,
        env = "SCHEDULER_NAME",
        default_value = "offer-scheduler",
        help = "Only pods whose spec.schedulerName matches are scheduled"
    )]
    pub scheduler_name: String,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:10251",
        help = "HTTP listen address for resource-manager callbacks and introspection"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "SCHEDULER_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = "5000",
        env = "OFFER_TTL_MS",
        help = "How long an unused offer stays usable before it is declined"
    )]
    pub offer_ttl_ms: u64,

    #[arg(
        long,
        default_value = "1000",
        help = "First delay before an unschedulable pod is retried"
    )]
    pub initial_pod_backoff_ms: u64,

    #[arg(
        long,
        default_value = "60000",
        help = "Upper bound for the retry delay of an unschedulable pod"
    )]
    pub max_pod_backoff_ms: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Store reads attempted by one reconciliation before giving up"
    )]
    pub reconcile_attempts: u32,

    #[arg(long, default_value = "200", help = "First delay between reconciliation reads")]
    pub reconcile_initial_backoff_ms: u64,

    #[arg(long, default_value = "5000", help = "Upper bound for the delay between reconciliation reads")]
    pub reconcile_max_backoff_ms: u64,

    #[arg(long, default_value = "30", help = "Interval of the offer sweep and task garbage collection")]
    pub housekeeping_interval_secs: u64,

    #[arg(
        long,
        default_value = "300",
        help = "How long finished, lost, failed or deleted tasks are kept for inspection"
    )]
    pub task_retention_secs: u64,

    #[arg(long, default_value = "0.25", help = "CPU request assumed for containers that set none")]
    pub default_container_cpus: f64,

    #[arg(long, default_value = "64", help = "Memory request in MB assumed for containers that set none")]
    pub default_container_mem_mb: f64,

    #[arg(
        long,
        help = "Executor configuration as JSON string (contains executorId, command, data)",
        env = "SCHEDULER_EXECUTOR_CONFIG",
        value_parser = parse_executor_config
    )]
    pub executor_config: Option<ExecutorConfig>,
}

/// Parse JSON string into ExecutorConfig
fn parse_executor_config(s: &str) -> Result<ExecutorConfig, String> {
    serde_json::from_str(s).map_err(|e| format!("Failed to parse executor config JSON: {e}"))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn executor_config_keeps_string_data() {
        let config = parse_executor_config(
            r#"{"executorId":"exec-1","command":"/bin/executor","data":"abc"}"#,
        )
        .expect("should parse executor config");

        assert_eq!(config.executor_id, "exec-1");
        assert_eq!(config.command, "/bin/executor");
        assert_eq!(config.data, b"abc".to_vec());
    }

    #[test]
    fn executor_config_serializes_structured_data() {
        let config = parse_executor_config(r#"{"data":{"k":1}}"#).expect("should parse");

        assert_eq!(config.executor_id, "offer-scheduler-executor");
        assert_eq!(config.data, br#"{"k":1}"#.to_vec());
    }

    #[test]
    fn executor_config_rejects_garbage() {
        let err = parse_executor_config("{not json").unwrap_err();
        assert!(err.starts_with("Failed to parse executor config JSON"));
    }

    #[test]
    fn run_args_defaults() {
        let args = RunArgs::try_parse_from(["run"]).expect("defaults should parse");

        assert_eq!(args.scheduler_name, "offer-scheduler");
        assert_eq!(args.offer_ttl_ms, 5000);
        assert_eq!(args.executor_config, None);
    }
}
