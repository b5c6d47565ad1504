use analyzer_database::DatabaseConfig;
use analyzer_queue::QueueConfig;
use analyzer_utilities::LogConfig;
use serde::Deserialize;

use crate::ProcessConfig;

/// `worker.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub worker: WorkerSettings,
    pub queue: QueueConfig,
    pub db: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl ProcessConfig for WorkerConfig {
    const FILE_NAME: &'static str = "worker.yaml";
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Root logger scope for this worker instance.
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

fn default_name() -> String {
    "worker".to_string()
}
