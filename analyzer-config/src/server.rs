use analyzer_queue::QueueConfig;
use analyzer_utilities::LogConfig;
use serde::Deserialize;

use crate::ProcessConfig;

/// `server.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub receiver: ReceiverConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl ProcessConfig for ServerConfig {
    const FILE_NAME: &'static str = "server.yaml";
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default)]
    pub http: HttpReceiverConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpReceiverConfig {
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_shutdown_timeout_sec")]
    pub shutdown_timeout_sec: u64,
}

impl Default for HttpReceiverConfig {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            shutdown_timeout_sec: default_shutdown_timeout_sec(),
        }
    }
}

impl HttpReceiverConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn default_enable() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    "/events".to_string()
}

fn default_shutdown_timeout_sec() -> u64 {
    10
}
