use std::{fmt, path::PathBuf, sync::Arc, time::SystemTime};

use analyzer_models::errors::SendableError;
use log::{LevelFilter, info};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `log:` section of the process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: LevelFilter,
    #[serde(default)]
    pub format: LogFormat,
    /// Extra output file, appended to; stdout is always written.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

fn default_level() -> LevelFilter {
    LevelFilter::Info
}

/// Logging capability handed to each component at construction.
///
/// A `Logger` is a named scope over the global `log` facade. Components log
/// through `log::info!(target: logger.target(), ..)` and derive child scopes
/// with [`Logger::named`], e.g. `analyzer.kafka.read.0`.
#[derive(Clone)]
pub struct Logger {
    target: Arc<str>,
}

impl Logger {
    pub fn new(name: &str) -> Self {
        Self {
            target: Arc::from(normalize(name)),
        }
    }

    pub fn named(&self, name: impl fmt::Display) -> Self {
        Self {
            target: Arc::from(format!("{}.{}", self.target, normalize(&name.to_string()))),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Flushes buffered output. Call once at process exit.
    pub fn shutdown(&self) {
        info!(target: self.target(), "logger shutting down");
        log::logger().flush();
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Logger").field(&self.target).finish()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "-")
}

/// Installs the global log dispatch and returns the root logger for `name`.
///
/// Fails if a global logger is already installed.
pub fn setup_logger(name: &str, config: &LogConfig) -> Result<Logger, SendableError> {
    let dispatch = fern::Dispatch::new().level(config.level);
    let dispatch = match config.format {
        LogFormat::Text => dispatch.format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        }),
        LogFormat::Json => dispatch.format(|out, message, record| {
            let line = serde_json::json!({
                "ts": humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
                "level": record.level().as_str(),
                "target": record.target(),
                "message": message.to_string(),
            });
            out.finish(format_args!("{}", line))
        }),
    };

    let mut dispatch = dispatch.chain(std::io::stdout());
    if let Some(path) = &config.file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;

    Ok(Logger::new(name))
}
