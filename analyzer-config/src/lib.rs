//! Process configuration: locating the YAML file, layering environment
//! overrides on top, and decoding it into the per-process shapes.
//!
//! Keys are snake_case throughout. Environment overrides use the `ANALYZER_`
//! prefix and `__` between nesting levels, e.g.
//! `ANALYZER_QUEUE__READ_LOOP=4` or `ANALYZER_LOG__LEVEL=debug`.

pub mod cli;
mod errors;
pub mod loader;
pub mod server;
pub mod worker;

pub use cli::CliArgs;
pub use errors::ConfigError;
pub use loader::{find_config_file, load};
pub use server::{HttpReceiverConfig, ReceiverConfig, ServerConfig};
pub use worker::{WorkerConfig, WorkerSettings};

/// Configuration shape owned by one process type.
pub trait ProcessConfig: serde::de::DeserializeOwned {
    /// File searched for when no explicit path is given.
    const FILE_NAME: &'static str;

    /// Finds and loads the configuration for this process.
    fn discover(args: &CliArgs) -> Result<Self, ConfigError> {
        let path = find_config_file(args.config.as_deref(), Self::FILE_NAME)?;
        load(&path)
    }
}
