use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file '{name}' not found, searched: {}", display_paths(.searched))]
    NotFound { name: String, searched: Vec<PathBuf> },
    #[error("load configuration from {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
