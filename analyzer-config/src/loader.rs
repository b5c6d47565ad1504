use std::{
    env,
    path::{Path, PathBuf},
};

use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;

use crate::ConfigError;

/// Overrides the process file name (or points at a file directly).
pub const CONFIG_FILE_ENV: &str = "ANALYZER_CONFIG_FILE";
pub const ENV_PREFIX: &str = "ANALYZER";

/// Resolves the configuration file to load.
///
/// An explicit path wins and must exist. Otherwise `default_name`, or the
/// value of `ANALYZER_CONFIG_FILE`, is looked up in the working directory,
/// `./config` and the executable's directory, in that order.
pub fn find_config_file(explicit: Option<&Path>, default_name: &str) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::NotFound {
            name: path.display().to_string(),
            searched: vec![path.to_path_buf()],
        });
    }

    let name = env::var(CONFIG_FILE_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_name.to_string());
    let searched = candidates(Path::new(&name));
    match searched.iter().find(|path| path.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(ConfigError::NotFound { name, searched }),
    }
}

fn candidates(name: &Path) -> Vec<PathBuf> {
    if name.is_absolute() {
        return vec![name.to_path_buf()];
    }
    let mut dirs = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        dirs.push(cwd.clone());
        dirs.push(cwd.join("config"));
    }
    if let Some(exe_dir) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        if !dirs.contains(&exe_dir) {
            dirs.push(exe_dir);
        }
    }
    dirs.into_iter().map(|dir| dir.join(name)).collect()
}

/// Reads the YAML file at `path`, applies `ANALYZER_*` environment
/// overrides and decodes the result.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let load_error = |source| ConfigError::Load {
        path: path.to_path_buf(),
        source,
    };
    Config::builder()
        .add_source(File::from(path).format(FileFormat::Yaml).required(true))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(load_error)?
        .try_deserialize()
        .map_err(load_error)
}
