use std::env;

use analyzer_models::errors::SendableError;
use log::info;

use crate::logger::{self, LogConfig, Logger};

/// Process bootstrap shared by the binaries: logging, panic hook, banner.
///
/// Returns the root logger; call [`Logger::shutdown`] before exiting.
pub fn startup(name: &str, config: &LogConfig) -> Result<Logger, SendableError> {
    if env::var_os("RUST_BACKTRACE").is_none() {
        // SAFETY: runs at process start, before any task reads the environment.
        unsafe {
            env::set_var("RUST_BACKTRACE", "1");
        }
    }
    let root = logger::setup_logger(name, config)?;
    log_panics::init();

    info!(target: root.target(), "--- {} ---", name);
    print_env(&root)?;

    Ok(root)
}

fn print_env(root: &Logger) -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!(target: root.target(), "The current directory is {}", path.display());
    Ok(())
}
