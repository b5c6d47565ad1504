use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the YAML configuration file. When omitted the process file
    /// name is searched in the working directory, ./config and next to the
    /// executable.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}
