use std::sync::Arc;

use analyzer_config::{CliArgs, ProcessConfig, ServerConfig};
use analyzer_models::errors::{RuntimeError, SendableError};
use analyzer_server::run_http_receiver;
use analyzer_utilities::startup;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let args = CliArgs::parse();
    let config = ServerConfig::discover(&args)?;
    let root = startup::startup("Analyzer Server", &config.log)?;

    let queue = config
        .queue
        .build(&root)
        .await
        .map_err(|err| RuntimeError::boxed("server.queue.build", err))?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let log = root.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(target: log.target(), "shutdown signal received"),
                Err(err) => error!(target: log.target(), "listen for shutdown signal: {}", err),
            }
            shutdown.cancel();
        });
    }

    let served = run_http_receiver(&config.receiver.http, Arc::clone(&queue), &root, shutdown).await;
    if let Err(err) = &served {
        error!(target: root.target(), "http receiver stopped: {}", err);
    }
    if let Err(err) = queue.close().await {
        error!(target: root.target(), "failed queue shutdown: {}", err);
    }
    root.shutdown();
    served
}
