use analyzer_config::{CliArgs, ProcessConfig, WorkerConfig};
use analyzer_models::errors::{RuntimeError, SendableError};
use analyzer_utilities::startup;
use analyzer_worker::EventHandler;
use clap::Parser;
use log::{debug, error, info};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let args = CliArgs::parse();
    let config = WorkerConfig::discover(&args)?;
    let root = startup::startup(&config.worker.name, &config.log)?;

    let db = config
        .db
        .build(&root)
        .await
        .map_err(|err| RuntimeError::boxed("worker.db.build", err))?;
    let queue = match config.queue.build(&root).await {
        Ok(queue) => queue,
        Err(err) => {
            if let Err(close_err) = db.close().await {
                error!(target: root.target(), "failed database shutdown: {}", close_err);
            }
            return Err(RuntimeError::boxed("worker.queue.build", err));
        }
    };

    let started = EventHandler::new(db.clone(), &root).start(queue.as_ref()).await;
    if started.is_ok() {
        debug!(target: root.target(), "RUNNING...");
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(target: root.target(), "shutdown signal received"),
            Err(err) => error!(target: root.target(), "listen for shutdown signal: {}", err),
        }
    }

    if let Err(err) = queue.close().await {
        error!(target: root.target(), "failed queue shutdown: {}", err);
    }
    if let Err(err) = db.close().await {
        error!(target: root.target(), "failed database shutdown: {}", err);
    }
    info!(target: root.target(), "stats: {:?}", queue.stats());
    root.shutdown();
    started
}
