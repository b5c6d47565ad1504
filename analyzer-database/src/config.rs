use std::sync::Arc;

use analyzer_utilities::Logger;
use log::info;
use serde::Deserialize;

use crate::{
    DatabaseError, EventDatabase,
    memory::MemoryDb,
    sqlite::{SqliteConfig, SqliteDb},
};

/// `db:` section. Decoding picks the backend; [`DatabaseConfig::build`]
/// opens it.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum DatabaseConfig {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "sqlite")]
    Sqlite(SqliteConfig),
}

impl DatabaseConfig {
    pub async fn build(&self, log: &Logger) -> Result<Arc<dyn EventDatabase>, DatabaseError> {
        match self {
            DatabaseConfig::Memory => {
                info!(target: log.target(), "using in-process event store");
                Ok(Arc::new(MemoryDb::new()))
            }
            DatabaseConfig::Sqlite(config) => {
                if config.path.trim().is_empty() {
                    return Err(DatabaseError::Config("sqlite: path is empty".into()));
                }
                Ok(Arc::new(SqliteDb::new(config, log).await?))
            }
        }
    }
}
