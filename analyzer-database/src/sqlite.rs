use std::time::Duration;

use analyzer_models::Event;
use analyzer_utilities::Logger;
use async_trait::async_trait;
use chrono::DateTime;
use log::{LevelFilter, info};
use serde::Deserialize;
use sqlx::{
    ConnectOptions, Executor, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use crate::{DatabaseError, EventDatabase};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS event (
        id TEXT PRIMARY KEY,
        user_id TEXT,
        identifier TEXT NOT NULL,
        event_timestamp INTEGER NOT NULL,
        type INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS event_data (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS event_date (
        event_date TEXT NOT NULL,
        event_timestamp INTEGER NOT NULL,
        id TEXT NOT NULL,
        PRIMARY KEY (event_date, event_timestamp, id)
    )",
    "CREATE TABLE IF NOT EXISTS event_user_id (
        user_id TEXT NOT NULL,
        identifier TEXT NOT NULL,
        id TEXT NOT NULL,
        PRIMARY KEY (user_id, identifier, id)
    )",
];

/// `type: sqlite` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

pub struct SqliteDb {
    pub pool: SqlitePool,
    log: Logger,
}

impl SqliteDb {
    /// Opens (creating if missing) the database file and its tables.
    pub async fn new(config: &SqliteConfig, log: &Logger) -> Result<Self, DatabaseError> {
        let log = log.named("sqlite");
        let mut options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true);
        options
            .log_statements(LevelFilter::Debug)
            .log_slow_statements(LevelFilter::Warn, Duration::from_secs(1));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            pool.execute(statement).await?;
        }
        info!(target: log.target(), "opened {}", config.path);
        Ok(Self { pool, log })
    }
}

/// Calendar day (UTC) of an epoch-millisecond timestamp, e.g. `2024-05-01`.
fn event_date(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|at| at.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

#[async_trait]
impl EventDatabase for SqliteDb {
    async fn insert(&self, event: &Event) -> Result<(), DatabaseError> {
        if self.pool.is_closed() {
            return Err(DatabaseError::Closed);
        }
        let id = event.id().to_string();
        let user_id = event.user_id().unwrap_or_default().to_string();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR IGNORE INTO event (id, user_id, identifier, event_timestamp, type)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(event.user_id())
        .bind(event.identifier())
        .bind(event.timestamp())
        .bind(event.event_type().0)
        .execute(&mut tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO event_data (id, data) VALUES (?, ?)")
            .bind(&id)
            .bind(event.data().get())
            .execute(&mut tx)
            .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO event_date (event_date, event_timestamp, id) VALUES (?, ?, ?)",
        )
        .bind(event_date(event.timestamp()))
        .bind(event.timestamp())
        .bind(&id)
        .execute(&mut tx)
        .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO event_user_id (user_id, identifier, id) VALUES (?, ?, ?)",
        )
        .bind(&user_id)
        .bind(event.identifier())
        .bind(&id)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!(target: self.log.target(), "closed");
        }
        Ok(())
    }
}
