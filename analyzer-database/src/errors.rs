use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("invalid database configuration: {0}")]
    Config(String),
    #[error("database is closed")]
    Closed,
}
