pub mod config;
mod errors;
pub mod interfaces;
pub mod memory;
pub mod sqlite;

pub use config::DatabaseConfig;
pub use errors::DatabaseError;
pub use interfaces::EventDatabase;
