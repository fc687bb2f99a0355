//! SQLite persistence primitives.
//!
//! - Connection pooling (r2d2-sqlite) with WAL and busy-timeout pragmas
//! - Forward-only schema migrations tracked by `PRAGMA user_version`
//! - ACID transaction helper
//! - `spawn_blocking` bridge so async callers never block the runtime

pub mod async_wrapper;
pub mod connection;
pub mod migrations;
pub mod transactions;

pub use async_wrapper::with_connection;
pub use connection::DbPool;
pub use connection::initialize_pool;
pub use transactions::execute_in_transaction;

/// Database module result type
pub type Result<T> = std::result::Result<T, DbError>;

/// Database error types
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}
