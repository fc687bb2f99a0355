//! Async wrapper bridging the synchronous SQLite pool with the Tokio runtime.
//!
//! SQLite calls block, so every store operation runs on the blocking thread
//! pool via `tokio::task::spawn_blocking`.

use rusqlite::Connection;

use super::DbError;
use super::DbPool;
use super::Result;

/// Execute sync database operation in async context using spawn_blocking
pub async fn with_connection<F, T>(pool: &DbPool, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();

    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DbError::Pool(format!("Failed to get connection: {e}")))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| DbError::Transaction(format!("Task join error: {e}")))?
}
