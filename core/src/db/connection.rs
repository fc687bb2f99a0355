//! Connection pooling and pragma configuration

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use super::DbError;
use super::Result;
use super::migrations;

pub type DbPool = Pool<SqliteConnectionManager>;

const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Open (creating if needed) the database at `db_path`, apply pragmas to
/// every pooled connection and bring the schema up to date.
pub fn initialize_pool(db_path: &Path, pool_size: u32) -> Result<DbPool> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| DbError::Pool(format!("Failed to create {}: {e}", parent.display())))?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(apply_pragmas);
    let pool = Pool::builder()
        .max_size(pool_size.max(1))
        .connection_timeout(Duration::from_secs(30))
        .build(manager)
        .map_err(|e| DbError::Pool(format!("Failed to build pool: {e}")))?;

    let mut conn = pool
        .get()
        .map_err(|e| DbError::Pool(format!("Failed to get connection: {e}")))?;
    migrations::migrate_to_latest(&mut conn)?;
    tracing::debug!(path = %db_path.display(), pool_size, "database ready");

    Ok(pool)
}

fn apply_pragmas(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"
    ))
}
