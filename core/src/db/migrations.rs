//! Schema versioning and migrations
//!
//! Forward-only. The applied version lives in `PRAGMA user_version` and each
//! step commits together with its version bump, so a step is either fully
//! applied or not at all.

use rusqlite::Connection;
use rusqlite::TransactionBehavior;

use super::DbError;
use super::Result;
use super::transactions::execute_in_transaction;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all migrations to bring DB to current version
pub fn migrate_to_latest(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(DbError::Migration(format!(
            "database schema v{current} is newer than supported v{SCHEMA_VERSION}"
        )));
    }
    if current < 1 {
        execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
            tx.execute_batch(MIGRATION_V1)?;
            tx.pragma_update(None, "user_version", 1)?;
            Ok(())
        })?;
        tracing::info!("applied schema migration v1");
    }
    if current < 2 {
        execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
            tx.execute_batch(MIGRATION_V2)?;
            tx.pragma_update(None, "user_version", 2)?;
            Ok(())
        })?;
        tracing::info!("applied schema migration v2");
    }
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS packets (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    filename          TEXT    NOT NULL,
    league            TEXT    NOT NULL,
    source_index      TEXT    NOT NULL,
    dest_index        TEXT    NOT NULL,
    sequence          INTEGER NOT NULL CHECK (sequence BETWEEN 0 AND 999),
    direction         TEXT    NOT NULL CHECK (direction IN ('inbound', 'outbound')),
    payload           BLOB    NOT NULL,
    size_bytes        INTEGER NOT NULL,
    checksum          TEXT    NOT NULL,
    uploaded_at       TEXT    NOT NULL,
    uploaded_by       TEXT    NOT NULL,
    processing_run_id TEXT    REFERENCES processing_runs(id),
    produced_by_run   TEXT    REFERENCES processing_runs(id),
    downloaded_at     TEXT
);

-- A tuple may exist only once while it is still waiting to be consumed
-- (inbound) or delivered (outbound).
CREATE UNIQUE INDEX IF NOT EXISTS idx_packets_live_inbound
    ON packets (league, source_index, dest_index, sequence)
    WHERE direction = 'inbound' AND processing_run_id IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_packets_live_outbound
    ON packets (league, source_index, dest_index, sequence)
    WHERE direction = 'outbound' AND downloaded_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_packets_mailbox
    ON packets (league, dest_index, direction);

CREATE TABLE IF NOT EXISTS route_state (
    league        TEXT    NOT NULL,
    source_index  TEXT    NOT NULL,
    dest_index    TEXT    NOT NULL,
    last_sequence INTEGER CHECK (last_sequence BETWEEN 0 AND 999),
    last_seen_at  TEXT,
    PRIMARY KEY (league, source_index, dest_index)
);

CREATE TABLE IF NOT EXISTS sequence_alerts (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    league            TEXT    NOT NULL,
    source_index      TEXT    NOT NULL,
    dest_index        TEXT    NOT NULL,
    expected_sequence INTEGER NOT NULL,
    received_sequence INTEGER NOT NULL,
    gap_size          INTEGER NOT NULL,
    detected_at       TEXT    NOT NULL,
    resolved_at       TEXT,
    resolved_by       TEXT,
    notes             TEXT,
    last_actor        TEXT,
    last_action_at    TEXT
);
CREATE INDEX IF NOT EXISTS idx_alerts_open
    ON sequence_alerts (resolved_at, detected_at);

CREATE TABLE IF NOT EXISTS processing_runs (
    id            TEXT PRIMARY KEY,
    scope         TEXT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
    triggered_by  TEXT NOT NULL,
    started_at    TEXT NOT NULL,
    completed_at  TEXT,
    logs          TEXT NOT NULL DEFAULT '',
    error_message TEXT
);
-- Backs the in-process run gate: at most one run may be running.
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_single_active
    ON processing_runs (status) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS run_artifacts (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id   TEXT NOT NULL REFERENCES processing_runs(id),
    league   TEXT NOT NULL,
    filename TEXT NOT NULL,
    kind     TEXT NOT NULL CHECK (kind IN ('score', 'routes', 'bbsinfo')),
    content  BLOB NOT NULL,
    rendered TEXT
);
CREATE INDEX IF NOT EXISTS idx_artifacts_run ON run_artifacts (run_id);

CREATE TABLE IF NOT EXISTS nodelists (
    league          TEXT PRIMARY KEY,
    filename        TEXT NOT NULL,
    content         BLOB NOT NULL,
    updated_at      TEXT NOT NULL,
    produced_by_run TEXT REFERENCES processing_runs(id)
);
"#;

/// Route laps, so a consumed or delivered tuple stays a duplicate until the
/// sequence ring wraps, and an explicit alert status.
const MIGRATION_V2: &str = r#"
ALTER TABLE route_state ADD COLUMN lap INTEGER NOT NULL DEFAULT 0;
ALTER TABLE packets ADD COLUMN lap INTEGER NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS idx_packets_lap
    ON packets (league, source_index, dest_index, sequence, direction, lap);

ALTER TABLE sequence_alerts ADD COLUMN status TEXT NOT NULL DEFAULT 'open'
    CHECK (status IN ('open', 'resolved'));
UPDATE sequence_alerts SET status = 'resolved' WHERE resolved_at IS NOT NULL;
DROP INDEX IF EXISTS idx_alerts_open;
CREATE INDEX IF NOT EXISTS idx_alerts_status
    ON sequence_alerts (status, detected_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_to_latest(&mut conn).unwrap();
        migrate_to_latest(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('packets', 'route_state', 'sequence_alerts', 'processing_runs',
                  'run_artifacts', 'nodelists')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn v2_marks_already_resolved_alerts() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATION_V1).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute_batch(
            "INSERT INTO sequence_alerts (league, source_index, dest_index, expected_sequence,
                                          received_sequence, gap_size, detected_at, resolved_at)
             VALUES ('555B', '02', '01', 3, 8, 5, '2024-01-01T00:00:00Z', NULL),
                    ('555B', '02', '01', 9, 12, 3, '2024-01-01T00:00:00Z',
                     '2024-01-02T00:00:00Z');
             INSERT INTO route_state (league, source_index, dest_index, last_sequence)
             VALUES ('555B', '02', '01', 12);",
        )
        .unwrap();

        migrate_to_latest(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 2);
        let statuses: Vec<String> = conn
            .prepare("SELECT status FROM sequence_alerts ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(statuses, vec!["open".to_string(), "resolved".to_string()]);
        let lap: u32 = conn
            .query_row("SELECT lap FROM route_state", [], |row| row.get(0))
            .unwrap();
        assert_eq!(lap, 0);
        assert!(
            conn.execute("UPDATE sequence_alerts SET status = 'closed'", [])
                .is_err()
        );
    }

    #[test]
    fn rejects_newer_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            migrate_to_latest(&mut conn),
            Err(DbError::Migration(_))
        ));
    }

    #[test]
    fn single_running_run_is_enforced() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_to_latest(&mut conn).unwrap();
        let insert = "INSERT INTO processing_runs (id, scope, status, triggered_by, started_at)
                      VALUES (?1, 'all', ?2, 'test', '2024-01-01T00:00:00Z')";
        conn.execute(insert, ["a", "running"]).unwrap();
        conn.execute(insert, ["b", "completed"]).unwrap();
        assert!(conn.execute(insert, ["c", "running"]).is_err());
    }
}
