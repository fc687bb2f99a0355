use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;

use super::text_col;
use crate::db::Result;
use crate::packet::LeagueId;
use crate::processing::RunId;

/// Latest nodelist the engine wrote for a league.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNodelist {
    pub league: LeagueId,
    pub filename: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub updated_at: DateTime<Utc>,
    pub produced_by_run: Option<RunId>,
}

pub(super) fn upsert(conn: &Connection, nodelist: &StoredNodelist) -> Result<()> {
    conn.execute(
        "INSERT INTO nodelists (league, filename, content, updated_at, produced_by_run)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (league) DO UPDATE SET filename = excluded.filename,
                                            content = excluded.content,
                                            updated_at = excluded.updated_at,
                                            produced_by_run = excluded.produced_by_run",
        params![
            nodelist.league.to_string(),
            nodelist.filename,
            nodelist.content,
            nodelist.updated_at,
            nodelist.produced_by_run,
        ],
    )?;
    Ok(())
}

pub(super) fn get(conn: &Connection, league: LeagueId) -> Result<Option<StoredNodelist>> {
    Ok(conn
        .query_row(
            "SELECT league, filename, content, updated_at, produced_by_run
               FROM nodelists WHERE league = ?1",
            [league.to_string()],
            |row| {
                Ok(StoredNodelist {
                    league: text_col(row, 0)?,
                    filename: row.get(1)?,
                    content: row.get(2)?,
                    updated_at: row.get(3)?,
                    produced_by_run: row.get(4)?,
                })
            },
        )
        .optional()?)
}
