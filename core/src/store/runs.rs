use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;

use super::Direction;
use super::PacketRecord;
use super::PendingPacket;
use super::StoredNodelist;
use super::nodelists;
use super::packets;
use super::packets::Ingested;
use super::packets::NewPacket;
use super::text_col;
use crate::alerts::SequenceAlert;
use crate::db::DbError;
use crate::db::Result;
use crate::ledger::GapPolicy;
use crate::processing::ArtifactSummary;
use crate::processing::ProcessingArtifact;
use crate::processing::ProcessingRun;
use crate::processing::RunId;
use crate::processing::RunScope;
use crate::processing::RunStatus;

/// Everything a successful run hands back for an all-or-nothing commit.
#[derive(Debug, Clone, Default)]
pub struct RunCommit {
    pub run_id: RunId,
    /// Inbound packet ids drained by the run.
    pub consumed: Vec<i64>,
    /// Engine-produced packets, ingested like hub-originated uploads.
    pub produced: Vec<NewPacket>,
    /// Inbound packets addressed to another member, copied to the outbox.
    pub relays: Vec<PendingPacket>,
    pub artifacts: Vec<ProcessingArtifact>,
    pub nodelists: Vec<StoredNodelist>,
    pub logs: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCommitSummary {
    /// New outbox entries, relays included.
    pub deposited: Vec<PacketRecord>,
    pub alerts: Vec<SequenceAlert>,
    /// Produced packets rejected as duplicates, with the reason.
    pub skipped: Vec<String>,
    pub nodelists: Vec<StoredNodelist>,
    pub consumed: usize,
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

pub(super) fn insert_running(
    conn: &Connection,
    id: &str,
    scope: RunScope,
    triggered_by: &str,
    started_at: DateTime<Utc>,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO processing_runs (id, scope, status, triggered_by, started_at)
         VALUES (?1, ?2, 'running', ?3, ?4)",
        params![id, scope.to_string(), triggered_by, started_at],
    );
    match inserted {
        Ok(_) => Ok(true),
        Err(err) if is_constraint_violation(&err) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn status_of(conn: &Connection, id: &str) -> Result<Option<RunStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM processing_runs WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| {
        s.parse().map_err(|detail| DbError::Corrupt {
            table: "processing_runs",
            detail,
        })
    })
    .transpose()
}

pub(super) fn commit(
    conn: &Connection,
    commit: RunCommit,
    policy: GapPolicy,
) -> Result<RunCommitSummary> {
    let run_id = commit.run_id.as_str();
    if status_of(conn, run_id)? != Some(RunStatus::Running) {
        return Err(DbError::Transaction(format!(
            "run {run_id} is no longer running"
        )));
    }

    let mut summary = RunCommitSummary::default();
    for packet in commit.produced {
        let filename = packet.identity.filename();
        match packets::ingest(conn, packet, policy)? {
            Ingested::Accepted(accepted) => {
                summary.deposited.push(accepted.packet);
                summary.alerts.extend(accepted.alert);
            }
            Ingested::Duplicate(reason) => {
                summary.skipped.push(format!("{filename}: duplicate ({reason:?})"));
            }
        }
    }
    for relay in &commit.relays {
        match packets::relay(
            conn,
            &relay.record,
            &relay.payload,
            run_id,
            commit.completed_at,
        )? {
            Some(record) => summary.deposited.push(record),
            None => summary
                .skipped
                .push(format!("{}: already waiting in outbox", relay.record.filename)),
        }
    }

    {
        let mut stmt = conn.prepare(
            "INSERT INTO run_artifacts (run_id, league, filename, kind, content, rendered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for artifact in &commit.artifacts {
            stmt.execute(params![
                run_id,
                artifact.league.to_string(),
                artifact.filename,
                artifact.kind.as_str(),
                artifact.content,
                artifact.rendered,
            ])?;
        }
    }

    for nodelist in commit.nodelists {
        nodelists::upsert(conn, &nodelist)?;
        summary.nodelists.push(nodelist);
    }

    summary.consumed = packets::mark_consumed(conn, &commit.consumed, run_id)?;

    let mut logs = commit.logs;
    for note in &summary.skipped {
        if !logs.is_empty() && !logs.ends_with('\n') {
            logs.push('\n');
        }
        logs.push_str("skipped ");
        logs.push_str(note);
    }
    conn.execute(
        "UPDATE processing_runs SET status = 'completed', completed_at = ?2, logs = ?3
          WHERE id = ?1",
        params![run_id, commit.completed_at, logs],
    )?;
    Ok(summary)
}

pub(super) fn mark_failed(
    conn: &Connection,
    id: &str,
    error: &str,
    logs: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE processing_runs
            SET status = 'failed', completed_at = ?2, error_message = ?3, logs = ?4
          WHERE id = ?1 AND status = 'running'",
        params![id, now, error, logs],
    )?;
    Ok(())
}

pub(super) fn fail_all_running(
    conn: &Connection,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Vec<RunId>> {
    let ids = {
        let mut stmt = conn.prepare("SELECT id FROM processing_runs WHERE status = 'running'")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for id in &ids {
        conn.execute(
            "UPDATE processing_runs
                SET status = 'failed', completed_at = ?2, error_message = ?3
              WHERE id = ?1",
            params![id, now, reason],
        )?;
    }
    Ok(ids)
}

const RUN_COLUMNS: &str =
    "id, scope, status, triggered_by, started_at, completed_at, logs, error_message";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessingRun> {
    Ok(ProcessingRun {
        id: row.get(0)?,
        scope: text_col(row, 1)?,
        status: text_col(row, 2)?,
        triggered_by: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        logs: row.get(6)?,
        error_message: row.get(7)?,
        consumed_packets: Vec::new(),
        produced_packets: Vec::new(),
        artifacts: Vec::new(),
    })
}

fn artifacts_for(conn: &Connection, run_id: &str) -> Result<Vec<ArtifactSummary>> {
    let mut stmt = conn.prepare(
        "SELECT league, filename, kind, length(content), rendered
           FROM run_artifacts WHERE run_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([run_id], |row| {
        Ok(ArtifactSummary {
            league: text_col(row, 0)?,
            filename: row.get(1)?,
            kind: text_col(row, 2)?,
            size_bytes: row.get(3)?,
            rendered: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(super) fn get(conn: &Connection, id: &str) -> Result<Option<ProcessingRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM processing_runs WHERE id = ?1");
    let Some(mut run) = conn.query_row(&sql, [id], run_from_row).optional()? else {
        return Ok(None);
    };
    run.consumed_packets = packets::filenames_for_run(conn, id, Direction::Inbound)?;
    run.produced_packets = packets::filenames_for_run(conn, id, Direction::Outbound)?;
    run.artifacts = artifacts_for(conn, id)?;
    Ok(Some(run))
}

/// Most recent runs first, without packet and artifact detail.
pub(super) fn list(conn: &Connection, limit: usize) -> Result<Vec<ProcessingRun>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM processing_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit.max(1) as i64], run_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
