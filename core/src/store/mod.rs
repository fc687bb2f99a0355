//! Durable hub state: packets, route ledger, alerts, runs and nodelists.
//!
//! The submodules hold synchronous functions over a `rusqlite::Connection`
//! so they compose inside one transaction. [`HubStore`] exposes them to
//! async callers through [`with_connection`].

mod alerts;
mod nodelists;
mod packets;
mod routes;
mod runs;

use std::error::Error as StdError;
use std::path::Path;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Row;
use rusqlite::TransactionBehavior;
use serde::Deserialize;
use serde::Serialize;

pub use nodelists::StoredNodelist;
pub use packets::Accepted;
pub use packets::DuplicateReason;
pub use packets::Ingested;
pub use packets::NewPacket;
pub use runs::RunCommit;
pub use runs::RunCommitSummary;

use crate::alerts::AlertError;
use crate::alerts::AlertId;
use crate::alerts::AlertQuery;
use crate::alerts::SequenceAlert;
use crate::db::DbPool;
use crate::db::Result;
use crate::db::execute_in_transaction;
use crate::db::initialize_pool;
use crate::db::with_connection;
use crate::ledger::GapPolicy;
use crate::ledger::RouteKey;
use crate::ledger::RouteState;
use crate::packet::BbsIndex;
use crate::packet::LeagueId;
use crate::packet::PacketIdentity;
use crate::packet::Sequence;
use crate::processing::ProcessingRun;
use crate::processing::RunId;
use crate::processing::RunScope;

pub const DEFAULT_POOL_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Uploaded by a member, waiting for the engine.
    Inbound,
    /// Waiting for the addressed member to download it.
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction {other:?}")),
        }
    }
}

/// Packet metadata. Payload bytes are loaded separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub id: i64,
    pub filename: String,
    pub identity: PacketIdentity,
    pub direction: Direction,
    pub size_bytes: u64,
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: String,
    pub processing_run_id: Option<RunId>,
    pub produced_by_run: Option<RunId>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// An inbound packet captured for a run, payload included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPacket {
    pub record: PacketRecord,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub pending_inbound: u64,
    pub pending_outbound: u64,
    pub delivered_outbound: u64,
    pub open_alerts: u64,
    pub routes_tracked: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct HubStore {
    pool: DbPool,
}

impl HubStore {
    pub fn open(db_path: &Path, pool_size: u32) -> Result<Self> {
        Ok(Self {
            pool: initialize_pool(db_path, pool_size)?,
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ── packets ─────────────────────────────────────────────────────────────

    /// Insert a packet and apply its ledger observation atomically.
    pub async fn ingest(&self, packet: NewPacket, policy: GapPolicy) -> Result<Ingested> {
        with_connection(&self.pool, move |conn| {
            execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
                packets::ingest(tx, packet, policy)
            })
        })
        .await
    }

    pub async fn list_outbound(
        &self,
        league: LeagueId,
        dest: BbsIndex,
        unread_only: bool,
    ) -> Result<Vec<PacketRecord>> {
        with_connection(&self.pool, move |conn| {
            packets::list_outbound(conn, league, dest, unread_only)
        })
        .await
    }

    /// Serve an outbound packet, stamping `downloaded_at` on first delivery.
    pub async fn deliver(
        &self,
        identity: PacketIdentity,
        now: DateTime<Utc>,
    ) -> Result<Option<(PacketRecord, Vec<u8>)>> {
        with_connection(&self.pool, move |conn| {
            execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
                packets::deliver(tx, identity, now)
            })
        })
        .await
    }

    pub async fn pending_inbound(&self, scope: RunScope) -> Result<Vec<PendingPacket>> {
        with_connection(&self.pool, move |conn| packets::pending_inbound(conn, scope)).await
    }

    pub async fn has_pending_inbound(&self) -> Result<bool> {
        with_connection(&self.pool, |conn| packets::has_pending_inbound(conn)).await
    }

    // ── routes ──────────────────────────────────────────────────────────────

    pub async fn route_state(&self, route: RouteKey) -> Result<RouteState> {
        with_connection(&self.pool, move |conn| routes::load(conn, route)).await
    }

    pub async fn list_routes(&self) -> Result<Vec<RouteState>> {
        with_connection(&self.pool, |conn| routes::list(conn)).await
    }

    // ── alerts ──────────────────────────────────────────────────────────────

    pub async fn list_alerts(&self, query: AlertQuery) -> Result<Vec<SequenceAlert>> {
        with_connection(&self.pool, move |conn| alerts::list(conn, &query)).await
    }

    pub async fn get_alert(&self, id: AlertId) -> std::result::Result<SequenceAlert, AlertError> {
        with_connection(&self.pool, move |conn| alerts::get(conn, id))
            .await?
            .ok_or(AlertError::NotFound(id))
    }

    pub async fn resolve_alert(
        &self,
        id: AlertId,
        actor: String,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> std::result::Result<SequenceAlert, AlertError> {
        with_connection(&self.pool, move |conn| {
            execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
                Ok(alerts::resolve(tx, id, &actor, notes.as_deref(), now))
            })
        })
        .await?
    }

    pub async fn reopen_alert(
        &self,
        id: AlertId,
        actor: String,
        now: DateTime<Utc>,
    ) -> std::result::Result<SequenceAlert, AlertError> {
        with_connection(&self.pool, move |conn| {
            execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
                Ok(alerts::reopen(tx, id, &actor, now))
            })
        })
        .await?
    }

    // ── runs ────────────────────────────────────────────────────────────────

    /// Record a new running run. Returns `false` when another run is
    /// already marked running.
    pub async fn begin_run(
        &self,
        id: RunId,
        scope: RunScope,
        triggered_by: String,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        with_connection(&self.pool, move |conn| {
            runs::insert_running(conn, &id, scope, &triggered_by, started_at)
        })
        .await
    }

    /// Commit everything a successful run produced in one transaction.
    pub async fn complete_run(
        &self,
        commit: RunCommit,
        policy: GapPolicy,
    ) -> Result<RunCommitSummary> {
        with_connection(&self.pool, move |conn| {
            execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
                runs::commit(tx, commit, policy)
            })
        })
        .await
    }

    pub async fn fail_run(
        &self,
        id: RunId,
        error: String,
        logs: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        with_connection(&self.pool, move |conn| {
            runs::mark_failed(conn, &id, &error, &logs, now)
        })
        .await
    }

    /// Fail every run still marked running. Used at startup, when no run can
    /// legitimately be in flight.
    pub async fn fail_stale_runs(&self, reason: String, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        with_connection(&self.pool, move |conn| {
            execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
                runs::fail_all_running(tx, &reason, now)
            })
        })
        .await
    }

    pub async fn get_run(&self, id: RunId) -> Result<Option<ProcessingRun>> {
        with_connection(&self.pool, move |conn| runs::get(conn, &id)).await
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<ProcessingRun>> {
        with_connection(&self.pool, move |conn| runs::list(conn, limit)).await
    }

    // ── nodelists ───────────────────────────────────────────────────────────

    pub async fn nodelist(&self, league: LeagueId) -> Result<Option<StoredNodelist>> {
        with_connection(&self.pool, move |conn| nodelists::get(conn, league)).await
    }

    // ── stats ───────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<HubStats> {
        with_connection(&self.pool, |conn| {
            let count = |sql: &str| -> Result<u64> {
                Ok(conn.query_row(sql, [], |row| row.get::<_, u64>(0))?)
            };
            Ok(HubStats {
                pending_inbound: count(
                    "SELECT COUNT(*) FROM packets
                     WHERE direction = 'inbound' AND processing_run_id IS NULL",
                )?,
                pending_outbound: count(
                    "SELECT COUNT(*) FROM packets
                     WHERE direction = 'outbound' AND downloaded_at IS NULL",
                )?,
                delivered_outbound: count(
                    "SELECT COUNT(*) FROM packets
                     WHERE direction = 'outbound' AND downloaded_at IS NOT NULL",
                )?,
                open_alerts: alerts::count_open(conn)?,
                routes_tracked: count(
                    "SELECT COUNT(*) FROM route_state WHERE last_sequence IS NOT NULL",
                )?,
                runs_completed: count(
                    "SELECT COUNT(*) FROM processing_runs WHERE status = 'completed'",
                )?,
                runs_failed: count("SELECT COUNT(*) FROM processing_runs WHERE status = 'failed'")?,
                last_run_at: conn.query_row(
                    "SELECT MAX(started_at) FROM processing_runs",
                    [],
                    |row| row.get(0),
                )?,
            })
        })
        .await
    }
}

// ── row decoding helpers ────────────────────────────────────────────────────

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn StdError + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

/// Read a text column and parse it with `FromStr`.
pub(crate) fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn StdError + Send + Sync>>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn sequence_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Sequence> {
    let raw: u16 = row.get(idx)?;
    Sequence::new(raw).ok_or_else(|| conversion_error(idx, format!("sequence {raw} out of range")))
}

pub(crate) fn optional_sequence_col(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<Sequence>> {
    match row.get::<_, Option<u16>>(idx)? {
        None => Ok(None),
        Some(raw) => Sequence::new(raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("sequence {raw} out of range"))),
    }
}

