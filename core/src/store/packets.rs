use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use sha2::Digest;
use sha2::Sha256;

use super::Direction;
use super::PacketRecord;
use super::PendingPacket;
use super::alerts;
use super::routes;
use super::sequence_col;
use super::text_col;
use crate::alerts::NewAlert;
use crate::alerts::SequenceAlert;
use crate::db::Result;
use crate::ledger::GapPolicy;
use crate::ledger::Observation;
use crate::ledger::RouteKey;
use crate::ledger::observe;
use crate::packet::BbsIndex;
use crate::packet::LeagueId;
use crate::packet::PacketIdentity;
use crate::processing::RunId;
use crate::processing::RunScope;

const PACKET_COLUMNS: &str = "id, filename, league, source_index, dest_index, sequence, \
     direction, size_bytes, checksum, uploaded_at, uploaded_by, processing_run_id, \
     produced_by_run, downloaded_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPacket {
    pub identity: PacketIdentity,
    pub direction: Direction,
    pub payload: Vec<u8>,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub produced_by_run: Option<RunId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub packet: PacketRecord,
    pub observation: Observation,
    pub alert: Option<SequenceAlert>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    /// The same tuple is still waiting in the same direction.
    Pending,
    /// The route's last seen sequence arrived again.
    Replay,
    /// The tuple already passed through the hub in the route's current lap,
    /// whether or not it was consumed or delivered since.
    Seen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Accepted(Box<Accepted>),
    Duplicate(DuplicateReason),
}

pub(super) fn packet_from_row(row: &Row<'_>) -> rusqlite::Result<PacketRecord> {
    Ok(PacketRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        identity: PacketIdentity {
            league: text_col(row, 2)?,
            source: text_col(row, 3)?,
            dest: text_col(row, 4)?,
            sequence: sequence_col(row, 5)?,
        },
        direction: text_col(row, 6)?,
        size_bytes: row.get(7)?,
        checksum: row.get(8)?,
        uploaded_at: row.get(9)?,
        uploaded_by: row.get(10)?,
        processing_run_id: row.get(11)?,
        produced_by_run: row.get(12)?,
        downloaded_at: row.get(13)?,
    })
}

pub(super) fn checksum(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

fn is_pending(conn: &Connection, identity: PacketIdentity, direction: Direction) -> Result<bool> {
    let live_clause = match direction {
        Direction::Inbound => "processing_run_id IS NULL",
        Direction::Outbound => "downloaded_at IS NULL",
    };
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM packets
          WHERE league = ?1 AND source_index = ?2 AND dest_index = ?3 AND sequence = ?4
            AND direction = ?5 AND {live_clause})"
    );
    Ok(conn.query_row(
        &sql,
        params![
            identity.league.to_string(),
            identity.source.to_string(),
            identity.dest.to_string(),
            identity.sequence.value(),
            direction.as_str(),
        ],
        |row| row.get(0),
    )?)
}

fn seen_in_lap(
    conn: &Connection,
    identity: PacketIdentity,
    direction: Direction,
    lap: u32,
) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM packets
          WHERE league = ?1 AND source_index = ?2 AND dest_index = ?3 AND sequence = ?4
            AND direction = ?5 AND lap = ?6)",
        params![
            identity.league.to_string(),
            identity.source.to_string(),
            identity.dest.to_string(),
            identity.sequence.value(),
            direction.as_str(),
            lap,
        ],
        |row| row.get(0),
    )?)
}

fn insert(conn: &Connection, packet: &NewPacket, lap: u32) -> Result<PacketRecord> {
    let identity = &packet.identity;
    let filename = identity.filename();
    let checksum = checksum(&packet.payload);
    conn.execute(
        "INSERT INTO packets (filename, league, source_index, dest_index, sequence, direction,
                              payload, size_bytes, checksum, uploaded_at, uploaded_by,
                              produced_by_run, lap)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            filename,
            identity.league.to_string(),
            identity.source.to_string(),
            identity.dest.to_string(),
            identity.sequence.value(),
            packet.direction.as_str(),
            packet.payload,
            packet.payload.len() as u64,
            checksum,
            packet.uploaded_at,
            packet.uploaded_by,
            packet.produced_by_run,
            lap,
        ],
    )?;
    Ok(PacketRecord {
        id: conn.last_insert_rowid(),
        filename,
        identity: *identity,
        direction: packet.direction,
        size_bytes: packet.payload.len() as u64,
        checksum,
        uploaded_at: packet.uploaded_at,
        uploaded_by: packet.uploaded_by.clone(),
        processing_run_id: None,
        produced_by_run: packet.produced_by_run.clone(),
        downloaded_at: None,
    })
}

/// Insert a packet, update its route ledger entry and raise a gap alert if
/// one is due. Duplicates leave every table untouched.
///
/// A tuple is a duplicate while a copy is pending, and also when any copy
/// of it was stored in the route's current lap: consuming or delivering a
/// packet does not free its sequence until the ring comes round again.
pub(super) fn ingest(conn: &Connection, packet: NewPacket, policy: GapPolicy) -> Result<Ingested> {
    if is_pending(conn, packet.identity, packet.direction)? {
        return Ok(Ingested::Duplicate(DuplicateReason::Pending));
    }

    let route = RouteKey::from(&packet.identity);
    let state = routes::load(conn, route)?;
    let received = packet.identity.sequence;
    let observation = observe(state.last_sequence_seen, received, policy);
    if observation == Observation::Replay {
        return Ok(Ingested::Duplicate(DuplicateReason::Replay));
    }
    if let Some(lap) = state.recent_lap(received)
        && seen_in_lap(conn, packet.identity, packet.direction, lap)?
    {
        return Ok(Ingested::Duplicate(DuplicateReason::Seen));
    }

    let lap = state.lap_for(received, observation);
    let record = insert(conn, &packet, lap)?;
    if observation.advances() {
        routes::advance(conn, route, received, lap, packet.uploaded_at)?;
    } else {
        routes::touch(conn, route, packet.uploaded_at)?;
    }

    let alert = match observation {
        Observation::Gap {
            expected,
            received,
            missing,
        } => Some(alerts::insert(
            conn,
            &NewAlert {
                route,
                expected_sequence: expected,
                received_sequence: received,
                gap_size: missing,
                detected_at: packet.uploaded_at,
            },
        )?),
        _ => None,
    };

    Ok(Ingested::Accepted(Box::new(Accepted {
        packet: record,
        observation,
        alert,
    })))
}

/// Copy an inbound packet addressed to another member into the outbox.
/// The route ledger already saw it on upload, so it is not consulted again.
pub(super) fn relay(
    conn: &Connection,
    source: &PacketRecord,
    payload: &[u8],
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<PacketRecord>> {
    if is_pending(conn, source.identity, Direction::Outbound)? {
        return Ok(None);
    }
    let lap: u32 = conn.query_row(
        "SELECT lap FROM packets WHERE id = ?1",
        params![source.id],
        |row| row.get(0),
    )?;
    let record = insert(
        conn,
        &NewPacket {
            identity: source.identity,
            direction: Direction::Outbound,
            payload: payload.to_vec(),
            uploaded_by: source.uploaded_by.clone(),
            uploaded_at: now,
            produced_by_run: Some(run_id.to_string()),
        },
        lap,
    )?;
    Ok(Some(record))
}

pub(super) fn list_outbound(
    conn: &Connection,
    league: LeagueId,
    dest: BbsIndex,
    unread_only: bool,
) -> Result<Vec<PacketRecord>> {
    let unread_clause = if unread_only {
        "AND downloaded_at IS NULL"
    } else {
        ""
    };
    let sql = format!(
        "SELECT {PACKET_COLUMNS} FROM packets
          WHERE league = ?1 AND dest_index = ?2 AND direction = 'outbound' {unread_clause}
          ORDER BY uploaded_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![league.to_string(), dest.to_string()], packet_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Pick the generation of `identity` to serve: the oldest undelivered copy,
/// otherwise the most recently delivered one.
fn find_outbound(conn: &Connection, identity: PacketIdentity) -> Result<Option<PacketRecord>> {
    let sql = format!(
        "SELECT {PACKET_COLUMNS} FROM packets
          WHERE league = ?1 AND source_index = ?2 AND dest_index = ?3 AND sequence = ?4
            AND direction = 'outbound'
          ORDER BY downloaded_at IS NOT NULL,
                   CASE WHEN downloaded_at IS NULL THEN uploaded_at END ASC,
                   downloaded_at DESC,
                   id DESC
          LIMIT 1"
    );
    Ok(conn
        .query_row(
            &sql,
            params![
                identity.league.to_string(),
                identity.source.to_string(),
                identity.dest.to_string(),
                identity.sequence.value(),
            ],
            packet_from_row,
        )
        .optional()?)
}

pub(super) fn deliver(
    conn: &Connection,
    identity: PacketIdentity,
    now: DateTime<Utc>,
) -> Result<Option<(PacketRecord, Vec<u8>)>> {
    let Some(mut record) = find_outbound(conn, identity)? else {
        return Ok(None);
    };
    if record.downloaded_at.is_none() {
        conn.execute(
            "UPDATE packets SET downloaded_at = ?2 WHERE id = ?1 AND downloaded_at IS NULL",
            params![record.id, now],
        )?;
        record.downloaded_at = Some(now);
    }
    let payload: Vec<u8> = conn.query_row(
        "SELECT payload FROM packets WHERE id = ?1",
        [record.id],
        |row| row.get(0),
    )?;
    Ok(Some((record, payload)))
}

pub(super) fn pending_inbound(conn: &Connection, scope: RunScope) -> Result<Vec<PendingPacket>> {
    let sql = format!(
        "SELECT {PACKET_COLUMNS}, payload FROM packets
          WHERE direction = 'inbound' AND processing_run_id IS NULL
          ORDER BY uploaded_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(PendingPacket {
            record: packet_from_row(row)?,
            payload: row.get(14)?,
        })
    })?;
    let mut pending = Vec::new();
    for row in rows {
        let packet = row?;
        if scope.includes(&packet.record.identity.league) {
            pending.push(packet);
        }
    }
    Ok(pending)
}

pub(super) fn has_pending_inbound(conn: &Connection) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM packets
          WHERE direction = 'inbound' AND processing_run_id IS NULL)",
        [],
        |row| row.get(0),
    )?)
}

/// Stamp consumed inbound packets with the run that drained them. Packets
/// already claimed by another run are left alone.
pub(super) fn mark_consumed(conn: &Connection, ids: &[i64], run_id: &str) -> Result<usize> {
    let mut stmt = conn.prepare(
        "UPDATE packets SET processing_run_id = ?2
          WHERE id = ?1 AND direction = 'inbound' AND processing_run_id IS NULL",
    )?;
    let mut updated = 0;
    for id in ids {
        updated += stmt.execute(params![id, run_id])?;
    }
    Ok(updated)
}

pub(super) fn filenames_for_run(
    conn: &Connection,
    run_id: &str,
    direction: Direction,
) -> Result<Vec<String>> {
    let column = match direction {
        Direction::Inbound => "processing_run_id",
        Direction::Outbound => "produced_by_run",
    };
    let sql = format!(
        "SELECT filename FROM packets WHERE {column} = ?1 AND direction = ?2 ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![run_id, direction.as_str()], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::migrate_to_latest;
    use crate::packet::Sequence;
    use crate::packet::parse;
    use chrono::Duration;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_to_latest(&mut conn).unwrap();
        conn
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn inbound(name: &str, minutes: i64) -> NewPacket {
        NewPacket {
            identity: parse(name).unwrap(),
            direction: Direction::Inbound,
            payload: name.as_bytes().to_vec(),
            uploaded_by: "bbs-02".to_string(),
            uploaded_at: at(minutes),
            produced_by_run: None,
        }
    }

    fn accept(conn: &Connection, packet: NewPacket) -> Accepted {
        match ingest(conn, packet, GapPolicy::default()).unwrap() {
            Ingested::Accepted(accepted) => *accepted,
            Ingested::Duplicate(reason) => panic!("unexpected duplicate: {reason:?}"),
        }
    }

    fn alert_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM sequence_alerts", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn gap_alert_is_written_with_the_packet() {
        let conn = conn();
        for (i, name) in ["555B0201.000", "555B0201.001", "555B0201.002"]
            .iter()
            .enumerate()
        {
            let accepted = accept(&conn, inbound(name, i as i64));
            assert!(accepted.alert.is_none());
        }
        let accepted = accept(&conn, inbound("555B0201.008", 5));
        let alert = accepted.alert.expect("gap alert");
        assert_eq!(alert.expected_sequence.value(), 3);
        assert_eq!(alert.received_sequence.value(), 8);
        assert_eq!(alert.gap_size, 5);
        assert_eq!(alert_count(&conn), 1);

        let state = routes::load(&conn, RouteKey::from(&accepted.packet.identity)).unwrap();
        assert_eq!(state.last_sequence_seen.map(|s| s.value()), Some(8));
    }

    #[test]
    fn pending_duplicate_changes_nothing() {
        let conn = conn();
        accept(&conn, inbound("555B0201.004", 0));
        accept(&conn, inbound("555B0201.005", 1));

        // 004 is still pending inbound: rejected before the ledger is read.
        let result = ingest(&conn, inbound("555B0201.004", 2), GapPolicy::default()).unwrap();
        assert_eq!(result, Ingested::Duplicate(DuplicateReason::Pending));

        let route = RouteKey::from(&parse("555B0201.005").unwrap());
        let state = routes::load(&conn, route).unwrap();
        assert_eq!(state.last_sequence_seen.map(|s| s.value()), Some(5));
        assert_eq!(state.last_seen_at, Some(at(1)));
        assert_eq!(alert_count(&conn), 0);
    }

    #[test]
    fn replay_of_consumed_packet_is_duplicate() {
        let conn = conn();
        let first = accept(&conn, inbound("555B0201.010", 0));
        conn.execute(
            "INSERT INTO processing_runs (id, scope, status, triggered_by, started_at)
             VALUES ('run-1', 'all', 'completed', 'test', ?1)",
            [at(1)],
        )
        .unwrap();
        mark_consumed(&conn, &[first.packet.id], "run-1").unwrap();

        let result = ingest(&conn, inbound("555B0201.010", 2), GapPolicy::default()).unwrap();
        assert_eq!(result, Ingested::Duplicate(DuplicateReason::Replay));
        assert_eq!(alert_count(&conn), 0);
    }

    fn consume_all(conn: &Connection, run_id: &str) {
        conn.execute(
            "INSERT INTO processing_runs (id, scope, status, triggered_by, started_at)
             VALUES (?1, 'all', 'completed', 'test', ?2)",
            params![run_id, at(0)],
        )
        .unwrap();
        conn.execute(
            "UPDATE packets SET processing_run_id = ?1
              WHERE direction = 'inbound' AND processing_run_id IS NULL",
            [run_id],
        )
        .unwrap();
    }

    #[test]
    fn consumed_tuple_stays_duplicate_for_the_rest_of_the_lap() {
        let conn = conn();
        for n in 1..=150 {
            accept(&conn, inbound(&format!("555B0201.{n:03}"), n));
        }
        consume_all(&conn, "run-1");

        for name in ["555B0201.149", "555B0201.001"] {
            let result = ingest(&conn, inbound(name, 200), GapPolicy::default()).unwrap();
            assert_eq!(result, Ingested::Duplicate(DuplicateReason::Seen), "{name}");
        }
        let route = RouteKey::from(&parse("555B0201.150").unwrap());
        let state = routes::load(&conn, route).unwrap();
        assert_eq!(state.last_sequence_seen.map(|s| s.value()), Some(150));
        assert_eq!(state.last_seen_at, Some(at(150)));
        assert_eq!(alert_count(&conn), 0);
        assert!(!has_pending_inbound(&conn).unwrap());

        let next = accept(&conn, inbound("555B0201.151", 201));
        assert_eq!(next.observation, Observation::InOrder);
        assert!(next.alert.is_none());
    }

    #[test]
    fn delivered_tuple_is_not_accepted_again() {
        let conn = conn();
        for (i, name) in ["555B0102.001", "555B0102.002"].iter().enumerate() {
            let mut packet = inbound(name, i as i64);
            packet.direction = Direction::Outbound;
            accept(&conn, packet);
        }
        deliver(&conn, parse("555B0102.001").unwrap(), at(5)).unwrap().unwrap();

        let mut again = inbound("555B0102.001", 6);
        again.direction = Direction::Outbound;
        let result = ingest(&conn, again, GapPolicy::default()).unwrap();
        assert_eq!(result, Ingested::Duplicate(DuplicateReason::Seen));
        let listed = list_outbound(&conn, "555B".parse().unwrap(), BbsIndex(2), false).unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn sequence_is_free_again_on_the_next_lap() {
        let conn = conn();
        accept(&conn, inbound("555B0201.998", 0));
        accept(&conn, inbound("555B0201.999", 1));
        let wrapped = accept(&conn, inbound("555B0201.000", 2));
        assert_eq!(wrapped.observation, Observation::InOrder);
        consume_all(&conn, "run-1");

        // 998 belongs to the lap that just closed.
        let result = ingest(&conn, inbound("555B0201.998", 3), GapPolicy::default()).unwrap();
        assert_eq!(result, Ingested::Duplicate(DuplicateReason::Seen));

        let route = RouteKey::from(&parse("555B0201.000").unwrap());
        assert_eq!(routes::load(&conn, route).unwrap().lap, 1);

        // Walk the ledger round to 997 of lap 1; 998 is due again.
        routes::advance(&conn, route, Sequence::new(997).unwrap(), 1, at(4)).unwrap();
        let again = accept(&conn, inbound("555B0201.998", 5));
        assert_eq!(again.observation, Observation::InOrder);
        let lap: u32 = conn
            .query_row("SELECT lap FROM packets WHERE id = ?1", [again.packet.id], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(lap, 1);
    }

    #[test]
    fn late_packet_is_stored_without_alert() {
        let conn = conn();
        accept(&conn, inbound("555B0201.020", 0));
        accept(&conn, inbound("555B0201.021", 1));
        let late = accept(&conn, inbound("555B0201.019", 2));
        assert!(matches!(late.observation, Observation::Late { behind: 2 }));
        assert!(late.alert.is_none());

        let state = routes::load(&conn, RouteKey::from(&late.packet.identity)).unwrap();
        assert_eq!(state.last_sequence_seen.map(|s| s.value()), Some(21));
        assert_eq!(state.last_seen_at, Some(at(2)));
    }

    #[test]
    fn delivery_is_idempotent() {
        let conn = conn();
        let mut packet = inbound("555B0102.001", 0);
        packet.direction = Direction::Outbound;
        packet.payload = vec![1, 2, 3];
        accept(&conn, packet);
        let identity = parse("555B0102.001").unwrap();

        let (first, bytes) = deliver(&conn, identity, at(5)).unwrap().unwrap();
        assert_eq!(first.downloaded_at, Some(at(5)));
        assert_eq!(bytes, vec![1, 2, 3]);

        let (second, again) = deliver(&conn, identity, at(9)).unwrap().unwrap();
        assert_eq!(second.downloaded_at, Some(at(5)));
        assert_eq!(again, bytes);

        assert!(deliver(&conn, parse("555B0102.002").unwrap(), at(9)).unwrap().is_none());
    }

    #[test]
    fn relay_skips_pending_outbound_copy() {
        let conn = conn();
        let accepted = accept(&conn, inbound("555B0203.001", 0));
        conn.execute(
            "INSERT INTO processing_runs (id, scope, status, triggered_by, started_at)
             VALUES ('run-1', 'all', 'running', 'test', ?1)",
            [at(1)],
        )
        .unwrap();
        let relayed = relay(&conn, &accepted.packet, b"x", "run-1", at(2))
            .unwrap()
            .expect("first relay inserts");
        assert_eq!(relayed.direction, Direction::Outbound);
        assert_eq!(relayed.produced_by_run.as_deref(), Some("run-1"));
        assert!(relay(&conn, &accepted.packet, b"x", "run-1", at(3)).unwrap().is_none());
    }

    #[test]
    fn pending_inbound_respects_scope() {
        let conn = conn();
        accept(&conn, inbound("555B0201.001", 0));
        accept(&conn, inbound("777F0201.001", 1));

        let all = pending_inbound(&conn, RunScope::All).unwrap();
        assert_eq!(all.len(), 2);
        let only = pending_inbound(&conn, RunScope::League("777F".parse().unwrap())).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].record.filename, "777F0201.001");
        assert_eq!(only[0].payload, b"777F0201.001".to_vec());
        assert!(has_pending_inbound(&conn).unwrap());
    }
}
