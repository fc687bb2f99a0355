use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;

use super::conversion_error;
use super::sequence_col;
use super::text_col;
use crate::alerts::AlertError;
use crate::alerts::AlertFilter;
use crate::alerts::AlertId;
use crate::alerts::AlertQuery;
use crate::alerts::AlertStatus;
use crate::alerts::AlertStatusKind;
use crate::alerts::AlertTransition;
use crate::alerts::NewAlert;
use crate::alerts::SequenceAlert;
use crate::db::DbError;
use crate::db::Result;
use crate::ledger::RouteKey;

const ALERT_COLUMNS: &str = "id, league, source_index, dest_index, expected_sequence, \
     received_sequence, gap_size, detected_at, resolved_at, resolved_by, notes, last_actor, \
     last_action_at, status";

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<SequenceAlert> {
    let resolved_at: Option<DateTime<Utc>> = row.get(8)?;
    let resolved_by: Option<String> = row.get(9)?;
    let status = match (text_col::<AlertStatusKind>(row, 13)?, resolved_at) {
        (AlertStatusKind::Open, _) => AlertStatus::Open,
        (AlertStatusKind::Resolved, Some(resolved_at)) => AlertStatus::Resolved {
            resolved_at,
            resolved_by: resolved_by.unwrap_or_default(),
        },
        (AlertStatusKind::Resolved, None) => {
            return Err(conversion_error(13, "resolved alert has no resolved_at"));
        }
    };
    let last_actor: Option<String> = row.get(11)?;
    let last_action_at: Option<DateTime<Utc>> = row.get(12)?;
    Ok(SequenceAlert {
        id: row.get(0)?,
        route: RouteKey {
            league: text_col(row, 1)?,
            source: text_col(row, 2)?,
            dest: text_col(row, 3)?,
        },
        expected_sequence: sequence_col(row, 4)?,
        received_sequence: sequence_col(row, 5)?,
        gap_size: row.get(6)?,
        detected_at: row.get(7)?,
        status,
        notes: row.get(10)?,
        last_transition: last_actor
            .zip(last_action_at)
            .map(|(actor, at)| AlertTransition { actor, at }),
    })
}

pub(super) fn insert(conn: &Connection, alert: &NewAlert) -> Result<SequenceAlert> {
    conn.execute(
        "INSERT INTO sequence_alerts (league, source_index, dest_index, expected_sequence,
                                      received_sequence, gap_size, detected_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            alert.route.league.to_string(),
            alert.route.source.to_string(),
            alert.route.dest.to_string(),
            alert.expected_sequence.value(),
            alert.received_sequence.value(),
            alert.gap_size,
            alert.detected_at,
            AlertStatusKind::Open.as_str(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::warn!(
        alert_id = id,
        route = %alert.route,
        expected = %alert.expected_sequence,
        received = %alert.received_sequence,
        "sequence gap detected"
    );
    get(conn, id)?.ok_or_else(|| DbError::Transaction(format!("alert {id} vanished after insert")))
}

pub(super) fn get(conn: &Connection, id: AlertId) -> Result<Option<SequenceAlert>> {
    let sql = format!("SELECT {ALERT_COLUMNS} FROM sequence_alerts WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], alert_from_row).optional()?)
}

pub(super) fn list(conn: &Connection, query: &AlertQuery) -> Result<Vec<SequenceAlert>> {
    let filter = match query.filter {
        AlertFilter::Open => "WHERE status = 'open'",
        AlertFilter::Resolved => "WHERE status = 'resolved'",
        AlertFilter::All => "",
    };
    let sql = format!(
        "SELECT {ALERT_COLUMNS} FROM sequence_alerts {filter}
          ORDER BY status = 'resolved', detected_at DESC, id DESC
          LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([query.effective_limit() as i64], alert_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(super) fn count_open(conn: &Connection) -> Result<u64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM sequence_alerts WHERE status = 'open'",
        [],
        |row| row.get(0),
    )?)
}

pub(super) fn resolve(
    conn: &Connection,
    id: AlertId,
    actor: &str,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> std::result::Result<SequenceAlert, AlertError> {
    let alert = get(conn, id)?.ok_or(AlertError::NotFound(id))?;
    if alert.status.is_resolved() {
        return Err(AlertError::AlreadyResolved(id));
    }
    conn.execute(
        "UPDATE sequence_alerts
            SET status = ?5, resolved_at = ?2, resolved_by = ?3, notes = COALESCE(?4, notes),
                last_actor = ?3, last_action_at = ?2
          WHERE id = ?1",
        params![id, now, actor, notes, AlertStatusKind::Resolved.as_str()],
    )
    .map_err(DbError::from)?;
    tracing::info!(alert_id = id, actor, "alert resolved");
    get(conn, id)?.ok_or(AlertError::NotFound(id))
}

pub(super) fn reopen(
    conn: &Connection,
    id: AlertId,
    actor: &str,
    now: DateTime<Utc>,
) -> std::result::Result<SequenceAlert, AlertError> {
    let alert = get(conn, id)?.ok_or(AlertError::NotFound(id))?;
    if !alert.status.is_resolved() {
        return Err(AlertError::NotResolved(id));
    }
    conn.execute(
        "UPDATE sequence_alerts
            SET status = ?4, resolved_at = NULL, resolved_by = NULL,
                last_actor = ?2, last_action_at = ?3
          WHERE id = ?1",
        params![id, actor, now, AlertStatusKind::Open.as_str()],
    )
    .map_err(DbError::from)?;
    tracing::info!(alert_id = id, actor, "alert reopened");
    get(conn, id)?.ok_or(AlertError::NotFound(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::migrate_to_latest;
    use crate::packet::Sequence;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_to_latest(&mut conn).unwrap();
        conn
    }

    fn raise(conn: &Connection, expected: u16, detected_at: DateTime<Utc>) -> SequenceAlert {
        insert(
            conn,
            &NewAlert {
                route: RouteKey {
                    league: "555B".parse().unwrap(),
                    source: "02".parse().unwrap(),
                    dest: "01".parse().unwrap(),
                },
                expected_sequence: Sequence::new(expected).unwrap(),
                received_sequence: Sequence::new(expected + 4).unwrap(),
                gap_size: 4,
                detected_at,
            },
        )
        .unwrap()
    }

    #[test]
    fn resolve_and_reopen_record_the_actor() {
        let conn = conn();
        let now = Utc::now();
        let alert = raise(&conn, 3, now);
        assert_eq!(alert.status, AlertStatus::Open);

        let resolved = resolve(&conn, alert.id, "sysop", Some("lost in transit"), now).unwrap();
        assert_eq!(
            resolved.status,
            AlertStatus::Resolved {
                resolved_at: now,
                resolved_by: "sysop".to_string(),
            }
        );
        assert_eq!(resolved.notes.as_deref(), Some("lost in transit"));
        assert!(list(&conn, &AlertQuery::default()).unwrap().is_empty());
        assert!(matches!(
            resolve(&conn, alert.id, "sysop", None, now),
            Err(AlertError::AlreadyResolved(_))
        ));

        let later = now + Duration::minutes(3);
        let reopened = reopen(&conn, alert.id, "auditor", later).unwrap();
        assert_eq!(reopened.status, AlertStatus::Open);
        assert_eq!(
            reopened.last_transition,
            Some(AlertTransition {
                actor: "auditor".to_string(),
                at: later,
            })
        );
        assert_eq!(reopened.notes.as_deref(), Some("lost in transit"));
        assert_eq!(count_open(&conn).unwrap(), 1);
    }

    #[test]
    fn list_orders_open_first_then_newest() {
        let conn = conn();
        let base = Utc::now();
        let old = raise(&conn, 10, base);
        let newer = raise(&conn, 20, base + Duration::minutes(1));
        let closed = raise(&conn, 30, base + Duration::minutes(2));
        resolve(&conn, closed.id, "sysop", None, base).unwrap();

        let all = list(
            &conn,
            &AlertQuery {
                filter: AlertFilter::All,
                limit: 10,
            },
        )
        .unwrap();
        let ids: Vec<AlertId> = all.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![newer.id, old.id, closed.id]);

        let resolved = list(
            &conn,
            &AlertQuery {
                filter: AlertFilter::Resolved,
                limit: 10,
            },
        )
        .unwrap();
        assert_eq!(resolved.len(), 1);

        let limited = list(
            &conn,
            &AlertQuery {
                filter: AlertFilter::Open,
                limit: 1,
            },
        )
        .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, newer.id);
    }

    fn stored_status(conn: &Connection, id: AlertId) -> String {
        conn.query_row("SELECT status FROM sequence_alerts WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn status_column_follows_transitions() {
        let conn = conn();
        let now = Utc::now();
        let alert = raise(&conn, 5, now);
        assert_eq!(stored_status(&conn, alert.id), "open");
        resolve(&conn, alert.id, "sysop", None, now).unwrap();
        assert_eq!(stored_status(&conn, alert.id), "resolved");
        reopen(&conn, alert.id, "sysop", now).unwrap();
        assert_eq!(stored_status(&conn, alert.id), "open");
    }

    #[test]
    fn status_is_read_from_its_own_column() {
        let conn = conn();
        let now = Utc::now();
        let alert = raise(&conn, 5, now);
        conn.execute(
            "UPDATE sequence_alerts SET resolved_at = ?2 WHERE id = ?1",
            params![alert.id, now],
        )
        .unwrap();
        assert_eq!(get(&conn, alert.id).unwrap().unwrap().status, AlertStatus::Open);
        assert_eq!(count_open(&conn).unwrap(), 1);

        conn.execute(
            "UPDATE sequence_alerts SET status = 'resolved', resolved_at = NULL WHERE id = ?1",
            [alert.id],
        )
        .unwrap();
        assert!(get(&conn, alert.id).is_err());
    }

    #[test]
    fn missing_alert_is_not_found() {
        let conn = conn();
        assert!(matches!(
            resolve(&conn, 99, "sysop", None, Utc::now()),
            Err(AlertError::NotFound(99))
        ));
    }
}
