use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use super::optional_sequence_col;
use super::text_col;
use crate::db::Result;
use crate::ledger::RouteKey;
use crate::ledger::RouteState;
use crate::packet::Sequence;

fn key_params(route: RouteKey) -> (String, String, String) {
    (
        route.league.to_string(),
        route.source.to_string(),
        route.dest.to_string(),
    )
}

pub(super) fn load(conn: &Connection, route: RouteKey) -> Result<RouteState> {
    let (league, source, dest) = key_params(route);
    let found = conn
        .query_row(
            "SELECT last_sequence, last_seen_at, lap FROM route_state
              WHERE league = ?1 AND source_index = ?2 AND dest_index = ?3",
            params![league, source, dest],
            |row| {
                Ok(RouteState {
                    route,
                    last_sequence_seen: optional_sequence_col(row, 0)?,
                    last_seen_at: row.get(1)?,
                    lap: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(found.unwrap_or_else(|| RouteState::uninitialized(route)))
}

pub(super) fn advance(
    conn: &Connection,
    route: RouteKey,
    sequence: Sequence,
    lap: u32,
    seen_at: DateTime<Utc>,
) -> Result<()> {
    let (league, source, dest) = key_params(route);
    conn.execute(
        "INSERT INTO route_state
             (league, source_index, dest_index, last_sequence, last_seen_at, lap)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (league, source_index, dest_index)
         DO UPDATE SET last_sequence = excluded.last_sequence,
                       last_seen_at = excluded.last_seen_at,
                       lap = excluded.lap",
        params![league, source, dest, sequence.value(), seen_at, lap],
    )?;
    Ok(())
}

/// Record activity on a route without moving its sequence.
pub(super) fn touch(conn: &Connection, route: RouteKey, seen_at: DateTime<Utc>) -> Result<()> {
    let (league, source, dest) = key_params(route);
    conn.execute(
        "UPDATE route_state SET last_seen_at = ?4
          WHERE league = ?1 AND source_index = ?2 AND dest_index = ?3",
        params![league, source, dest, seen_at],
    )?;
    Ok(())
}

pub(super) fn list(conn: &Connection) -> Result<Vec<RouteState>> {
    let mut stmt = conn.prepare(
        "SELECT league, source_index, dest_index, last_sequence, last_seen_at, lap
           FROM route_state ORDER BY league, source_index, dest_index",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(RouteState {
            route: RouteKey {
                league: text_col(row, 0)?,
                source: text_col(row, 1)?,
                dest: text_col(row, 2)?,
            },
            last_sequence_seen: optional_sequence_col(row, 3)?,
            last_seen_at: row.get(4)?,
            lap: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::migrate_to_latest;
    use pretty_assertions::assert_eq;

    #[test]
    fn unknown_route_is_uninitialized() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_to_latest(&mut conn).unwrap();
        let route = RouteKey {
            league: "555B".parse().unwrap(),
            source: "02".parse().unwrap(),
            dest: "01".parse().unwrap(),
        };

        let state = load(&conn, route).unwrap();
        assert!(!state.is_tracking());

        let now = Utc::now();
        advance(&conn, route, Sequence::new(41).unwrap(), 0, now).unwrap();
        advance(&conn, route, Sequence::new(42).unwrap(), 0, now).unwrap();
        let state = load(&conn, route).unwrap();
        assert_eq!(state.last_sequence_seen, Sequence::new(42));
        assert_eq!(list(&conn).unwrap(), vec![state]);
    }
}
