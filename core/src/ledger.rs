//! Route ledger and sequence gap detection.
//!
//! A route is the directed packet stream `source -> dest` inside one league.
//! The ledger keeps the last sequence seen on every route; [`observe`]
//! classifies each newly received sequence against it. The classification
//! is pure so the store can apply it inside the same transaction that
//! inserts the packet.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::packet::BbsIndex;
use crate::packet::LeagueId;
use crate::packet::PacketIdentity;
use crate::packet::SEQUENCE_MODULUS;
use crate::packet::Sequence;

/// Largest reorder window that still leaves forward gaps detectable.
pub const MAX_REORDER_WINDOW: u16 = SEQUENCE_MODULUS / 2 - 1;

pub const DEFAULT_REORDER_WINDOW: u16 = 100;

/// How far behind the last seen sequence a re-sent tuple is still matched
/// against packets already received in the current lap. Anything further
/// back is read as the next lap of the ring.
pub const RECENT_HORIZON: u16 = SEQUENCE_MODULUS / 2 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub league: LeagueId,
    pub source: BbsIndex,
    pub dest: BbsIndex,
}

impl From<&PacketIdentity> for RouteKey {
    fn from(identity: &PacketIdentity) -> Self {
        Self {
            league: identity.league,
            source: identity.source,
            dest: identity.dest,
        }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}->{}", self.league, self.source, self.dest)
    }
}

/// Ledger entry for one route. `last_sequence_seen` is `None` until the
/// first packet arrives (the route is uninitialized). `lap` counts how many
/// times the route has wrapped from 999 back to 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteState {
    pub route: RouteKey,
    pub last_sequence_seen: Option<Sequence>,
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lap: u32,
}

impl RouteState {
    pub fn uninitialized(route: RouteKey) -> Self {
        Self {
            route,
            last_sequence_seen: None,
            last_seen_at: None,
            lap: 0,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.last_sequence_seen.is_some()
    }

    /// Lap in which `received` last had its slot on the ring, when that
    /// slot lies within [`RECENT_HORIZON`] behind the last seen sequence.
    /// A packet already stored for that lap makes `received` a duplicate.
    pub fn recent_lap(&self, received: Sequence) -> Option<u32> {
        let last = self.last_sequence_seen?;
        if received.steps_to(last) > RECENT_HORIZON {
            return None;
        }
        if received.value() <= last.value() {
            Some(self.lap)
        } else {
            self.lap.checked_sub(1)
        }
    }

    /// Lap a newly accepted packet belongs to. For advancing observations
    /// this is also the route's lap afterwards.
    pub fn lap_for(&self, received: Sequence, observation: Observation) -> u32 {
        let Some(last) = self.last_sequence_seen else {
            return self.lap;
        };
        let wrapped = received.value() <= last.value();
        match observation {
            Observation::InOrder | Observation::Gap { .. } if wrapped => self.lap + 1,
            Observation::Late { .. } if !wrapped => self.lap.saturating_sub(1),
            _ => self.lap,
        }
    }
}

/// How far behind the last seen sequence a packet may arrive and still be
/// treated as a late delivery rather than a wrap-around gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapPolicy {
    reorder_window: u16,
}

impl GapPolicy {
    pub fn new(reorder_window: u16) -> Self {
        Self {
            reorder_window: reorder_window.min(MAX_REORDER_WINDOW),
        }
    }

    pub fn reorder_window(&self) -> u16 {
        self.reorder_window
    }
}

impl Default for GapPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_WINDOW)
    }
}

/// Result of comparing a received sequence with the route's ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First packet on the route.
    First,
    /// Exactly the expected successor.
    InOrder,
    /// Packets between `expected` and `received` never arrived.
    Gap {
        expected: Sequence,
        received: Sequence,
        missing: u16,
    },
    /// Arrived after a newer packet on the same route; within the window.
    Late { behind: u16 },
    /// Same sequence as the last one seen.
    Replay,
}

impl Observation {
    /// Whether the ledger moves to the received sequence.
    pub fn advances(&self) -> bool {
        matches!(
            self,
            Observation::First | Observation::InOrder | Observation::Gap { .. }
        )
    }
}

/// Classify `received` against the last sequence seen on its route.
pub fn observe(last: Option<Sequence>, received: Sequence, policy: GapPolicy) -> Observation {
    let Some(last) = last else {
        return Observation::First;
    };
    let expected = last.successor();
    if received == expected {
        return Observation::InOrder;
    }
    let behind = received.steps_to(last);
    if behind == 0 {
        return Observation::Replay;
    }
    if behind <= policy.reorder_window() {
        return Observation::Late { behind };
    }
    Observation::Gap {
        expected,
        received,
        missing: expected.steps_to(received),
    }
}

/// Per-route async locks. Ingestion on one route never waits for another.
///
/// Slots nobody holds or waits on are dropped the next time any route is
/// locked, so the map stays bounded by the routes currently in use.
#[derive(Debug, Default)]
pub struct RouteLocks {
    routes: Mutex<HashMap<RouteKey, Arc<Mutex<()>>>>,
}

impl RouteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, route: RouteKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut routes = self.routes.lock().await;
            // Holders and waiters keep their own clone of the slot.
            routes.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(routes.entry(route).or_default())
        };
        slot.lock_owned().await
    }

    /// Routes with a live slot.
    pub async fn tracked(&self) -> usize {
        self.routes.lock().await.len()
    }

    /// Lock several routes at once. Keys are taken in sorted order so two
    /// callers with overlapping sets cannot deadlock.
    pub async fn lock_many(
        &self,
        routes: impl IntoIterator<Item = RouteKey>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut keys: Vec<RouteKey> = routes.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }
}
