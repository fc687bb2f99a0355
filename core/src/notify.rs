//! Distribution notifications.
//!
//! Publishing never blocks and never fails the operation that triggered it:
//! events are emitted after the state change has committed, and a missing
//! or lagging subscriber is simply skipped.

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::alerts::AlertId;
use crate::packet::BbsIndex;
use crate::packet::LeagueId;
use crate::packet::Sequence;
use crate::processing::RunId;
use crate::processing::RunScope;
use crate::processing::RunStatus;
use crate::store::HubStats;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    PacketReceived {
        league: LeagueId,
        filename: String,
        source: BbsIndex,
        dest: BbsIndex,
        sequence: Sequence,
    },
    PacketAvailable {
        league: LeagueId,
        filename: String,
        dest: BbsIndex,
    },
    ProcessingStarted {
        run_id: RunId,
        scope: RunScope,
    },
    ProcessingComplete {
        run_id: RunId,
        status: RunStatus,
        consumed: usize,
        produced: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AlertCreated {
        alert_id: AlertId,
        league: LeagueId,
        source: BbsIndex,
        dest: BbsIndex,
        expected_sequence: Sequence,
        received_sequence: Sequence,
    },
    NodelistAvailable {
        league: LeagueId,
        filename: String,
    },
    StatsUpdate {
        stats: HubStats,
    },
}

impl HubEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::PacketReceived { .. } => "packet_received",
            HubEvent::PacketAvailable { .. } => "packet_available",
            HubEvent::ProcessingStarted { .. } => "processing_started",
            HubEvent::ProcessingComplete { .. } => "processing_complete",
            HubEvent::AlertCreated { .. } => "alert_created",
            HubEvent::NodelistAvailable { .. } => "nodelist_available",
            HubEvent::StatsUpdate { .. } => "stats_update",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn publish(&self, event: HubEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn publish(&self, _event: HubEvent) {}
}

/// Fans events out to any number of in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<HubEvent>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: HubEvent) {
        let kind = event.kind();
        // No subscribers is not an error.
        match self.tx.send(event) {
            Ok(receivers) => tracing::trace!(kind, receivers, "event published"),
            Err(_) => tracing::trace!(kind, "event dropped, no subscribers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nodelist_event() -> HubEvent {
        HubEvent::NodelistAvailable {
            league: "555B".parse().unwrap(),
            filename: "BRNODES.555".to_string(),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        BroadcastNotifier::new().publish(nodelist_event());
        NoopNotifier.publish(nodelist_event());
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let notifier = BroadcastNotifier::new();
        let mut rx = notifier.subscribe();
        notifier.publish(nodelist_event());
        assert_eq!(rx.recv().await.unwrap(), nodelist_event());
    }

    #[test]
    fn events_carry_type_tag() {
        let json = serde_json::to_value(nodelist_event()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "nodelist_available",
                "league": "555B",
                "filename": "BRNODES.555",
            })
        );
        assert_eq!(nodelist_event().kind(), "nodelist_available");
    }
}
