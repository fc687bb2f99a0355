//! End-to-end packet exchange through `Mailbox` and a real SQLite store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::Utc;
use nova_hub_core::alerts::AlertFilter;
use nova_hub_core::alerts::AlertQuery;
use nova_hub_core::alerts::AlertStatus;
use nova_hub_core::authz::ClientIdentity;
use nova_hub_core::authz::StaticAuthorizer;
use nova_hub_core::config::ClientConfig;
use nova_hub_core::config::HubConfig;
use nova_hub_core::config::MembershipConfig;
use nova_hub_core::config::NodeLocation;
use nova_hub_core::ledger::GapPolicy;
use nova_hub_core::ledger::RouteKey;
use nova_hub_core::ledger::RouteLocks;
use nova_hub_core::notify::BroadcastNotifier;
use nova_hub_core::packet::BbsIndex;
use nova_hub_core::packet::LeagueId;
use nova_hub_core::packet::Sequence;
use nova_hub_core::packet::parse;
use nova_hub_core::processing::RunScope;
use nova_hub_core::store::Direction;
use nova_hub_core::store::DuplicateReason;
use nova_hub_core::store::Ingested;
use nova_hub_core::store::NewPacket;
use nova_hub_core::store::RunCommit;
use nova_hub_core::AlertError;
use nova_hub_core::HubEvent;
use nova_hub_core::HubStore;
use nova_hub_core::Mailbox;
use nova_hub_core::TransferError;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const OUTPOST_TOKEN: &str = "outpost-token";
const STARPORT_TOKEN: &str = "starport-token";

struct Hub {
    _dir: TempDir,
    store: HubStore,
    notifier: Arc<BroadcastNotifier>,
    mailbox: Mailbox,
}

fn league() -> LeagueId {
    "555B".parse().unwrap()
}

fn client_config(id: &str, token: &str, index: u8) -> ClientConfig {
    ClientConfig {
        id: id.to_string(),
        name: format!("{id} BBS"),
        token_sha256: StaticAuthorizer::token_digest(token),
        memberships: vec![MembershipConfig {
            league: league(),
            bbs_index: BbsIndex(index),
        }],
        location: NodeLocation::default(),
    }
}

fn hub() -> Hub {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HubConfig::default();
    config.clients.push(client_config("outpost", OUTPOST_TOKEN, 0x02));
    config.clients.push(client_config("starport", STARPORT_TOKEN, 0x03));

    let store = HubStore::open(&dir.path().join("hub.db"), 4).unwrap();
    let notifier = Arc::new(BroadcastNotifier::new());
    let mailbox = Mailbox::new(
        store.clone(),
        Arc::new(StaticAuthorizer::from_config(&config)),
        notifier.clone(),
        Arc::new(RouteLocks::new()),
        GapPolicy::default(),
    );
    Hub {
        _dir: dir,
        store,
        notifier,
        mailbox,
    }
}

impl Hub {
    fn outpost(&self) -> ClientIdentity {
        self.mailbox.authenticate(OUTPOST_TOKEN).unwrap()
    }

    fn starport(&self) -> ClientIdentity {
        self.mailbox.authenticate(STARPORT_TOKEN).unwrap()
    }

    async fn upload_seq(&self, route: &str, seq: u16) -> Result<(), TransferError> {
        let name = format!("555B{route}.{seq:03}");
        self.mailbox
            .upload(&self.outpost(), "555B", &name, name.clone().into_bytes())
            .await
            .map(|_| ())
    }

    async fn open_alerts(&self) -> Vec<(u16, u16)> {
        self.store
            .list_alerts(AlertQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.expected_sequence.value(), a.received_sequence.value()))
            .collect()
    }

    async fn last_seen(&self, route: &str) -> Option<u16> {
        let identity = parse(&format!("555B{route}.000")).unwrap();
        self.store
            .route_state(RouteKey::from(&identity))
            .await
            .unwrap()
            .last_sequence_seen
            .map(Sequence::value)
    }

    /// Drain every pending inbound packet through an empty run.
    async fn consume_all(&self, run_id: &str) {
        let pending = self.store.pending_inbound(RunScope::All).await.unwrap();
        assert!(
            self.store
                .begin_run(run_id.to_string(), RunScope::All, "test".to_string(), Utc::now())
                .await
                .unwrap()
        );
        self.store
            .complete_run(
                RunCommit {
                    run_id: run_id.to_string(),
                    consumed: pending.iter().map(|p| p.record.id).collect(),
                    produced: Vec::new(),
                    relays: Vec::new(),
                    artifacts: Vec::new(),
                    nodelists: Vec::new(),
                    logs: String::new(),
                    completed_at: Utc::now(),
                },
                GapPolicy::default(),
            )
            .await
            .unwrap();
    }

    /// Place a packet in the outbox as a processing run would.
    async fn deposit(&self, name: &str, payload: &[u8]) -> Ingested {
        self.store
            .ingest(
                NewPacket {
                    identity: parse(name).unwrap(),
                    direction: Direction::Outbound,
                    payload: payload.to_vec(),
                    uploaded_by: "hub".to_string(),
                    uploaded_at: Utc::now(),
                    produced_by_run: None,
                },
                GapPolicy::default(),
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn in_order_uploads_raise_no_alert() {
    let hub = hub();
    for seq in [0, 1, 2] {
        hub.upload_seq("0201", seq).await.unwrap();
    }
    assert_eq!(hub.open_alerts().await, Vec::<(u16, u16)>::new());
    assert_eq!(hub.last_seen("0201").await, Some(2));
}

#[tokio::test]
async fn forward_gap_raises_one_alert_and_advances() {
    let hub = hub();
    let mut events = hub.notifier.subscribe();
    for seq in [0, 1, 2, 8] {
        hub.upload_seq("0201", seq).await.unwrap();
    }
    assert_eq!(hub.open_alerts().await, vec![(3, 8)]);
    assert_eq!(hub.last_seen("0201").await, Some(8));

    let mut alert_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, HubEvent::AlertCreated { .. }) {
            alert_events += 1;
        }
    }
    assert_eq!(alert_events, 1);
}

#[tokio::test]
async fn wraparound_is_continuous() {
    let hub = hub();
    for seq in [997, 998, 999, 0] {
        hub.upload_seq("0201", seq).await.unwrap();
    }
    assert_eq!(hub.open_alerts().await, Vec::<(u16, u16)>::new());
    assert_eq!(hub.last_seen("0201").await, Some(0));

    for seq in [997, 998, 999, 5] {
        hub.upload_seq("0203", seq).await.unwrap();
    }
    assert_eq!(hub.open_alerts().await, vec![(0, 5)]);
}

#[tokio::test]
async fn late_packet_inside_window_is_accepted_quietly() {
    let hub = hub();
    for seq in [0, 1, 3] {
        hub.upload_seq("0201", seq).await.unwrap();
    }
    let receipt = hub
        .mailbox
        .upload(&hub.outpost(), "555B", "555B0201.002", b"late".to_vec())
        .await
        .unwrap();
    assert!(receipt.late);
    assert_eq!(receipt.alert, None);
    assert_eq!(hub.open_alerts().await, vec![(2, 3)]);
    assert_eq!(hub.last_seen("0201").await, Some(3));
}

#[tokio::test]
async fn duplicate_upload_changes_nothing() {
    let hub = hub();
    hub.upload_seq("0201", 0).await.unwrap();
    hub.upload_seq("0201", 1).await.unwrap();

    let err = hub.upload_seq("0201", 1).await.unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert!(matches!(err, TransferError::DuplicatePacket { .. }));
    assert_eq!(hub.last_seen("0201").await, Some(1));
    assert_eq!(hub.open_alerts().await, Vec::<(u16, u16)>::new());
}

#[tokio::test]
async fn consumed_packets_cannot_be_uploaded_again() {
    let hub = hub();
    for seq in 1..=150 {
        hub.upload_seq("0201", seq).await.unwrap();
    }
    hub.consume_all("run-1").await;
    assert_eq!(hub.store.stats().await.unwrap().pending_inbound, 0);

    for seq in [149, 1] {
        let err = hub.upload_seq("0201", seq).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::DuplicatePacket {
                reason: DuplicateReason::Seen,
                ..
            }
        ));
    }
    assert_eq!(hub.last_seen("0201").await, Some(150));
    assert_eq!(hub.store.stats().await.unwrap().pending_inbound, 0);

    hub.upload_seq("0201", 151).await.unwrap();
    assert_eq!(hub.open_alerts().await, Vec::<(u16, u16)>::new());
}

#[tokio::test]
async fn delivered_packets_are_not_queued_twice() {
    let hub = hub();
    hub.deposit("555B0103.000", b"turn").await;
    hub.deposit("555B0103.001", b"next turn").await;
    hub.mailbox
        .download(&hub.starport(), "555B", "555B0103.000")
        .await
        .unwrap();

    assert_eq!(
        hub.deposit("555B0103.000", b"turn").await,
        Ingested::Duplicate(DuplicateReason::Seen)
    );
    let unread = hub
        .mailbox
        .list_pending(&hub.starport(), "555B", true)
        .await
        .unwrap();
    assert_eq!(unread.len(), 1);
}

#[tokio::test]
async fn uploads_are_validated_before_storage() {
    let hub = hub();
    let outpost = hub.outpost();

    let err = hub
        .mailbox
        .upload(&outpost, "555F", "555B0201.000", b"x".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 422);

    let err = hub
        .mailbox
        .upload(&outpost, "555B", "555B0201.000", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::EmptyPayload));

    let err = hub
        .mailbox
        .upload(&outpost, "555B", "BRNODES.555", b"x".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 422);

    // outpost holds index 02 and may not speak for 03.
    let err = hub
        .mailbox
        .upload(&outpost, "555B", "555B0301.000", b"x".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 403);

    assert!(matches!(
        hub.mailbox.authenticate("bogus"),
        Err(TransferError::Unauthenticated(_))
    ));
    assert_eq!(hub.store.stats().await.unwrap().pending_inbound, 0);
}

#[tokio::test]
async fn download_is_idempotent_and_restricted_to_destination() {
    let hub = hub();
    hub.deposit("555B0103.001", b"turn for starport").await;
    hub.deposit("555B0103.000", b"earlier turn").await;

    let starport = hub.starport();
    let listed: Vec<String> = hub
        .mailbox
        .list_pending(&starport, "555B", true)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.filename)
        .collect();
    assert_eq!(listed, vec!["555B0103.001", "555B0103.000"]);

    let err = hub
        .mailbox
        .download(&hub.outpost(), "555B", "555B0103.001")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 403);

    let first = hub
        .mailbox
        .download(&starport, "555B", "555B0103.001")
        .await
        .unwrap();
    let second = hub
        .mailbox
        .download(&starport, "555B", "555B0103.001")
        .await
        .unwrap();
    assert_eq!(first.payload, b"turn for starport".to_vec());
    assert_eq!(second.payload, first.payload);
    assert!(first.packet.downloaded_at.is_some());
    assert_eq!(second.packet.downloaded_at, first.packet.downloaded_at);

    let unread = hub
        .mailbox
        .list_pending(&starport, "555B", true)
        .await
        .unwrap();
    assert_eq!(unread.len(), 1);

    let err = hub
        .mailbox
        .download(&starport, "555B", "555B0103.042")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn nodelist_falls_back_to_roster() {
    let hub = hub();
    let nodelist = hub.mailbox.nodelist(&hub.outpost(), "555B").await.unwrap();
    assert_eq!(nodelist.filename, "BRNODES.555");
    assert!(!nodelist.from_engine);
    let text = String::from_utf8(nodelist.content).unwrap();
    let indexes: Vec<&str> = text.split("\r\n").step_by(7).filter(|s| !s.is_empty()).collect();
    assert_eq!(indexes, vec!["01", "02", "03"]);

    let err = hub.mailbox.nodelist(&hub.outpost(), "555F").await.unwrap_err();
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn alerts_resolve_and_reopen() {
    let hub = hub();
    hub.upload_seq("0201", 0).await.unwrap();
    hub.upload_seq("0201", 4).await.unwrap();
    let alert = hub
        .store
        .list_alerts(AlertQuery::default())
        .await
        .unwrap()
        .remove(0);

    let resolved = hub
        .store
        .resolve_alert(alert.id, "sysop".to_string(), Some("resent".to_string()), Utc::now())
        .await
        .unwrap();
    assert!(matches!(resolved.status, AlertStatus::Resolved { ref resolved_by, .. } if resolved_by == "sysop"));
    assert_eq!(hub.open_alerts().await, Vec::<(u16, u16)>::new());
    let all = hub
        .store
        .list_alerts(AlertQuery {
            filter: AlertFilter::All,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    let again = hub
        .store
        .resolve_alert(alert.id, "sysop".to_string(), None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(again, AlertError::AlreadyResolved(_)));

    let reopened = hub
        .store
        .reopen_alert(alert.id, "sysop".to_string(), Utc::now())
        .await
        .unwrap();
    assert_eq!(reopened.status, AlertStatus::Open);
    assert_eq!(hub.open_alerts().await, vec![(1, 4)]);

    assert!(matches!(
        hub.store.get_alert(9_999).await,
        Err(AlertError::NotFound(9_999))
    ));
}
