//! Member-facing packet exchange: upload, pending listing, download and
//! nodelist retrieval.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::alerts::SequenceAlert;
use crate::authz::AuthError;
use crate::authz::Authorizer;
use crate::authz::ClientIdentity;
use crate::authz::LeagueMember;
use crate::db::DbError;
use crate::ledger::GapPolicy;
use crate::ledger::Observation;
use crate::ledger::RouteKey;
use crate::ledger::RouteLocks;
use crate::notify::HubEvent;
use crate::notify::Notifier;
use crate::packet;
use crate::packet::BbsIndex;
use crate::packet::LeagueId;
use crate::packet::PacketNameError;
use crate::store::Direction;
use crate::store::DuplicateReason;
use crate::store::HubStore;
use crate::store::Ingested;
use crate::store::NewPacket;
use crate::store::PacketRecord;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    InvalidName(#[from] PacketNameError),

    #[error("packet payload is empty")]
    EmptyPayload,

    #[error("nodelist {0} is generated by the hub and cannot be uploaded")]
    NodelistUpload(String),

    #[error(transparent)]
    Unauthenticated(#[from] AuthError),

    #[error("client {client} may not send as {sender} in league {league}")]
    Unauthorized {
        client: String,
        league: LeagueId,
        sender: BbsIndex,
    },

    #[error("client {client} is not a member of league {league}")]
    NotMember { client: String, league: LeagueId },

    #[error("packet {filename} is not addressed to client {client}")]
    Forbidden { client: String, filename: String },

    #[error("duplicate packet {filename}")]
    DuplicatePacket {
        filename: String,
        reason: DuplicateReason,
    },

    #[error("packet {0} not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl TransferError {
    /// HTTP-equivalent status for the rejection.
    pub fn status_code(&self) -> u16 {
        match self {
            TransferError::InvalidName(_)
            | TransferError::EmptyPayload
            | TransferError::NodelistUpload(_) => 422,
            TransferError::Unauthenticated(_) => 401,
            TransferError::Unauthorized { .. }
            | TransferError::NotMember { .. }
            | TransferError::Forbidden { .. } => 403,
            TransferError::DuplicatePacket { .. } => 409,
            TransferError::NotFound(_) => 404,
            TransferError::Storage(_) => 500,
        }
    }
}

/// Metadata returned to clients for a stored packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSummary {
    pub filename: String,
    pub league: LeagueId,
    pub source: BbsIndex,
    pub dest: BbsIndex,
    pub sequence: u16,
    pub size_bytes: u64,
    pub checksum: String,
    pub uploaded_at: chrono::DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<chrono::DateTime<Utc>>,
}

impl From<&PacketRecord> for PacketSummary {
    fn from(record: &PacketRecord) -> Self {
        Self {
            filename: record.filename.clone(),
            league: record.identity.league,
            source: record.identity.source,
            dest: record.identity.dest,
            sequence: record.identity.sequence.value(),
            size_bytes: record.size_bytes,
            checksum: record.checksum.clone(),
            uploaded_at: record.uploaded_at,
            downloaded_at: record.downloaded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub packet: PacketSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<SequenceAlert>,
    /// True when the packet arrived behind a newer one on its route.
    #[serde(default)]
    pub late: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub packet: PacketSummary,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodelistFile {
    pub filename: String,
    pub content: Vec<u8>,
    /// False when built from the roster because the engine has not yet
    /// written one.
    pub from_engine: bool,
}

pub struct Mailbox {
    store: HubStore,
    authz: Arc<dyn Authorizer>,
    notifier: Arc<dyn Notifier>,
    locks: Arc<RouteLocks>,
    policy: GapPolicy,
}

impl Mailbox {
    pub fn new(
        store: HubStore,
        authz: Arc<dyn Authorizer>,
        notifier: Arc<dyn Notifier>,
        locks: Arc<RouteLocks>,
        policy: GapPolicy,
    ) -> Self {
        Self {
            store,
            authz,
            notifier,
            locks,
            policy,
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<ClientIdentity, TransferError> {
        Ok(self.authz.verify_client_token(token)?)
    }

    fn member_index(
        &self,
        client: &ClientIdentity,
        league: &LeagueId,
    ) -> Result<BbsIndex, TransferError> {
        self.authz
            .registered_index(client, league)
            .ok_or_else(|| TransferError::NotMember {
                client: client.client_id.clone(),
                league: *league,
            })
    }

    /// Accept a packet from a member. `league_token` is the league named by
    /// the request path and must agree with the filename.
    pub async fn upload(
        &self,
        client: &ClientIdentity,
        league_token: &str,
        filename: &str,
        payload: Vec<u8>,
    ) -> Result<UploadReceipt, TransferError> {
        if packet::parse_nodelist_filename(filename).is_some() {
            return Err(TransferError::NodelistUpload(filename.to_string()));
        }
        let identity = packet::parse(filename)?;
        identity.league.ensure_matches(league_token)?;
        if payload.is_empty() {
            return Err(TransferError::EmptyPayload);
        }
        if !self
            .authz
            .may_send_as(client, &identity.league, identity.source)
        {
            return Err(TransferError::Unauthorized {
                client: client.client_id.clone(),
                league: identity.league,
                sender: identity.source,
            });
        }

        let route = RouteKey::from(&identity);
        let ingested = {
            let _route_guard = self.locks.lock(route).await;
            self.store
                .ingest(
                    NewPacket {
                        identity,
                        direction: Direction::Inbound,
                        payload,
                        uploaded_by: client.client_id.clone(),
                        uploaded_at: Utc::now(),
                        produced_by_run: None,
                    },
                    self.policy,
                )
                .await?
        };

        let accepted = match ingested {
            Ingested::Accepted(accepted) => accepted,
            Ingested::Duplicate(reason) => {
                tracing::info!(
                    client = %client.client_id,
                    filename = %identity,
                    ?reason,
                    "duplicate packet rejected"
                );
                return Err(TransferError::DuplicatePacket {
                    filename: identity.filename(),
                    reason,
                });
            }
        };

        tracing::info!(
            client = %client.client_id,
            filename = %accepted.packet.filename,
            size = accepted.packet.size_bytes,
            "packet received"
        );
        self.notifier.publish(HubEvent::PacketReceived {
            league: identity.league,
            filename: accepted.packet.filename.clone(),
            source: identity.source,
            dest: identity.dest,
            sequence: identity.sequence,
        });
        if let Some(alert) = &accepted.alert {
            self.notifier.publish(alert_event(alert));
        }

        Ok(UploadReceipt {
            packet: PacketSummary::from(&accepted.packet),
            late: matches!(accepted.observation, Observation::Late { .. }),
            alert: accepted.alert,
        })
    }

    /// Packets waiting for the caller in `league`, ordered by route and
    /// then by sequence around the ring.
    pub async fn list_pending(
        &self,
        client: &ClientIdentity,
        league_token: &str,
        unread_only: bool,
    ) -> Result<Vec<PacketSummary>, TransferError> {
        let league: LeagueId = league_token.parse()?;
        let dest = self.member_index(client, &league)?;
        let records = self.store.list_outbound(league, dest, unread_only).await?;
        Ok(ring_order(records).iter().map(PacketSummary::from).collect())
    }

    pub async fn download(
        &self,
        client: &ClientIdentity,
        league_token: &str,
        filename: &str,
    ) -> Result<Download, TransferError> {
        let identity = packet::parse(filename)?;
        identity.league.ensure_matches(league_token)?;
        if !self
            .authz
            .verify_destination_access(client, &identity.league, identity.dest)
        {
            return Err(TransferError::Forbidden {
                client: client.client_id.clone(),
                filename: identity.filename(),
            });
        }

        let (record, payload) = self
            .store
            .deliver(identity, Utc::now())
            .await?
            .ok_or_else(|| TransferError::NotFound(identity.filename()))?;
        tracing::debug!(client = %client.client_id, filename = %record.filename, "packet delivered");
        Ok(Download {
            packet: PacketSummary::from(&record),
            payload,
        })
    }

    pub async fn nodelist(
        &self,
        client: &ClientIdentity,
        league_token: &str,
    ) -> Result<NodelistFile, TransferError> {
        let league: LeagueId = league_token.parse()?;
        self.member_index(client, &league)?;
        if let Some(stored) = self.store.nodelist(league).await? {
            return Ok(NodelistFile {
                filename: stored.filename,
                content: stored.content,
                from_engine: true,
            });
        }
        Ok(NodelistFile {
            filename: league.nodelist_filename(),
            content: render_roster(&self.authz.league_members(&league)).into_bytes(),
            from_engine: false,
        })
    }
}

pub(crate) fn alert_event(alert: &SequenceAlert) -> HubEvent {
    HubEvent::AlertCreated {
        alert_id: alert.id,
        league: alert.route.league,
        source: alert.route.source,
        dest: alert.route.dest,
        expected_sequence: alert.expected_sequence,
        received_sequence: alert.received_sequence,
    }
}

/// Sort by route, then by ring distance from the route's oldest listed
/// packet so 998, 999, 000 stay in delivery order. Ties go to the earlier
/// upload.
fn ring_order(mut records: Vec<PacketRecord>) -> Vec<PacketRecord> {
    let mut origins: HashMap<RouteKey, &PacketRecord> = HashMap::new();
    for record in &records {
        let route = RouteKey::from(&record.identity);
        origins
            .entry(route)
            .and_modify(|oldest| {
                if (record.uploaded_at, record.id) < (oldest.uploaded_at, oldest.id) {
                    *oldest = record;
                }
            })
            .or_insert(record);
    }
    let origins: HashMap<RouteKey, packet::Sequence> = origins
        .into_iter()
        .map(|(route, record)| (route, record.identity.sequence))
        .collect();

    records.sort_by_key(|record| {
        let route = RouteKey::from(&record.identity);
        let offset = origins
            .get(&route)
            .map_or(0, |origin| origin.steps_to(record.identity.sequence));
        (route, offset, record.uploaded_at, record.id)
    });
    records
}

/// Six-line `nodes.dat` records (index, name, fidonet, city, state,
/// country) separated by blank lines, CRLF terminated for DOS doors.
pub fn render_roster(members: &[LeagueMember]) -> String {
    let mut out = String::new();
    for member in members {
        let location = &member.location;
        for field in [
            member.bbs_index.to_string().as_str(),
            member.name.as_str(),
            location.fidonet.as_deref().unwrap_or(""),
            location.city.as_deref().unwrap_or(""),
            location.state.as_deref().unwrap_or(""),
            location.country.as_deref().unwrap_or(""),
        ] {
            out.push_str(field);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
    }
    out
}
