//! Client authentication and league membership checks.
//!
//! Token issuance lives outside the hub. The hub only needs to turn a
//! bearer token into a client identity and answer which BBS index that
//! client holds in a league.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::config::ClientConfig;
use crate::config::HubConfig;
use crate::config::NodeLocation;
use crate::packet::BbsIndex;
use crate::packet::LeagueId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub client_id: String,
    pub name: String,
}

/// One seat in a league, as published in the nodelist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueMember {
    pub bbs_index: BbsIndex,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub location: NodeLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing client token")]
    MissingToken,

    #[error("invalid client token")]
    InvalidToken,
}

pub trait Authorizer: Send + Sync {
    fn verify_client_token(&self, token: &str) -> Result<ClientIdentity, AuthError>;

    /// The index `client` holds in `league`, if it is a member.
    fn registered_index(&self, client: &ClientIdentity, league: &LeagueId) -> Option<BbsIndex>;

    /// Whether `client` may collect packets addressed to `index`.
    fn verify_destination_access(
        &self,
        client: &ClientIdentity,
        league: &LeagueId,
        index: BbsIndex,
    ) -> bool {
        self.registered_index(client, league) == Some(index)
    }

    /// Whether `client` may upload packets sent from `source`.
    fn may_send_as(&self, client: &ClientIdentity, league: &LeagueId, source: BbsIndex) -> bool {
        self.registered_index(client, league) == Some(source)
    }

    /// Hub first, then members by index.
    fn league_members(&self, league: &LeagueId) -> Vec<LeagueMember>;
}

/// Roster loaded from configuration. Tokens are matched by SHA-256 digest;
/// plaintext tokens are never stored.
#[derive(Debug, Clone)]
pub struct StaticAuthorizer {
    hub: LeagueMember,
    clients: Vec<ClientConfig>,
    by_digest: HashMap<String, usize>,
}

impl StaticAuthorizer {
    pub fn from_config(config: &HubConfig) -> Self {
        let hub = LeagueMember {
            bbs_index: config.hub.bbs_index,
            name: config.hub.bbs_name.clone(),
            client_id: None,
            location: config.hub.location.clone(),
        };
        let clients = config.clients.clone();
        let by_digest = clients
            .iter()
            .enumerate()
            .map(|(i, client)| (client.token_sha256.to_ascii_lowercase(), i))
            .collect();
        Self {
            hub,
            clients,
            by_digest,
        }
    }

    /// Hex SHA-256 of a bearer token, the form stored in `token_sha256`.
    pub fn token_digest(token: &str) -> String {
        format!("{:x}", Sha256::digest(token.as_bytes()))
    }

    fn client(&self, identity: &ClientIdentity) -> Option<&ClientConfig> {
        self.clients.iter().find(|c| c.id == identity.client_id)
    }
}

impl Authorizer for StaticAuthorizer {
    fn verify_client_token(&self, token: &str) -> Result<ClientIdentity, AuthError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let index = self
            .by_digest
            .get(&Self::token_digest(token))
            .ok_or(AuthError::InvalidToken)?;
        let client = &self.clients[*index];
        Ok(ClientIdentity {
            client_id: client.id.clone(),
            name: client.name.clone(),
        })
    }

    fn registered_index(&self, client: &ClientIdentity, league: &LeagueId) -> Option<BbsIndex> {
        self.client(client)?
            .memberships
            .iter()
            .find(|m| m.league == *league)
            .map(|m| m.bbs_index)
    }

    fn league_members(&self, league: &LeagueId) -> Vec<LeagueMember> {
        let mut members: Vec<LeagueMember> = self
            .clients
            .iter()
            .filter_map(|client| {
                let seat = client.memberships.iter().find(|m| m.league == *league)?;
                Some(LeagueMember {
                    bbs_index: seat.bbs_index,
                    name: client.name.clone(),
                    client_id: Some(client.id.clone()),
                    location: client.location.clone(),
                })
            })
            .collect();
        members.sort_by_key(|m| m.bbs_index);
        members.insert(0, self.hub.clone());
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MembershipConfig;
    use pretty_assertions::assert_eq;

    fn authorizer() -> StaticAuthorizer {
        let league: LeagueId = "555B".parse().unwrap();
        let mut config = HubConfig::default();
        for (id, token, index) in [("starport", "s3cret", 0x03), ("outpost", "hunter2", 0x02)] {
            config.clients.push(ClientConfig {
                id: id.to_string(),
                name: format!("{id} BBS"),
                token_sha256: StaticAuthorizer::token_digest(token),
                memberships: vec![MembershipConfig {
                    league,
                    bbs_index: BbsIndex(index),
                }],
                location: NodeLocation::default(),
            });
        }
        StaticAuthorizer::from_config(&config)
    }

    #[test]
    fn digest_matches_known_vector() {
        assert_eq!(
            StaticAuthorizer::token_digest("test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn tokens_resolve_to_clients() {
        let authz = authorizer();
        let client = authz.verify_client_token("Bearer s3cret").unwrap();
        assert_eq!(client.client_id, "starport");
        assert_eq!(
            authz.verify_client_token("nope"),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(authz.verify_client_token("  "), Err(AuthError::MissingToken));
    }

    #[test]
    fn access_follows_membership() {
        let authz = authorizer();
        let league: LeagueId = "555B".parse().unwrap();
        let other: LeagueId = "555F".parse().unwrap();
        let client = authz.verify_client_token("s3cret").unwrap();

        assert!(authz.verify_destination_access(&client, &league, BbsIndex(3)));
        assert!(!authz.verify_destination_access(&client, &league, BbsIndex(2)));
        assert!(authz.may_send_as(&client, &league, BbsIndex(3)));
        assert_eq!(authz.registered_index(&client, &other), None);
    }

    #[test]
    fn members_list_hub_first() {
        let authz = authorizer();
        let members = authz.league_members(&"555B".parse().unwrap());
        let seats: Vec<u8> = members.iter().map(|m| m.bbs_index.0).collect();
        assert_eq!(seats, vec![1, 2, 3]);
        assert_eq!(members[0].client_id, None);
        assert_eq!(members[1].name, "outpost BBS");
    }
}
