//! Sequence alert lifecycle.
//!
//! Alerts are raised only by gap detection during ingestion. They move
//! between `Open` and `Resolved` through explicit administrative action and
//! are never expired or resolved automatically.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::ledger::RouteKey;
use crate::packet::Sequence;

pub const DEFAULT_ALERT_LIMIT: usize = 100;
pub const MAX_ALERT_LIMIT: usize = 500;

pub type AlertId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Resolved {
        resolved_at: DateTime<Utc>,
        resolved_by: String,
    },
}

impl AlertStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, AlertStatus::Resolved { .. })
    }

    pub fn kind(&self) -> AlertStatusKind {
        match self {
            AlertStatus::Open => AlertStatusKind::Open,
            AlertStatus::Resolved { .. } => AlertStatusKind::Resolved,
        }
    }
}

/// Stored form of [`AlertStatus`], without the resolution details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatusKind {
    Open,
    Resolved,
}

impl AlertStatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatusKind::Open => "open",
            AlertStatusKind::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for AlertStatusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AlertStatusKind::Open),
            "resolved" => Ok(AlertStatusKind::Resolved),
            other => Err(format!("unknown alert status {other:?}")),
        }
    }
}

/// Who last moved the alert between states, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertTransition {
    pub actor: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceAlert {
    pub id: AlertId,
    pub route: RouteKey,
    pub expected_sequence: Sequence,
    pub received_sequence: Sequence,
    /// Number of sequences skipped between expected and received.
    pub gap_size: u16,
    pub detected_at: DateTime<Utc>,
    pub status: AlertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<AlertTransition>,
}

/// Fields of an alert before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAlert {
    pub route: RouteKey,
    pub expected_sequence: Sequence,
    pub received_sequence: Sequence,
    pub gap_size: u16,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertFilter {
    #[default]
    Open,
    Resolved,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertQuery {
    #[serde(default)]
    pub filter: AlertFilter,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_ALERT_LIMIT
}

impl Default for AlertQuery {
    fn default() -> Self {
        Self {
            filter: AlertFilter::Open,
            limit: DEFAULT_ALERT_LIMIT,
        }
    }
}

impl AlertQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_ALERT_LIMIT)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(AlertId),

    #[error("alert {0} is already resolved")]
    AlreadyResolved(AlertId),

    #[error("alert {0} is not resolved")]
    NotResolved(AlertId),

    #[error("storage error: {0}")]
    Storage(#[from] crate::db::DbError),
}

impl AlertError {
    pub fn status_code(&self) -> u16 {
        match self {
            AlertError::NotFound(_) => 404,
            AlertError::AlreadyResolved(_) | AlertError::NotResolved(_) => 409,
            AlertError::Storage(_) => 500,
        }
    }
}
