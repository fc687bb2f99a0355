//! IPC protocol types for the hub service.
//!
//! JSON-RPC-lite: one JSON object per line. Requests carry an `id`;
//! notifications pushed by the service carry none. Domain errors use the
//! HTTP status of the rejection as `error.code`.

use nova_hub_core::alerts::AlertFilter;
use nova_hub_core::alerts::AlertId;
use nova_hub_core::alerts::SequenceAlert;
use nova_hub_core::mailbox::PacketSummary;
use nova_hub_core::processing::ProcessingRun;
use nova_hub_core::processing::RunId;
use nova_hub_core::processing::RunStatus;
use nova_hub_core::store::HubStats;
use serde::Deserialize;
use serde::Serialize;

// ─────────────────────────────────────────────────────────────────────────────
// Wire envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub id: RequestId,
    pub error: JsonRpcErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Hub errors, numbered after the matching HTTP status.
pub const ERR_UNAUTHENTICATED: i64 = 401;
pub const ERR_FORBIDDEN: i64 = 403;
pub const ERR_NOT_FOUND: i64 = 404;
pub const ERR_CONFLICT: i64 = 409;
pub const ERR_UNPROCESSABLE: i64 = 422;
pub const ERR_INTERNAL: i64 = 500;

/// Method name of pushed event notifications.
pub const EVENT_METHOD: &str = "event";

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// packet.* / nodelist.get (member methods, token required)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketUploadParams {
    pub token: String,
    pub league: String,
    pub filename: String,
    /// Packet bytes, base64 encoded.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketListParams {
    pub token: String,
    pub league: String,
    #[serde(default = "default_true")]
    pub unread_only: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketListResult {
    pub packets: Vec<PacketSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketDownloadParams {
    pub token: String,
    pub league: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketDownloadResult {
    pub packet: PacketSummary,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodelistParams {
    pub token: String,
    pub league: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodelistResult {
    pub filename: String,
    pub data: String,
    /// True when built from the roster rather than written by the engine.
    pub generated: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// processing.* (sysop methods)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTriggerParams {
    /// `all` or a league id such as `555B`.
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

fn default_scope() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTriggerResult {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdParams {
    pub run_id: RunId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingListResult {
    pub runs: Vec<ProcessingRun>,
}

// ─────────────────────────────────────────────────────────────────────────────
// alert.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertListParams {
    #[serde(default)]
    pub filter: AlertFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertListResult {
    pub alerts: Vec<SequenceAlert>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertIdParams {
    pub id: AlertId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertResolveParams {
    pub id: AlertId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// service.status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    pub uptime_s: u64,
    pub connections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_run: Option<RunId>,
    pub leagues: Vec<String>,
    pub stats: HubStats,
}
