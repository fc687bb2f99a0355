//! Unix domain socket IPC listener.
//!
//! Reads newline-delimited JSON-RPC-lite requests, dispatches them to the
//! hub, and writes one response line per request. A connection that calls
//! `events.subscribe` also receives pushed `event` notifications.

use std::io;
use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use nova_hub_core::AlertError;
use nova_hub_core::ProcessingError;
use nova_hub_core::TransferError;
use nova_hub_core::alerts::AlertQuery;
use nova_hub_core::alerts::DEFAULT_ALERT_LIMIT;
use nova_hub_core::authz::ClientIdentity;
use nova_hub_core::processing::RunScope;
use nova_hub_core::processing::RunStatus;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::PROTOCOL_VERSION;
use crate::protocol::*;
use crate::service::DEFAULT_ACTOR;
use crate::service::HubService;

type RpcError = (i64, String);
type RpcResult = Result<serde_json::Value, RpcError>;

const OUTBOUND_QUEUE: usize = 64;

const CAPABILITIES: &[&str] = &[
    "packet.upload",
    "packet.list",
    "packet.download",
    "nodelist.get",
    "processing.trigger",
    "processing.cancel",
    "processing.get",
    "processing.list",
    "alert.list",
    "alert.get",
    "alert.resolve",
    "alert.unresolve",
    "events.subscribe",
    "service.status",
];

/// Bind the listener, replacing a stale socket file left by an earlier run.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("hub service listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until `shutdown` flips to true.
pub async fn serve(
    service: Arc<HubService>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        service.inc_connections();
                        if let Err(e) = handle_connection(&service, stream).await {
                            tracing::warn!("connection error: {e}");
                        }
                        service.dec_connections();
                    });
                }
                Err(e) => tracing::error!("accept error: {e}"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(service: &Arc<HubService>, stream: UnixStream) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Responses and pushed events share one ordered writer.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }
        Ok::<(), io::Error>(())
    });

    let mut subscription = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let dispatched = dispatch_message(service, trimmed).await;
        if tx.send(encode_line(&dispatched.response)).await.is_err() {
            break;
        }
        if dispatched.subscribe && subscription.is_none() {
            subscription = Some(tokio::spawn(forward_events(
                service.events().subscribe(),
                tx.clone(),
            )));
        }
    }

    if let Some(task) = subscription {
        task.abort();
    }
    drop(tx);
    writer_task
        .await
        .map_err(|e| io::Error::other(format!("writer task failed: {e}")))?
}

async fn forward_events(
    mut events: broadcast::Receiver<nova_hub_core::HubEvent>,
    tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(params) = serde_json::to_value(&event) else {
                    continue;
                };
                if tx
                    .send(encode_notification(EVENT_METHOD, params))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn encode_line<T: Serialize>(value: &T) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    bytes.push(b'\n');
    bytes
}

/// Encode a notification (no id, no response expected).
pub fn encode_notification(method: &str, params: serde_json::Value) -> Vec<u8> {
    encode_line(&JsonRpcNotification {
        method: method.to_string(),
        params: Some(params),
    })
}

pub struct Dispatched {
    pub response: serde_json::Value,
    /// The request asked for event notifications on this connection.
    pub subscribe: bool,
}

/// Parse and dispatch a single JSON-RPC message.
pub async fn dispatch_message(service: &HubService, raw: &str) -> Dispatched {
    let request: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            return Dispatched {
                response: error_value(
                    RequestId::Integer(0),
                    (ERR_INVALID_REQUEST, format!("invalid JSON-RPC: {e}")),
                ),
                subscribe: false,
            };
        }
    };

    tracing::debug!(method = %request.method, "ipc request");
    let subscribe = request.method == "events.subscribe";
    let id = request.id.clone();
    let response = match dispatch_method(service, &request.method, request.params).await {
        Ok(result) => serde_json::to_value(JsonRpcResponse { id, result }).unwrap_or_default(),
        Err(err) => error_value(id, err),
    };
    Dispatched {
        subscribe: subscribe && response.get("result").is_some(),
        response,
    }
}

fn error_value(id: RequestId, (code, message): RpcError) -> serde_json::Value {
    serde_json::to_value(JsonRpcError {
        id,
        error: JsonRpcErrorBody {
            code,
            message,
            data: None,
        },
    })
    .unwrap_or_default()
}

async fn dispatch_method(
    service: &HubService,
    method: &str,
    params: Option<serde_json::Value>,
) -> RpcResult {
    match method {
        "hello" => handle_hello(params),
        "packet.upload" => handle_packet_upload(service, params).await,
        "packet.list" => handle_packet_list(service, params).await,
        "packet.download" => handle_packet_download(service, params).await,
        "nodelist.get" => handle_nodelist(service, params).await,
        "processing.trigger" => handle_processing_trigger(service, params).await,
        "processing.cancel" => handle_processing_cancel(service, params).await,
        "processing.get" => handle_processing_get(service, params).await,
        "processing.list" => handle_processing_list(service, params).await,
        "alert.list" => handle_alert_list(service, params).await,
        "alert.get" => handle_alert_get(service, params).await,
        "alert.resolve" => handle_alert_resolve(service, params).await,
        "alert.unresolve" => handle_alert_unresolve(service, params).await,
        "events.subscribe" => to_result(serde_json::json!({ "subscribed": true })),
        "service.status" => handle_service_status(service).await,
        _ => Err((ERR_METHOD_NOT_FOUND, format!("unknown method: {method}"))),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<serde_json::Value>, method: &str) -> Result<T, RpcError> {
    let value = params.ok_or_else(|| (ERR_INVALID_PARAMS, "missing params".to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| (ERR_INVALID_PARAMS, format!("invalid {method} params: {e}")))
}

/// Like [`parse_params`] but treats absent params as all defaults.
fn parse_optional_params<T: DeserializeOwned>(
    params: Option<serde_json::Value>,
    method: &str,
) -> Result<T, RpcError> {
    parse_params(Some(params.unwrap_or_else(|| serde_json::json!({}))), method)
}

fn to_result<T: Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| (ERR_INTERNAL, format!("serialize error: {e}")))
}

fn transfer_error(err: TransferError) -> RpcError {
    if matches!(err, TransferError::Storage(_)) {
        tracing::error!("packet transfer failed: {err}");
    }
    (i64::from(err.status_code()), err.to_string())
}

fn processing_error(err: ProcessingError) -> RpcError {
    (i64::from(err.status_code()), err.to_string())
}

fn alert_error(err: AlertError) -> RpcError {
    (i64::from(err.status_code()), err.to_string())
}

fn storage_error(err: impl std::fmt::Display) -> RpcError {
    tracing::error!("storage error: {err}");
    (ERR_INTERNAL, format!("storage error: {err}"))
}

fn authenticate(service: &HubService, token: &str) -> Result<ClientIdentity, RpcError> {
    service.mailbox().authenticate(token).map_err(transfer_error)
}

fn handle_hello(params: Option<serde_json::Value>) -> RpcResult {
    let hello: HelloParams = parse_params(params, "hello")?;
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err((
            ERR_INVALID_PARAMS,
            format!(
                "incompatible protocol version: client={}, service={}",
                hello.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }
    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: CAPABILITIES.iter().map(|c| (*c).to_string()).collect(),
    })
}

async fn handle_packet_upload(service: &HubService, params: Option<serde_json::Value>) -> RpcResult {
    let params: PacketUploadParams = parse_params(params, "packet.upload")?;
    let client = authenticate(service, &params.token)?;
    let payload = BASE64
        .decode(params.data.as_bytes())
        .map_err(|e| (ERR_UNPROCESSABLE, format!("packet data is not base64: {e}")))?;
    let receipt = service
        .mailbox()
        .upload(&client, &params.league, &params.filename, payload)
        .await
        .map_err(transfer_error)?;
    to_result(receipt)
}

async fn handle_packet_list(service: &HubService, params: Option<serde_json::Value>) -> RpcResult {
    let params: PacketListParams = parse_params(params, "packet.list")?;
    let client = authenticate(service, &params.token)?;
    let packets = service
        .mailbox()
        .list_pending(&client, &params.league, params.unread_only)
        .await
        .map_err(transfer_error)?;
    to_result(PacketListResult { packets })
}

async fn handle_packet_download(
    service: &HubService,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: PacketDownloadParams = parse_params(params, "packet.download")?;
    let client = authenticate(service, &params.token)?;
    let download = service
        .mailbox()
        .download(&client, &params.league, &params.filename)
        .await
        .map_err(transfer_error)?;
    to_result(PacketDownloadResult {
        packet: download.packet,
        data: BASE64.encode(&download.payload),
    })
}

async fn handle_nodelist(service: &HubService, params: Option<serde_json::Value>) -> RpcResult {
    let params: NodelistParams = parse_params(params, "nodelist.get")?;
    let client = authenticate(service, &params.token)?;
    let nodelist = service
        .mailbox()
        .nodelist(&client, &params.league)
        .await
        .map_err(transfer_error)?;
    to_result(NodelistResult {
        filename: nodelist.filename,
        data: BASE64.encode(&nodelist.content),
        generated: !nodelist.from_engine,
    })
}

async fn handle_processing_trigger(
    service: &HubService,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: ProcessingTriggerParams = parse_optional_params(params, "processing.trigger")?;
    let scope: RunScope = params
        .scope
        .parse()
        .map_err(|e| (ERR_UNPROCESSABLE, format!("invalid scope: {e}")))?;
    let actor = params.actor.as_deref().unwrap_or(DEFAULT_ACTOR);
    let handle = service
        .orchestrator()
        .trigger(scope, actor)
        .await
        .map_err(processing_error)?;
    to_result(ProcessingTriggerResult {
        run_id: handle.run_id,
        status: RunStatus::Running,
    })
}

async fn handle_processing_cancel(
    service: &HubService,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: RunIdParams = parse_params(params, "processing.cancel")?;
    service
        .orchestrator()
        .cancel(&params.run_id)
        .await
        .map_err(processing_error)?;
    to_result(serde_json::json!({
        "run_id": params.run_id,
        "cancel_requested": true,
    }))
}

async fn handle_processing_get(
    service: &HubService,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: RunIdParams = parse_params(params, "processing.get")?;
    let run = service
        .orchestrator()
        .get_run(&params.run_id)
        .await
        .map_err(processing_error)?;
    to_result(run)
}

async fn handle_processing_list(
    service: &HubService,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: ProcessingListParams = parse_optional_params(params, "processing.list")?;
    let runs = service
        .orchestrator()
        .list_runs(params.limit)
        .await
        .map_err(processing_error)?;
    to_result(ProcessingListResult { runs })
}

async fn handle_alert_list(service: &HubService, params: Option<serde_json::Value>) -> RpcResult {
    let params: AlertListParams = parse_optional_params(params, "alert.list")?;
    let alerts = service
        .store()
        .list_alerts(AlertQuery {
            filter: params.filter,
            limit: params.limit.unwrap_or(DEFAULT_ALERT_LIMIT),
        })
        .await
        .map_err(storage_error)?;
    to_result(AlertListResult { alerts })
}

async fn handle_alert_get(service: &HubService, params: Option<serde_json::Value>) -> RpcResult {
    let params: AlertIdParams = parse_params(params, "alert.get")?;
    let alert = service
        .store()
        .get_alert(params.id)
        .await
        .map_err(alert_error)?;
    to_result(alert)
}

async fn handle_alert_resolve(
    service: &HubService,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: AlertResolveParams = parse_params(params, "alert.resolve")?;
    let actor = params.actor.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
    let alert = service
        .store()
        .resolve_alert(params.id, actor, params.notes, chrono::Utc::now())
        .await
        .map_err(alert_error)?;
    tracing::info!(alert_id = alert.id, "alert resolved");
    to_result(alert)
}

async fn handle_alert_unresolve(
    service: &HubService,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: AlertIdParams = parse_params(params, "alert.unresolve")?;
    let actor = params.actor.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
    let alert = service
        .store()
        .reopen_alert(params.id, actor, chrono::Utc::now())
        .await
        .map_err(alert_error)?;
    tracing::info!(alert_id = alert.id, "alert reopened");
    to_result(alert)
}

async fn handle_service_status(service: &HubService) -> RpcResult {
    let stats = service.store().stats().await.map_err(storage_error)?;
    to_result(ServiceStatusResult {
        uptime_s: service.uptime_s(),
        connections: service.connection_count(),
        active_run: service.orchestrator().active_run(),
        leagues: service
            .orchestrator()
            .leagues()
            .map(ToString::to_string)
            .collect(),
        stats,
    })
}
