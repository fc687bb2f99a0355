//! `nova-hub --ping`: ask a running hub how it is doing.
//!
//! Performs the `hello` handshake, then reads `service.status` and reduces
//! it to a one-line report for the sysop or a process supervisor.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;

use crate::PROTOCOL_VERSION;
use crate::protocol::HelloParams;
use crate::protocol::HelloResult;
use crate::protocol::JsonRpcRequest;
use crate::protocol::RequestId;
use crate::protocol::ServiceStatusResult;

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub service_version: String,
    pub status: ServiceStatusResult,
}

impl HealthReport {
    /// Open alerts mean packets went missing on some route.
    pub fn is_degraded(&self) -> bool {
        self.status.stats.open_alerts > 0
    }

    pub fn summary(&self) -> String {
        let stats = &self.status.stats;
        let run = match &self.status.active_run {
            Some(run_id) => format!("run {run_id} active"),
            None => "idle".to_string(),
        };
        format!(
            "nova-hub {} up {}s, {run}: {} inbound pending, {} outbound undelivered, {} open alert(s)",
            self.service_version,
            self.status.uptime_s,
            stats.pending_inbound,
            stats.pending_outbound,
            stats.open_alerts,
        )
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: i64,
}

impl Client {
    async fn call<T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> io::Result<T> {
        self.next_id += 1;
        let request = JsonRpcRequest {
            id: RequestId::Integer(self.next_id),
            method: method.to_string(),
            params,
        };
        let mut bytes = serde_json::to_vec(&request).map_err(io::Error::other)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("hub closed the connection during {method}"),
            ));
        }
        let mut response: serde_json::Value = serde_json::from_str(line.trim())
            .map_err(|e| io::Error::other(format!("{method}: invalid response: {e}")))?;
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            return Err(io::Error::other(format!("{method} rejected: {message}")));
        }
        serde_json::from_value(response["result"].take())
            .map_err(|e| io::Error::other(format!("{method}: unexpected result: {e}")))
    }
}

/// Connect to the hub at `path` and collect its status.
pub async fn check(path: &Path, timeout: Duration) -> io::Result<HealthReport> {
    tokio::time::timeout(timeout, check_inner(path))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no answer from {} within {}s", path.display(), timeout.as_secs()),
            )
        })?
}

async fn check_inner(path: &Path) -> io::Result<HealthReport> {
    let stream = UnixStream::connect(path).await.map_err(|e| {
        io::Error::new(e.kind(), format!("cannot connect to {}: {e}", path.display()))
    })?;
    let (reader, writer) = stream.into_split();
    let mut client = Client {
        reader: BufReader::new(reader),
        writer,
        next_id: 0,
    };

    let hello = HelloParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        client_version: format!("ping/{}", env!("CARGO_PKG_VERSION")),
    };
    let hello: HelloResult = client
        .call("hello", Some(serde_json::to_value(hello).map_err(io::Error::other)?))
        .await?;
    let status: ServiceStatusResult = client.call("service.status", None).await?;
    Ok(HealthReport {
        service_version: hello.service_version,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nova_hub_core::HubConfig;
    use nova_hub_core::HubStore;
    use nova_hub_core::engine::ProcessEngine;
    use pretty_assertions::assert_eq;

    use crate::ipc;
    use crate::service::HubService;

    #[tokio::test]
    async fn reports_status_of_a_running_hub() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HubConfig::default();
        config.server.data_dir = dir.path().to_path_buf();
        let store = HubStore::open(&config.database_path(), 2).unwrap();
        let service = Arc::new(HubService::new(
            &config,
            store,
            Arc::new(ProcessEngine::new("true", Vec::new())),
        ));
        let socket = config.socket_path();
        let listener = ipc::bind(&socket).unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(ipc::serve(service, listener, shutdown_rx));

        let report = check(&socket, DEFAULT_PING_TIMEOUT).await.unwrap();
        assert_eq!(report.service_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(report.status.active_run, None);
        assert!(!report.is_degraded());
        assert!(report.summary().contains("idle: 0 inbound pending"));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = check(&dir.path().join("absent.sock"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("cannot connect"));
    }
}
