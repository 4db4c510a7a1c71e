//! TCP control channel
//!
//! One JSON request per line, one JSON response per line. Requests are
//! tagged by `command`:
//!
//! ```text
//! {"command":"status"}
//! {"command":"inject_fault","target":{"target":"link","id":"R1-R2"}}
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use netsim_core::{DeviceId, FaultTarget};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    Pause,
    Resume,
    /// Bus counters
    Stats,
    Links,
    /// Event log entries from index `since`
    Events {
        #[serde(default)]
        since: usize,
    },
    /// One device, or every device when `device` is absent
    Snapshot {
        #[serde(default)]
        device: Option<DeviceId>,
    },
    InjectFault {
        target: FaultTarget,
    },
    Recover {
        target: FaultTarget,
    },
    Day2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn respond<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> ControlResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => ControlResponse::ok(data),
            Err(e) => ControlResponse::error(format!("serialization failed: {}", e)),
        },
        Err(e) => ControlResponse::error(e.to_string()),
    }
}

/// Execute one request against the coordinator
pub async fn handle_request(coordinator: &Coordinator, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Status => respond(coordinator.status()),
        ControlRequest::Pause => respond(coordinator.pause().map(|changed| serde_json::json!({ "changed": changed }))),
        ControlRequest::Resume => respond(coordinator.resume().map(|changed| serde_json::json!({ "changed": changed }))),
        ControlRequest::Stats => respond(coordinator.status().map(|s| s.bus)),
        ControlRequest::Links => respond(coordinator.link_snapshots()),
        ControlRequest::Events { since } => respond(coordinator.event_log().map(|log| log.since(since))),
        ControlRequest::Snapshot { device: Some(id) } => respond(coordinator.snapshot(&id)),
        ControlRequest::Snapshot { device: None } => respond(coordinator.snapshots()),
        ControlRequest::InjectFault { target } => respond(coordinator.inject_fault(target).await),
        ControlRequest::Recover { target } => respond(coordinator.recover(target).await),
        ControlRequest::Day2 => respond(coordinator.run_day2().await),
    }
}

/// Line-oriented JSON control server
pub struct ControlServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
}

impl ControlServer {
    pub async fn bind(addr: &str, coordinator: Arc<Coordinator>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, coordinator })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        info!(addr = %self.local_addr()?, "Control server listening");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Control server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "Control client connected");
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, coordinator).await {
                            warn!(%peer, error = %e, "Control connection failed");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, coordinator: Arc<Coordinator>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(line) {
            Ok(request) => {
                debug!(?request, "Control request");
                handle_request(&coordinator, request).await
            }
            Err(e) => ControlResponse::error(format!("invalid request: {}", e)),
        };
        let mut body = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        body.push('\n');
        write.write_all(body.as_bytes()).await?;
    }
    Ok(())
}
