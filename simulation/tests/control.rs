//! JSON-lines control channel over TCP

mod common;

use std::sync::Arc;

use common::coordinator;
use netsim_simulation::{ControlResponse, ControlServer, scenarios};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

struct Client {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn call(&mut self, request: serde_json::Value) -> ControlResponse {
        self.raw(&request.to_string()).await
    }

    async fn raw(&mut self, line: &str) -> ControlResponse {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
        let reply = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_control_session() {
    let coordinator = Arc::new(coordinator(scenarios::enterprise().unwrap()));
    coordinator.start_day1().await.unwrap();

    let server = ControlServer::bind("127.0.0.1:0", coordinator.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let serving = tokio::spawn(server.run(shutdown_rx));

    let mut client = Client::connect(addr).await;

    let status = client.call(json!({ "command": "status" })).await;
    assert!(status.ok, "{:?}", status.error);
    let data = status.data.unwrap();
    assert_eq!(data["day1_complete"], true);
    assert_eq!(data["devices"]["R1"], "operational");

    let snapshot = client.call(json!({ "command": "snapshot", "device": "R2" })).await;
    assert_eq!(snapshot.data.unwrap()["state"], "operational");

    let missing = client.call(json!({ "command": "snapshot", "device": "R9" })).await;
    assert!(!missing.ok);
    assert!(missing.error.unwrap().contains("R9"));

    let links = client.call(json!({ "command": "links" })).await;
    assert_eq!(links.data.unwrap().as_array().unwrap().len(), 4);

    let target = json!({ "target": "link", "id": "R1-R2" });
    let injected = client.call(json!({ "command": "inject_fault", "target": target })).await;
    assert_eq!(injected.data.unwrap()["outcome"], "injected");
    let again = client.call(json!({ "command": "inject_fault", "target": target })).await;
    assert_eq!(again.data.unwrap()["outcome"], "already_down");

    let recovered = client.call(json!({ "command": "recover", "target": target })).await;
    let recovery = recovered.data.unwrap();
    assert_eq!(recovery["outcome"]["outcome"], "recovered");
    assert!(recovery["recovery_ticks"].as_u64().unwrap() > 0);

    let paused = client.call(json!({ "command": "pause" })).await;
    assert_eq!(paused.data.unwrap()["changed"], true);
    let resumed = client.call(json!({ "command": "resume" })).await;
    assert_eq!(resumed.data.unwrap()["changed"], true);

    let events = client.call(json!({ "command": "events", "since": 0 })).await;
    assert!(!events.data.unwrap().as_array().unwrap().is_empty());

    let stats = client.call(json!({ "command": "stats" })).await;
    assert!(stats.data.unwrap()["sent"].as_u64().unwrap() > 0);

    let bad = client.raw("{\"command\":\"reboot\"}").await;
    assert!(!bad.ok);
    assert!(bad.error.unwrap().starts_with("invalid request"));
    let garbage = client.raw("not json").await;
    assert!(!garbage.ok);

    // The connection survives bad input
    let status = client.call(json!({ "command": "status" })).await;
    assert!(status.ok);

    let _ = shutdown_tx.send(());
    serving.await.unwrap().unwrap();
    coordinator.stop().await.unwrap();
}
