//! stdio transport integration tests
//!
//! Runs the NDJSON loop over an in-memory duplex stream and speaks the wire
//! protocol like a real client: one JSON object per line, responses and
//! notifications interleaved on the same channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use rexd::server::{stdio, Service};
use rexd_core::config::{AllowedRoot, Config};

struct Client {
    reader: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    root: TempDir,
}

impl Client {
    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
            .await
            .expect("timed out waiting for line")
            .unwrap()
            .expect("stream closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Read lines until a notification with the given method arrives.
    async fn recv_notification(&mut self, method: &str) -> Value {
        loop {
            let msg = self.recv().await;
            if msg["method"] == method {
                return msg;
            }
        }
    }
}

fn start_connection(mutate: impl FnOnce(&mut Config)) -> Client {
    let root = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.security.allowed_roots = vec![AllowedRoot {
        path: root.path().to_string_lossy().into_owned(),
    }];
    mutate(&mut cfg);
    let service = Arc::new(Service::new(cfg).unwrap());

    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);
    tokio::spawn(async move {
        let _ = stdio::run(service, server_read, server_write).await;
    });

    let (client_read, client_write) = tokio::io::split(client_side);
    Client {
        reader: BufReader::new(client_read).lines(),
        writer: client_write,
        root,
    }
}

async fn open_session(client: &mut Client, root: &str) -> String {
    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "session.open",
            "params": {"client_name": "test-client", "workspace_roots": [root]},
        }))
        .await;
    let resp = client.recv().await;
    resp["result"]["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_stdio_session_and_fs_flow() {
    let mut client = start_connection(|_| {});
    let root = client.root.path().to_string_lossy().into_owned();
    let session_id = open_session(&mut client, &root).await;
    let target = format!("{root}/hello.txt");

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "fs.write",
            "params": {
                "session_id": session_id,
                "path": target,
                "content": "hello\n",
                "encoding": "utf8",
                "mode": "replace",
                "mkdir_parents": true,
            },
        }))
        .await;
    let written = client.recv().await;
    assert_eq!(written["id"], 2);
    assert_eq!(written["result"]["bytes_written"], 6);

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "fs.read",
            "params": {"session_id": session_id, "path": target},
        }))
        .await;
    let read = client.recv().await;
    assert_eq!(read["result"]["content"], "hello\n");
}

#[tokio::test]
async fn test_stdio_exec_start_and_exit_event() {
    let mut client = start_connection(|cfg| cfg.limits.default_timeout_ms = 1500);
    let root = client.root.path().to_string_lossy().into_owned();
    let session_id = open_session(&mut client, &root).await;

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "exec.start",
            "params": {
                "session_id": session_id,
                "argv": ["sh", "-lc", "printf test-output"],
                "cwd": root,
            },
        }))
        .await;
    let started = client.recv().await;
    assert!(started["result"]["process_id"]
        .as_str()
        .unwrap()
        .starts_with("p_"));

    let exit = client.recv_notification("exec.exit").await;
    assert_eq!(exit["jsonrpc"], "2.0");
    assert_eq!(exit["params"]["exit_code"], 0);
    assert_eq!(exit["params"]["timed_out"], false);
}

#[tokio::test]
async fn test_stdio_stream_events_precede_exit() {
    let mut client = start_connection(|_| {});
    let root = client.root.path().to_string_lossy().into_owned();
    let session_id = open_session(&mut client, &root).await;

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "exec.start",
            "params": {
                "session_id": session_id,
                "argv": ["sh", "-lc", "for i in 1 2 3; do echo $i; done"],
            },
        }))
        .await;
    let _started = client.recv().await;

    let mut stdout_seqs = Vec::new();
    loop {
        let msg = client.recv().await;
        match msg["method"].as_str() {
            Some("exec.stdout") => stdout_seqs.push(msg["params"]["seq"].as_u64().unwrap()),
            Some("exec.exit") => break,
            _ => {}
        }
    }
    assert_eq!(stdout_seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_stdio_request_without_id_gets_no_response() {
    let mut client = start_connection(|_| {});
    let root = client.root.path().to_string_lossy().into_owned();
    let session_id = open_session(&mut client, &root).await;

    // one-way request: processed but unanswered
    client
        .send(json!({
            "jsonrpc": "2.0",
            "method": "session.info",
            "params": {"session_id": session_id},
        }))
        .await;
    // follow-up with an id; the next line on the wire must answer it
    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "session.info",
            "params": {"session_id": session_id},
        }))
        .await;
    let resp = client.recv().await;
    assert_eq!(resp["id"], 7);
}

#[tokio::test]
async fn test_stdio_error_passthrough() {
    let mut client = start_connection(|_| {});
    let root = client.root.path().to_string_lossy().into_owned();
    let session_id = open_session(&mut client, &root).await;

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "fs.read",
            "params": {"session_id": session_id, "path": "../etc/passwd"},
        }))
        .await;
    let resp = client.recv().await;
    assert_eq!(resp["error"]["code"], -32002);
    assert_eq!(resp["error"]["message"], "path is outside allowed roots");
}
