//! Shared plumbing for the end-to-end suite: an in-memory DAP client wired to
//! `wire_server::run`, plus helpers for the scripted runtime.

use std::{collections::VecDeque, time::Duration};

use nightjar_cdp::mock::{self, MockRuntime};
use nightjar_dap::{
    dap_tokio::{DapReader, DapWriter},
    wire_server::{self, AdapterOptions},
};
use serde_json::{json, Value};
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// How long a test waits before concluding that an event is not coming.
pub const QUIET: Duration = Duration::from_millis(200);

pub struct DapClient {
    reader: DapReader<ReadHalf<DuplexStream>>,
    writer: DapWriter<WriteHalf<DuplexStream>>,
    next_seq: i64,
    /// Events read while waiting for something else, oldest first.
    pending: VecDeque<Value>,
    server: JoinHandle<()>,
}

pub fn spawn_wire_server() -> DapClient {
    spawn_wire_server_with(AdapterOptions::default())
}

pub fn spawn_wire_server_with(options: AdapterOptions) -> DapClient {
    let (client, server_stream) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let server = tokio::spawn(async move {
        wire_server::run(server_read, server_write, options)
            .await
            .expect("wire server failed");
    });

    let (client_read, client_write) = tokio::io::split(client);
    DapClient {
        reader: DapReader::new(client_read),
        writer: DapWriter::new(client_write),
        next_seq: 1,
        pending: VecDeque::new(),
        server,
    }
}

pub fn is_event(msg: &Value, name: &str) -> bool {
    msg.get("type").and_then(Value::as_str) == Some("event")
        && msg.get("event").and_then(Value::as_str) == Some(name)
}

impl DapClient {
    async fn read_next(&mut self) -> Value {
        tokio::time::timeout(TIMEOUT, self.reader.read_value())
            .await
            .expect("timed out waiting for a message from the adapter")
            .expect("failed to read from the adapter")
            .expect("adapter closed the stream")
    }

    pub async fn send(&mut self, command: &str, arguments: Value) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.writer.write_value(&msg).await.unwrap();
        seq
    }

    /// Send a request and return its response. Events read in the meantime are
    /// kept for the `wait_for_*` helpers.
    pub async fn request(&mut self, command: &str, arguments: Value) -> Value {
        let seq = self.send(command, arguments).await;
        self.response_to(seq).await
    }

    pub async fn response_to(&mut self, seq: i64) -> Value {
        loop {
            let msg = self.read_next().await;
            if msg.get("type").and_then(Value::as_str) == Some("response")
                && msg.get("request_seq").and_then(Value::as_i64) == Some(seq)
            {
                return msg;
            }
            if msg.get("type").and_then(Value::as_str) == Some("event") {
                self.pending.push_back(msg);
            }
        }
    }

    /// A request expected to succeed; returns its body.
    pub async fn ok(&mut self, command: &str, arguments: Value) -> Value {
        let resp = self.request(command, arguments).await;
        assert_eq!(resp["success"], true, "{command} failed: {resp}");
        resp.get("body").cloned().unwrap_or(Value::Null)
    }

    /// A request expected to fail; returns its error message.
    pub async fn fails(&mut self, command: &str, arguments: Value) -> String {
        let resp = self.request(command, arguments).await;
        assert_eq!(resp["success"], false, "{command} unexpectedly succeeded: {resp}");
        resp["message"].as_str().unwrap_or_default().to_string()
    }

    /// The next event matching `pred`. Earlier events that do not match are
    /// discarded.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&Value) -> bool) -> Value {
        while let Some(msg) = self.pending.pop_front() {
            if pred(&msg) {
                return msg;
            }
        }
        loop {
            let msg = self.read_next().await;
            if msg.get("type").and_then(Value::as_str) == Some("event") && pred(&msg) {
                return msg;
            }
        }
    }

    pub async fn wait_for_event(&mut self, name: &str) -> Value {
        self.wait_for(|msg| is_event(msg, name)).await
    }

    /// Body of the next `stopped` event, which must carry `reason`.
    pub async fn wait_for_stopped_reason(&mut self, reason: &str) -> Value {
        let msg = self.wait_for_event("stopped").await;
        assert_eq!(msg["body"]["reason"], reason, "unexpected stop: {msg}");
        msg["body"].clone()
    }

    /// Every event that arrives within [`QUIET`], including buffered ones.
    pub async fn drain_events(&mut self) -> Vec<Value> {
        let mut events: Vec<Value> = self.pending.drain(..).collect();
        while let Ok(Ok(Some(msg))) = tokio::time::timeout(QUIET, self.reader.read_value()).await {
            if msg.get("type").and_then(Value::as_str) == Some("event") {
                events.push(msg);
            }
        }
        events
    }

    pub async fn assert_no_event(&mut self, name: &str) {
        let events = self.drain_events().await;
        assert!(
            !events.iter().any(|msg| is_event(msg, name)),
            "unexpected `{name}` event in {events:?}"
        );
    }

    pub async fn initialize_handshake(&mut self) -> Value {
        let caps = self.ok("initialize", json!({ "adapterID": "nightjar" })).await;
        self.wait_for_event("initialized").await;
        caps
    }

    pub async fn attach(&mut self, port: u16) -> Value {
        self.request("attach", json!({ "host": "127.0.0.1", "port": port })).await
    }

    pub async fn threads(&mut self) -> Vec<(i64, String)> {
        let body = self.ok("threads", json!({})).await;
        body["threads"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|t| {
                (
                    t["id"].as_i64().unwrap(),
                    t["name"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    pub async fn first_thread_id(&mut self) -> i64 {
        self.threads().await.first().expect("no threads").0
    }

    pub async fn stack_trace(&mut self, thread_id: i64) -> Vec<Value> {
        let body = self.ok("stackTrace", json!({ "threadId": thread_id })).await;
        body["stackFrames"].as_array().cloned().unwrap_or_default()
    }

    /// Disconnect and wait for the server task to finish.
    pub async fn disconnect(mut self) -> Vec<Value> {
        let seq = self.send("disconnect", json!({})).await;
        let mut events: Vec<Value> = self.pending.drain(..).collect();
        let mut responded = false;
        while let Ok(Ok(Some(msg))) = tokio::time::timeout(TIMEOUT, self.reader.read_value()).await {
            match msg.get("type").and_then(Value::as_str) {
                Some("response") if msg["request_seq"] == seq => responded = true,
                Some("event") => events.push(msg),
                _ => {}
            }
        }
        assert!(responded, "disconnect was not answered");
        tokio::time::timeout(TIMEOUT, self.server)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        events
    }
}

/// A scripted runtime plus a client that completed `initialize` and `attach`.
pub async fn attached_session() -> (MockRuntime, DapClient) {
    let runtime = MockRuntime::spawn().await.unwrap();
    let client = attach_to(&runtime, spawn_wire_server()).await;
    (runtime, client)
}

pub async fn attach_to(runtime: &MockRuntime, mut client: DapClient) -> DapClient {
    client.initialize_handshake().await;
    let resp = client.attach(runtime.addr().port()).await;
    assert_eq!(resp["success"], true, "attach failed: {resp}");
    runtime
        .wait_for_command(None, "Runtime.runIfWaitingForDebugger")
        .await
        .expect("root context was never released");
    client
}

/// A `debugger;` statement pause at `file:///app/main.js` line 3 (0-based 2).
pub fn debugger_statement() -> Value {
    mock::paused(
        "other",
        vec![
            mock::call_frame("cf-1", "handler", "file:///app/main.js", 2),
            mock::call_frame("cf-2", "", "file:///app/main.js", 10),
        ],
    )
}

/// An exception pause for a thrown `Error` with object id `object_id`.
pub fn exception_pause(object_id: &str, message: &str, uncaught: bool) -> Value {
    let mut pause = mock::paused(
        "exception",
        vec![mock::call_frame("cf-ex", "fail", "file:///app/main.js", 20)],
    );
    pause["data"] = json!({
        "type": "object",
        "subtype": "error",
        "className": "Error",
        "description": format!("Error: {message}\n    at fail (file:///app/main.js:21:5)"),
        "objectId": object_id,
        "uncaught": uncaught,
    });
    pause
}
