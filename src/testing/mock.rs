//! Scripted in-process debug adapter
//!
//! Speaks the wire protocol over a `tokio::io::duplex` pipe. Every request
//! is recorded; replies come from canned defaults that can be overridden
//! per command, and the test drives events and reverse requests explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Notify};

use crate::common::emitter::lock;
use crate::common::{Error, Result};
use crate::dap::codec;
use crate::dap::connection::DapConnection;
use crate::dap::transport::TransportProvider;
use crate::dap::{
    DebugConfiguration, EventMessage, ProtocolMessage, RequestMessage, ResponseMessage,
};
use crate::session::services::DebugService;

struct Failure {
    command: String,
    thread_id: Option<i64>,
    message: String,
    body: Option<Value>,
}

struct MockState {
    requests: Vec<RequestMessage>,
    replies: HashMap<String, Value>,
    failures: Vec<Failure>,
    threads: Vec<Value>,
    stacks: HashMap<i64, Vec<Value>>,
    capabilities: Value,
    initialized_on_launch: bool,
    reverse: HashMap<i64, oneshot::Sender<ResponseMessage>>,
}

impl MockState {
    fn failure_for(&self, request: &RequestMessage) -> Option<&Failure> {
        let thread_id = request
            .arguments
            .as_ref()
            .and_then(|a| a.get("threadId"))
            .and_then(Value::as_i64);
        self.failures.iter().find(|f| {
            f.command == request.command && (f.thread_id.is_none() || f.thread_id == thread_id)
        })
    }

    fn reply_for(&self, request: &RequestMessage) -> Option<Value> {
        if let Some(body) = self.replies.get(&request.command) {
            return Some(body.clone());
        }
        let args = request.arguments.clone().unwrap_or(Value::Null);
        match request.command.as_str() {
            "initialize" => Some(self.capabilities.clone()),
            "threads" => Some(json!({ "threads": self.threads })),
            "stackTrace" => {
                let thread_id = args["threadId"].as_i64().unwrap_or_default();
                let frames = self.stacks.get(&thread_id).cloned().unwrap_or_default();
                Some(json!({ "stackFrames": frames, "totalFrames": frames.len() }))
            }
            "scopes" => {
                let frame_id = args["frameId"].as_i64().unwrap_or_default();
                Some(json!({
                    "scopes": [{ "name": "Locals", "variablesReference": 1000 + frame_id }]
                }))
            }
            "variables" => Some(json!({ "variables": [] })),
            "evaluate" => Some(json!({
                "result": args["expression"].as_str().unwrap_or_default(),
                "variablesReference": 0
            })),
            "completions" => Some(json!({ "targets": [] })),
            "setBreakpoints" => {
                let breakpoints: Vec<Value> = args["breakpoints"]
                    .as_array()
                    .map(|bps| {
                        bps.iter()
                            .enumerate()
                            .map(|(i, bp)| json!({ "id": i + 1, "verified": true, "line": bp["line"] }))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(json!({ "breakpoints": breakpoints }))
            }
            _ => None,
        }
    }
}

/// Adapter side of an in-memory DAP connection
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
    writer: Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>,
    seq: Arc<AtomicI64>,
    received: Arc<Notify>,
    connection: Arc<DapConnection>,
}

impl MockAdapter {
    /// Start an adapter and the client connection talking to it
    pub fn start() -> Self {
        Self::start_labeled("mock")
    }

    pub fn start_labeled(label: &str) -> Self {
        let (client, adapter) = tokio::io::duplex(256 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (adapter_read, adapter_write) = tokio::io::split(adapter);

        let state = Arc::new(Mutex::new(MockState {
            requests: Vec::new(),
            replies: HashMap::new(),
            failures: Vec::new(),
            threads: Vec::new(),
            stacks: HashMap::new(),
            capabilities: json!({ "supportsConfigurationDoneRequest": true }),
            initialized_on_launch: true,
            reverse: HashMap::new(),
        }));
        let mock = Self {
            state,
            writer: Arc::new(tokio::sync::Mutex::new(adapter_write)),
            seq: Arc::new(AtomicI64::new(1)),
            received: Arc::new(Notify::new()),
            connection: Arc::new(DapConnection::new(label, client_read, client_write)),
        };

        tokio::spawn(serve(
            BufReader::new(adapter_read),
            mock.state.clone(),
            mock.writer.clone(),
            mock.seq.clone(),
            mock.received.clone(),
        ));
        mock
    }

    /// Client-side connection to this adapter
    pub fn connection(&self) -> Arc<DapConnection> {
        self.connection.clone()
    }

    /// Threads reported by `threads`
    pub fn set_threads(&self, threads: &[(i64, &str)]) {
        lock(&self.state).threads = threads
            .iter()
            .map(|(id, name)| json!({ "id": id, "name": name }))
            .collect();
    }

    /// Frames reported by `stackTrace` for one thread, as (id, name, line)
    pub fn set_stack(&self, thread_id: i64, frames: &[(i64, &str, u32)]) {
        let frames = frames
            .iter()
            .map(|(id, name, line)| json!({ "id": id, "name": name, "line": line, "column": 1 }))
            .collect();
        lock(&self.state).stacks.insert(thread_id, frames);
    }

    /// Body of the `initialize` response
    pub fn set_capabilities(&self, capabilities: Value) {
        lock(&self.state).capabilities = capabilities;
    }

    /// Whether `initialized` is emitted after a `launch`/`attach` response
    pub fn set_initialized_on_launch(&self, enabled: bool) {
        lock(&self.state).initialized_on_launch = enabled;
    }

    /// Answer `command` with `body` instead of the default reply
    pub fn reply(&self, command: &str, body: Value) {
        lock(&self.state).replies.insert(command.to_string(), body);
    }

    /// Reject every `command` request
    pub fn fail(&self, command: &str, message: &str) {
        self.push_failure(command, None, message, None);
    }

    /// Reject `command` requests with an error body
    pub fn fail_with_body(&self, command: &str, message: &str, body: Value) {
        self.push_failure(command, None, message, Some(body));
    }

    /// Reject `command` requests addressed to one thread
    pub fn fail_for_thread(&self, command: &str, thread_id: i64, message: &str) {
        self.push_failure(command, Some(thread_id), message, None);
    }

    fn push_failure(&self, command: &str, thread_id: Option<i64>, message: &str, body: Option<Value>) {
        lock(&self.state).failures.push(Failure {
            command: command.to_string(),
            thread_id,
            message: message.to_string(),
            body,
        });
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<RequestMessage> {
        lock(&self.state).requests.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state)
            .requests
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    pub fn request_count(&self, command: &str) -> usize {
        lock(&self.state)
            .requests
            .iter()
            .filter(|r| r.command == command)
            .count()
    }

    pub fn last_request(&self, command: &str) -> Option<RequestMessage> {
        lock(&self.state)
            .requests
            .iter()
            .rev()
            .find(|r| r.command == command)
            .cloned()
    }

    /// Wait until at least `count` requests named `command` have arrived
    pub async fn wait_for_requests(&self, command: &str, count: usize) {
        loop {
            let notified = self.received.notified();
            if self.request_count(command) >= count {
                return;
            }
            notified.await;
        }
    }

    /// Send an event to the client
    pub async fn emit_event(&self, event: &str, body: Value) -> Result<()> {
        let message = ProtocolMessage::Event(EventMessage {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            event: event.to_string(),
            body: Some(body),
        });
        let mut writer = self.writer.lock().await;
        codec::write_message(&mut *writer, &message).await
    }

    /// Send an adapter-initiated request and wait for the client's response
    pub async fn send_request(&self, command: &str, arguments: Value) -> Result<ResponseMessage> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.state).reverse.insert(seq, tx);

        let message = ProtocolMessage::Request(RequestMessage {
            seq,
            command: command.to_string(),
            arguments: Some(arguments),
        });
        {
            let mut writer = self.writer.lock().await;
            codec::write_message(&mut *writer, &message).await?;
        }
        rx.await.map_err(|_| Error::AdapterCrashed)
    }

    /// Close the adapter's output, as if the process had died
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Adapter loop: record each request and answer it
async fn serve(
    mut reader: BufReader<ReadHalf<DuplexStream>>,
    state: Arc<Mutex<MockState>>,
    writer: Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>,
    seq: Arc<AtomicI64>,
    received: Arc<Notify>,
) {
    loop {
        let request = match codec::read_message(&mut reader).await {
            Ok(ProtocolMessage::Request(request)) => request,
            Ok(ProtocolMessage::Response(response)) => {
                if let Some(tx) = lock(&state).reverse.remove(&response.request_seq) {
                    let _ = tx.send(response);
                }
                continue;
            }
            Ok(ProtocolMessage::Event(_)) => continue,
            Err(_) => break,
        };

        let (response, emit_initialized) = {
            let mut state = lock(&state);
            state.requests.push(request.clone());

            let (success, message, body) = match state.failure_for(&request) {
                Some(failure) => (false, Some(failure.message.clone()), failure.body.clone()),
                None => (true, None, state.reply_for(&request)),
            };
            let emit_initialized = success
                && state.initialized_on_launch
                && matches!(request.command.as_str(), "launch" | "attach");

            let response = ProtocolMessage::Response(ResponseMessage {
                seq: seq.fetch_add(1, Ordering::SeqCst),
                request_seq: request.seq,
                success,
                command: request.command.clone(),
                message,
                body,
            });
            (response, emit_initialized)
        };
        received.notify_waiters();

        let mut writer = writer.lock().await;
        if codec::write_message(&mut *writer, &response).await.is_err() {
            break;
        }
        if emit_initialized {
            let event = ProtocolMessage::Event(EventMessage {
                seq: seq.fetch_add(1, Ordering::SeqCst),
                event: "initialized".to_string(),
                body: None,
            });
            if codec::write_message(&mut *writer, &event).await.is_err() {
                break;
            }
        }
    }
}

type Setup = Arc<dyn Fn(&MockAdapter) + Send + Sync>;

/// Transport provider handing out one [`MockAdapter`] per session
#[derive(Default)]
pub struct MockTransport {
    adapters: Mutex<HashMap<String, Arc<MockAdapter>>>,
    opened: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    setup: Option<Setup>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure every adapter right after it is started
    pub fn with_setup<F>(setup: F) -> Self
    where
        F: Fn(&MockAdapter) + Send + Sync + 'static,
    {
        Self {
            setup: Some(Arc::new(setup)),
            ..Self::default()
        }
    }

    /// Adapter serving the most recent session opened under `session_id`
    pub fn adapter(&self, session_id: &str) -> Option<Arc<MockAdapter>> {
        lock(&self.adapters).get(session_id).cloned()
    }

    /// Session ids passed to `open`, in order
    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }

    /// Session ids passed to `stop`, in order
    pub fn stopped(&self) -> Vec<String> {
        lock(&self.stopped).clone()
    }
}

#[async_trait]
impl TransportProvider for MockTransport {
    async fn open(
        &self,
        session_id: &str,
        _config: &DebugConfiguration,
    ) -> Result<Arc<DapConnection>> {
        let adapter = MockAdapter::start_labeled(session_id);
        if let Some(setup) = &self.setup {
            setup(&adapter);
        }
        let connection = adapter.connection();
        lock(&self.opened).push(session_id.to_string());
        lock(&self.adapters).insert(session_id.to_string(), Arc::new(adapter));
        Ok(connection)
    }
}

#[async_trait]
impl DebugService for MockTransport {
    async fn stop(&self, session_id: &str) -> Result<()> {
        lock(&self.stopped).push(session_id.to_string());
        Ok(())
    }
}
