//! Protocol connection to a debug adapter
//!
//! A connection wraps one duplex transport and multiplexes it into:
//! - correlated requests and responses (by sequence number)
//! - events, fanned out by name to registered listeners
//! - adapter-initiated ("reverse") requests, answered by registered handlers
//!
//! A background reader task owns the read half. Event listeners run inline
//! in that task, in registration order, so they must not block.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::common::emitter::lock;
use crate::common::{Emitter, Error, Result, Subscription};

use super::codec;
use super::types::{EventMessage, ProtocolMessage, RequestMessage, ResponseMessage};

/// Completion slot for a request awaiting its response
type ResponseSender = oneshot::Sender<Result<ResponseMessage>>;

/// Handler for an adapter-initiated request; its output becomes the response body
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the connection handle and its reader task
struct Shared {
    /// Label used in log output (normally the session id)
    label: String,
    /// Sequence number for the next outgoing message
    seq: AtomicI64,
    /// Write half of the transport
    writer: tokio::sync::Mutex<Writer>,
    /// Requests waiting for responses
    pending: Mutex<Pending>,
    /// Event listeners, keyed by event name
    events: Mutex<HashMap<String, Arc<Emitter<EventMessage>>>>,
    /// Reverse request handlers, keyed by command
    handlers: Mutex<HashMap<String, RequestHandler>>,
    disposed: AtomicBool,
}

#[derive(Default)]
struct Pending {
    /// Keyed by request seq
    requests: HashMap<i64, ResponseSender>,
    /// Set once no further responses can arrive
    closed: Option<Error>,
}

/// DAP connection over an arbitrary duplex byte stream
pub struct DapConnection {
    shared: Arc<Shared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl DapConnection {
    /// Create a connection and start reading from `reader`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            label: label.into(),
            seq: AtomicI64::new(1),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(Pending::default()),
            events: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        });

        let reader_task = tokio::spawn(read_loop(shared.clone(), BufReader::new(reader)));

        Self {
            shared,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).requests.len()
    }

    /// Send a request and wait for its response
    ///
    /// A response with `success: false` is returned as
    /// [`Error::DapRequestFailed`] carrying the adapter's body.
    #[tracing::instrument(skip(self, arguments), fields(session = %self.shared.label, seq))]
    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<ResponseMessage> {
        if self.is_disposed() {
            return Err(Error::ConnectionDisposed);
        }

        let seq = self.shared.next_seq();
        tracing::Span::current().record("seq", seq);

        // Register before writing so a fast response cannot be missed
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.shared.pending);
            if let Some(error) = &pending.closed {
                return Err(error.clone());
            }
            pending.requests.insert(seq, tx);
        }

        let request = ProtocolMessage::Request(RequestMessage {
            seq,
            command: command.to_string(),
            arguments,
        });
        tracing::debug!("Sending DAP request");
        if let Err(e) = self.shared.write(&request).await {
            lock(&self.shared.pending).requests.remove(&seq);
            return Err(e);
        }

        let response = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ConnectionDisposed),
        };

        if response.success {
            Ok(response)
        } else {
            let message = response
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            tracing::debug!(%message, "DAP request rejected");
            Err(Error::dap_request_failed(command, &message, response.body))
        }
    }

    /// Send a request and decode the response body
    pub async fn request<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<T> {
        self.send_request(command, arguments).await?.body_as()
    }

    /// Register a listener for events named `event`
    pub fn on_event<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        let emitter = lock(&self.shared.events)
            .entry(event.to_string())
            .or_insert_with(|| Arc::new(Emitter::new()))
            .clone();
        emitter.subscribe(listener)
    }

    /// Register the handler for adapter-initiated requests named `command`
    ///
    /// A later registration for the same command replaces the earlier one.
    pub fn on_request<F, Fut>(&self, command: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |args| handler(args).boxed());
        lock(&self.shared.handlers).insert(command.to_string(), handler);
    }

    /// Fail every pending request and detach all listeners and handlers
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = %self.shared.label, "Disposing DAP connection");

        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        self.shared.fail_pending(Error::ConnectionDisposed);
        self.shared.detach_all();
    }
}

impl std::fmt::Debug for DapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DapConnection")
            .field("label", &self.label())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for DapConnection {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

impl Shared {
    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn write(&self, message: &ProtocolMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        codec::write_message(&mut *writer, message).await
    }

    /// Fail every pending request; later requests fail with the same error
    fn fail_pending(&self, error: Error) {
        let drained: Vec<ResponseSender> = {
            let mut pending = lock(&self.pending);
            pending.closed.get_or_insert_with(|| error.clone());
            pending.requests.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                session = %self.label,
                count = drained.len(),
                error = %error,
                "Failing pending DAP requests"
            );
        }
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    fn detach_all(&self) {
        let emitters: Vec<Arc<Emitter<EventMessage>>> =
            lock(&self.events).drain().map(|(_, e)| e).collect();
        for emitter in emitters {
            emitter.clear();
        }
        lock(&self.handlers).clear();
    }

    fn handle_response(&self, response: ResponseMessage) {
        let tx = lock(&self.pending).requests.remove(&response.request_seq);
        match tx {
            Some(tx) => {
                if tx.send(Ok(response)).is_err() {
                    tracing::debug!(session = %self.label, "Response receiver dropped");
                }
            }
            None => tracing::warn!(
                session = %self.label,
                request_seq = response.request_seq,
                command = %response.command,
                "Received response for unknown request seq"
            ),
        }
    }

    fn handle_event(&self, event: &EventMessage) {
        tracing::debug!(session = %self.label, event = %event.event, "DAP event");
        let emitter = lock(&self.events).get(&event.event).cloned();
        if let Some(emitter) = emitter {
            emitter.fire(event);
        }
    }

    fn handle_request(self: &Arc<Self>, request: RequestMessage) {
        tracing::debug!(
            session = %self.label,
            command = %request.command,
            seq = request.seq,
            "Adapter-initiated request"
        );
        let handler = lock(&self.handlers).get(&request.command).cloned();
        let shared = self.clone();

        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => handler(request.arguments).await,
                None => Err(Error::DapProtocol(format!(
                    "Unrecognized request '{}'",
                    request.command
                ))),
            };

            let (success, message, body) = match result {
                Ok(body) => (true, None, (!body.is_null()).then_some(body)),
                Err(e) => {
                    tracing::warn!(
                        session = %shared.label,
                        command = %request.command,
                        error = %e,
                        "Adapter-initiated request failed"
                    );
                    (false, Some(e.to_string()), None)
                }
            };

            let response = ProtocolMessage::Response(ResponseMessage {
                seq: shared.next_seq(),
                request_seq: request.seq,
                success,
                command: request.command,
                message,
                body,
            });
            if let Err(e) = shared.write(&response).await {
                tracing::warn!(session = %shared.label, error = %e, "Failed to answer adapter request");
            }
        });
    }
}

/// Reader task: dispatch frames until the transport closes
async fn read_loop<R>(shared: Arc<Shared>, mut reader: BufReader<R>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tracing::debug!(session = %shared.label, "DAP reader task started");

    let exit_error = loop {
        match codec::read_message(&mut reader).await {
            Ok(ProtocolMessage::Response(response)) => shared.handle_response(response),
            Ok(ProtocolMessage::Event(event)) => shared.handle_event(&event),
            Ok(ProtocolMessage::Request(request)) => shared.handle_request(request),
            Err(Error::DapProtocol(msg)) => {
                tracing::warn!(session = %shared.label, "Skipping malformed DAP message: {}", msg);
            }
            Err(e) => break e,
        }
    };

    tracing::info!(session = %shared.label, reason = %exit_error, "DAP connection closed");
    shared.fail_pending(exit_error);
}
