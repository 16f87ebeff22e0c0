//! One debug session and its live thread model
//!
//! The session listens to adapter events and keeps the thread map, the
//! current thread and the capability record consistent. Event handlers run
//! inline in the connection's reader task, so they only touch in-memory state
//! and hand anything that needs a round trip to a spawned task.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::common::config::SessionSettings;
use crate::common::emitter::lock;
use crate::common::{Emitter, Error, Result, Subscription};
use crate::dap::connection::DapConnection;
use crate::dap::{
    Capabilities, CapabilitiesEventBody, CompletionItem, CompletionsArguments,
    CompletionsResponseBody, ContinuedEventBody, DebugConfiguration, DisconnectArguments,
    EvaluateArguments, EvaluateResponseBody, EventMessage, InitializeArguments,
    LoadedSourceEventBody, ResponseMessage, RunInTerminalArguments, RunInTerminalResponseBody,
    Source, ThreadEventBody, ThreadsResponseBody, Variable, VariablesArguments,
    VariablesResponseBody,
};

use super::debounce::Debouncer;
use super::services::{TerminalOptions, TerminalService};
use super::thread::{DebugStackFrame, DebugThread, StoppedDetails};

/// Coarse state of a session, derived from its current thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugState {
    Inactive,
    Running,
    Stopped,
}

impl fmt::Display for DebugState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Construction parameters shared by every session
#[derive(Clone)]
pub struct SessionOptions {
    pub settings: SessionSettings,
    pub terminal: Arc<dyn TerminalService>,
}

impl SessionOptions {
    pub fn new(terminal: Arc<dyn TerminalService>) -> Self {
        Self {
            settings: SessionSettings::default(),
            terminal,
        }
    }
}

#[derive(Default)]
struct SessionInner {
    threads: BTreeMap<i64, Arc<DebugThread>>,
    current_thread: Option<Arc<DebugThread>>,
    capabilities: Capabilities,
    sources: HashMap<String, Source>,
    all_threads_stopped: bool,
    all_threads_continued: bool,
    configured: bool,
}

/// A debug session bound to one adapter connection
pub struct DebugSession {
    id: String,
    configuration: DebugConfiguration,
    connection: Arc<DapConnection>,
    settings: SessionSettings,
    inner: Mutex<SessionInner>,
    refresh: Debouncer<Option<StoppedDetails>>,
    subscriptions: Mutex<Vec<Subscription>>,
    disposed: AtomicBool,
    did_change: Emitter<()>,
    frames_ready: Emitter<Arc<DebugThread>>,
    did_configure: Emitter<()>,
}

impl DebugSession {
    /// Create a session and start listening to `connection`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        id: &str,
        configuration: DebugConfiguration,
        connection: Arc<DapConnection>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let delay = options.settings.threads_debounce();
        let session = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let refresh = Debouncer::new(delay, move |details: Option<StoppedDetails>| {
                let weak = weak.clone();
                async move {
                    if let Some(session) = weak.upgrade() {
                        session.update_threads(details).await;
                    }
                }
            });

            Self {
                id: id.to_string(),
                configuration,
                connection,
                settings: options.settings.clone(),
                inner: Mutex::new(SessionInner::default()),
                refresh,
                subscriptions: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
                did_change: Emitter::new(),
                frames_ready: Emitter::new(),
                did_configure: Emitter::new(),
            }
        });
        session.register_listeners(options.terminal);
        session
    }

    fn register_listeners(self: &Arc<Self>, terminal: Arc<dyn TerminalService>) {
        let handlers: [(&str, fn(&Arc<Self>, &EventMessage)); 5] = [
            ("continued", Self::on_continued),
            ("stopped", Self::on_stopped),
            ("thread", Self::on_thread),
            ("loadedSource", Self::on_loaded_source),
            ("capabilities", Self::on_capabilities),
        ];

        let mut subscriptions = lock(&self.subscriptions);
        for (event, handler) in handlers {
            let weak = Arc::downgrade(self);
            subscriptions.push(self.connection.on_event(event, move |message| {
                if let Some(session) = weak.upgrade() {
                    handler(&session, message);
                }
            }));
        }

        self.connection.on_request("runInTerminal", move |arguments| {
            let terminal = terminal.clone();
            async move { run_in_terminal(terminal, arguments).await }
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn configuration(&self) -> &DebugConfiguration {
        &self.configuration
    }

    pub fn connection(&self) -> &Arc<DapConnection> {
        &self.connection
    }

    pub fn state(&self) -> DebugState {
        if self.is_disposed() {
            return DebugState::Inactive;
        }
        match self.current_thread() {
            None => DebugState::Inactive,
            Some(thread) if thread.is_stopped() => DebugState::Stopped,
            Some(_) => DebugState::Running,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_configured(&self) -> bool {
        lock(&self.inner).configured
    }

    pub fn capabilities(&self) -> Capabilities {
        lock(&self.inner).capabilities.clone()
    }

    /// Threads in id order
    pub fn threads(&self) -> Vec<Arc<DebugThread>> {
        lock(&self.inner).threads.values().cloned().collect()
    }

    pub fn thread(&self, id: i64) -> Option<Arc<DebugThread>> {
        lock(&self.inner).threads.get(&id).cloned()
    }

    pub fn current_thread(&self) -> Option<Arc<DebugThread>> {
        lock(&self.inner).current_thread.clone()
    }

    pub fn current_frame(&self) -> Option<Arc<DebugStackFrame>> {
        self.current_thread().and_then(|thread| thread.current_frame())
    }

    /// Whether the last `stopped` event said every thread stopped
    pub fn all_threads_stopped(&self) -> bool {
        lock(&self.inner).all_threads_stopped
    }

    /// Whether the last `continued` event covered every thread
    pub fn all_threads_continued(&self) -> bool {
        lock(&self.inner).all_threads_continued
    }

    /// Last-seen descriptor for a source, looked up by path or reference
    pub fn get_source(&self, source: &Source) -> Option<Source> {
        let inner = lock(&self.inner);
        source
            .keys()
            .iter()
            .find_map(|key| inner.sources.get(key).cloned())
    }

    /// Make `thread_id` the current thread
    ///
    /// A thread that is not stopped cannot be current; selecting one leaves
    /// the session without a current thread.
    pub fn set_current_thread(self: &Arc<Self>, thread_id: i64) -> Result<()> {
        if self.thread(thread_id).is_none() {
            return Err(Error::ThreadNotFound(thread_id));
        }
        self.assign_current_thread(Some(thread_id));
        self.fire_did_change();
        Ok(())
    }

    /// Listen for any change to threads, current thread or capabilities
    pub fn on_did_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.did_change.subscribe(listener)
    }

    /// Listen for the current thread's frames becoming available
    pub fn on_frames_ready<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<DebugThread>) + Send + Sync + 'static,
    {
        self.frames_ready.subscribe(listener)
    }

    pub fn on_did_configure<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.did_configure.subscribe(listener)
    }

    /// Listen for a raw adapter event
    pub fn on<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.connection.on_event(event, listener)
    }

    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<ResponseMessage> {
        self.connection.send_request(command, arguments).await
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<T> {
        self.connection.request(command, arguments).await
    }

    // === Lifecycle ===

    /// Send `initialize` and record the adapter's capabilities
    #[tracing::instrument(skip(self, args), fields(session = %self.id))]
    pub async fn initialize(&self, args: InitializeArguments) -> Result<()> {
        let response = self
            .send_request("initialize", Some(serde_json::to_value(args)?))
            .await?;
        if let Some(body) = &response.body {
            lock(&self.inner).capabilities.merge(body);
        }
        tracing::debug!("Adapter initialized");
        self.fire_did_change();
        Ok(())
    }

    /// Send `configurationDone` and notify configuration listeners
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub async fn configuration_done(&self) -> Result<()> {
        self.send_request("configurationDone", None).await?;
        lock(&self.inner).configured = true;
        tracing::debug!("Configuration done");
        self.did_configure.fire(&());
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub async fn disconnect(&self, args: DisconnectArguments) -> Result<()> {
        self.send_request("disconnect", Some(serde_json::to_value(args)?))
            .await?;
        Ok(())
    }

    /// Pause every running thread; individual failures are logged
    pub async fn pause_all(&self) {
        let running: Vec<Arc<DebugThread>> =
            self.threads().into_iter().filter(|t| !t.is_stopped()).collect();
        let results = join_all(running.iter().map(|thread| thread.pause())).await;
        for (thread, result) in running.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(session = %self.id, thread = thread.id(), error = %e, "Failed to pause thread");
            }
        }
    }

    /// Continue every stopped thread; individual failures are logged
    pub async fn continue_all(&self) {
        let stopped: Vec<Arc<DebugThread>> =
            self.threads().into_iter().filter(|t| t.is_stopped()).collect();
        let results = join_all(stopped.iter().map(|thread| thread.continue_())).await;
        for (thread, result) in stopped.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(session = %self.id, thread = thread.id(), error = %e, "Failed to continue thread");
            }
        }
    }

    /// Evaluate `expression` in the current frame, if there is one
    pub async fn evaluate(
        &self,
        expression: &str,
        context: Option<&str>,
    ) -> Result<EvaluateResponseBody> {
        let args = EvaluateArguments {
            expression: expression.to_string(),
            frame_id: self.current_frame().map(|frame| frame.id()),
            context: context.map(str::to_string),
        };
        self.request("evaluate", Some(serde_json::to_value(args)?))
            .await
    }

    /// Ask the adapter for completions of `text` at `column`
    pub async fn completions(
        &self,
        text: &str,
        column: i64,
        line: Option<i64>,
    ) -> Result<Vec<CompletionItem>> {
        let args = CompletionsArguments {
            frame_id: self.current_frame().map(|frame| frame.id()),
            text: text.to_string(),
            column,
            line,
        };
        let body: CompletionsResponseBody = self
            .request("completions", Some(serde_json::to_value(args)?))
            .await?;
        Ok(body.targets)
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>> {
        let args = VariablesArguments { variables_reference };
        let body: VariablesResponseBody = self
            .request("variables", Some(serde_json::to_value(args)?))
            .await?;
        Ok(body.variables)
    }

    /// Forget every thread, as before a restart
    pub fn clear_threads(&self) {
        self.refresh.cancel();
        {
            let mut inner = lock(&self.inner);
            inner.threads.clear();
            inner.current_thread = None;
        }
        self.fire_did_change();
    }

    /// Stop listening and dispose the connection
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = %self.id, "Disposing session");
        self.refresh.cancel();
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.dispose();
        }
        self.connection.dispose();
        let mut inner = lock(&self.inner);
        inner.threads.clear();
        inner.current_thread = None;
    }

    // === Event handling ===

    fn on_continued(self: &Arc<Self>, event: &EventMessage) {
        let Some(body) = decode::<ContinuedEventBody>(&self.id, event) else {
            return;
        };
        let all = body.all_threads_continued != Some(false);

        let cleared: Vec<Arc<DebugThread>> = {
            let mut inner = lock(&self.inner);
            inner.all_threads_continued = all;
            if all {
                inner.threads.values().cloned().collect()
            } else {
                inner.threads.get(&body.thread_id).cloned().into_iter().collect()
            }
        };
        tracing::debug!(session = %self.id, thread = body.thread_id, all, "Threads continued");

        for thread in &cleared {
            thread.clear();
        }
        self.update_current_thread(None);
        for thread in &cleared {
            thread.notify_change();
        }
        self.fire_did_change();
    }

    fn on_stopped(self: &Arc<Self>, event: &EventMessage) {
        let Some(details) = decode::<StoppedDetails>(&self.id, event) else {
            return;
        };
        tracing::debug!(
            session = %self.id,
            reason = %details.reason,
            thread = ?details.thread_id,
            "Stopped"
        );
        lock(&self.inner).all_threads_stopped = details.all_threads_stopped;
        self.refresh.trigger(Some(details));
    }

    fn on_thread(self: &Arc<Self>, event: &EventMessage) {
        let Some(body) = decode::<ThreadEventBody>(&self.id, event) else {
            return;
        };
        match body.reason.as_str() {
            // An undetailed refresh must not discard stop details already queued
            "started" => self.refresh.trigger_with(|pending| pending.flatten()),
            "exited" => {
                let thread = self.thread(body.thread_id);
                if let Some(thread) = &thread {
                    thread.clear();
                }
                self.update_current_thread(None);
                if let Some(thread) = &thread {
                    thread.notify_change();
                }
                self.fire_did_change();
            }
            other => {
                tracing::debug!(session = %self.id, reason = other, "Ignoring thread event");
            }
        }
    }

    fn on_loaded_source(self: &Arc<Self>, event: &EventMessage) {
        let Some(body) = decode::<LoadedSourceEventBody>(&self.id, event) else {
            return;
        };
        if !matches!(body.reason.as_str(), "new" | "changed") {
            return;
        }
        let mut inner = lock(&self.inner);
        for key in body.source.keys() {
            inner.sources.insert(key, body.source.clone());
        }
    }

    fn on_capabilities(self: &Arc<Self>, event: &EventMessage) {
        let Some(body) = decode::<CapabilitiesEventBody>(&self.id, event) else {
            return;
        };
        lock(&self.inner).capabilities.merge(&body.capabilities);
        self.fire_did_change();
    }

    /// Replace the thread map from a `threads` response
    async fn update_threads(self: &Arc<Self>, details: Option<StoppedDetails>) {
        if self.is_disposed() {
            return;
        }
        let body: ThreadsResponseBody = match self.request("threads", None).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Failed to refresh threads");
                return;
            }
        };

        let (stopped, dropped) = {
            let mut inner = lock(&self.inner);
            let mut previous = std::mem::take(&mut inner.threads);
            let mut stopped = Vec::new();

            for raw in body.threads {
                let id = raw.id;
                let thread = match previous.remove(&id) {
                    Some(thread) => {
                        thread.update_raw(raw);
                        thread
                    }
                    None => DebugThread::new(raw, self.connection.clone()),
                };

                if let Some(details) = &details {
                    if details.thread_id == Some(id) {
                        thread.set_stopped_details(details.clone());
                        stopped.push(thread.clone());
                    } else if details.all_threads_stopped {
                        thread.set_stopped_details(StoppedDetails {
                            thread_id: Some(id),
                            all_threads_stopped: true,
                            preserve_focus_hint: details.preserve_focus_hint,
                            ..Default::default()
                        });
                        stopped.push(thread.clone());
                    }
                }
                inner.threads.insert(id, thread);
            }
            (stopped, previous.len())
        };
        tracing::debug!(
            session = %self.id,
            threads = self.threads().len(),
            dropped,
            "Threads refreshed"
        );

        self.update_current_thread(details.as_ref());
        for thread in &stopped {
            thread.notify_change();
        }
        self.fire_did_change();
    }

    /// Pick the current thread after the thread map or thread states changed
    ///
    /// Preference: the thread named by the stop details (unless focus is to
    /// be preserved), then the previous current thread while it still exists,
    /// then any remaining thread. A candidate that is not stopped leaves the
    /// session without a current thread.
    fn update_current_thread(self: &Arc<Self>, details: Option<&StoppedDetails>) {
        let candidate = {
            let inner = lock(&self.inner);
            let present = |id: &i64| inner.threads.contains_key(id);

            let preferred = details
                .filter(|d| !d.preserve_focus_hint)
                .and_then(|d| d.thread_id)
                .filter(present);
            let previous = inner
                .current_thread
                .as_ref()
                .map(|t| t.id())
                .filter(present);
            let any = inner.threads.keys().next().copied();

            preferred.or(previous).or(any)
        };
        self.assign_current_thread(candidate);
    }

    /// Set the current thread; only a stopped thread is accepted
    ///
    /// The new current thread's frames are fetched in the background; once
    /// they are stored `frames_ready` fires, then `did_change`.
    fn assign_current_thread(self: &Arc<Self>, thread_id: Option<i64>) {
        let thread = {
            let mut inner = lock(&self.inner);
            let thread = thread_id
                .and_then(|id| inner.threads.get(&id).cloned())
                .filter(|t| t.is_stopped());
            inner.current_thread = thread.clone();
            thread
        };

        if let Some(thread) = thread {
            if thread.claim_frames_fetch() {
                self.spawn_frames_fetch(thread);
            }
        }
    }

    fn spawn_frames_fetch(self: &Arc<Self>, thread: Arc<DebugThread>) {
        let weak = Arc::downgrade(self);
        let levels = self.settings.stack_frame_levels;
        tokio::spawn(async move {
            match thread.load_frames(levels).await {
                Ok((_, true)) => {
                    if let Some(session) = weak.upgrade() {
                        session.frames_ready.fire(&thread);
                        session.fire_did_change();
                    }
                }
                Ok((_, false)) => {}
                Err(e) => {
                    tracing::warn!(thread = thread.id(), error = %e, "Failed to fetch stack frames");
                }
            }
        });
    }

    fn fire_did_change(&self) {
        self.did_change.fire(&());
    }
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.id)
            .field("type", &self.configuration.debug_type)
            .field("name", &self.configuration.name)
            .field("state", &self.state())
            .finish()
    }
}

fn decode<T: DeserializeOwned>(session: &str, event: &EventMessage) -> Option<T> {
    match event.body_as() {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::warn!(session, error = %e, "Ignoring malformed event");
            None
        }
    }
}

/// Serve an adapter's `runInTerminal` request
async fn run_in_terminal(
    terminal: Arc<dyn TerminalService>,
    arguments: Option<Value>,
) -> Result<Value> {
    let args: RunInTerminalArguments = serde_json::from_value(arguments.unwrap_or(Value::Null))
        .map_err(|e| Error::DapProtocol(format!("Invalid runInTerminal arguments: {}", e)))?;

    let mut command = args.args.into_iter();
    let shell_path = command
        .next()
        .ok_or_else(|| Error::TerminalFailed("no command to run".to_string()))?;
    let options = TerminalOptions {
        title: args.title,
        cwd: args.cwd,
        shell_path,
        shell_args: command.collect(),
        env: args.env.unwrap_or_default(),
    };
    tracing::info!(cwd = %options.cwd, command = %options.shell_path, "Running debuggee in terminal");

    let instance = terminal.new_terminal(options).await?;
    terminal.activate(&instance);
    let process_id = instance.start().await?;

    Ok(serde_json::to_value(RunInTerminalResponseBody { process_id })?)
}
