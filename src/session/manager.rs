//! Session registry and lifecycle
//!
//! The manager opens the transport for a new session, runs the
//! initialize → launch/attach → breakpoints → configurationDone handshake,
//! reacts to terminal adapter events and tracks which session is active.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Map, Value};

use crate::common::config::{ClientSettings, Config, SessionSettings};
use crate::common::emitter::lock;
use crate::common::{Emitter, Error, Result, Subscription};
use crate::dap::transport::TransportProvider;
use crate::dap::{
    DebugConfiguration, DisconnectArguments, EventMessage, InitializeArguments,
    TerminatedEventBody,
};

use super::contribution::ContributionRegistry;
use super::services::{
    BreakpointApplier, DebugService, Message, MessageService, TerminalService,
};
use super::session::{DebugSession, DebugState, SessionOptions};

/// How a configuration reaches its debuggee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Launch,
    Attach,
}

impl RequestKind {
    pub fn parse(request: &str) -> Result<Self> {
        match request {
            "launch" => Ok(Self::Launch),
            "attach" => Ok(Self::Attach),
            other => Err(Error::UnsupportedRequest(other.to_string())),
        }
    }

    pub fn command(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Attach => "attach",
        }
    }
}

/// Collaborators the manager drives
#[derive(Clone)]
pub struct ManagerServices {
    pub transport: Arc<dyn TransportProvider>,
    pub debug: Arc<dyn DebugService>,
    pub terminal: Arc<dyn TerminalService>,
    pub breakpoints: Arc<dyn BreakpointApplier>,
    pub messages: Arc<dyn MessageService>,
}

/// Payload of the active-session notification
#[derive(Debug, Clone)]
pub struct ActiveSessionChange {
    pub previous: Option<Arc<DebugSession>>,
    pub current: Option<Arc<DebugSession>>,
}

struct ManagedSession {
    session: Arc<DebugSession>,
    subscriptions: Vec<Subscription>,
}

#[derive(Default)]
struct ManagerState {
    sessions: BTreeMap<String, ManagedSession>,
    active: Option<String>,
}

/// Owner of every debug session
pub struct DebugSessionManager {
    this: Weak<Self>,
    services: ManagerServices,
    contributions: ContributionRegistry,
    settings: SessionSettings,
    client: ClientSettings,
    state: Mutex<ManagerState>,
    will_create: Emitter<String>,
    did_create: Emitter<Arc<DebugSession>>,
    did_destroy: Emitter<Arc<DebugSession>>,
    did_change_active: Emitter<ActiveSessionChange>,
    did_start: Emitter<Arc<DebugSession>>,
}

impl DebugSessionManager {
    pub fn new(
        services: ManagerServices,
        contributions: ContributionRegistry,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            services,
            contributions,
            settings: config.session.clone(),
            client: config.client.clone(),
            state: Mutex::new(ManagerState::default()),
            will_create: Emitter::new(),
            did_create: Emitter::new(),
            did_destroy: Emitter::new(),
            did_change_active: Emitter::new(),
            did_start: Emitter::new(),
        })
    }

    // === Registry ===

    /// Every registered session, ordered by id
    pub fn sessions(&self) -> Vec<Arc<DebugSession>> {
        lock(&self.state)
            .sessions
            .values()
            .map(|managed| managed.session.clone())
            .collect()
    }

    pub fn session(&self, id: &str) -> Option<Arc<DebugSession>> {
        lock(&self.state)
            .sessions
            .get(id)
            .map(|managed| managed.session.clone())
    }

    pub fn active_session(&self) -> Option<Arc<DebugSession>> {
        let state = lock(&self.state);
        state
            .active
            .as_ref()
            .and_then(|id| state.sessions.get(id))
            .map(|managed| managed.session.clone())
    }

    /// Make `id` the active session, or clear the active session
    pub fn set_active_session(&self, id: Option<&str>) -> Result<()> {
        let change = {
            let mut state = lock(&self.state);
            if let Some(id) = id {
                if !state.sessions.contains_key(id) {
                    return Err(Error::SessionNotFound(id.to_string()));
                }
            }
            if state.active.as_deref() == id {
                return Ok(());
            }
            let previous = state
                .active
                .take()
                .and_then(|old| state.sessions.get(&old))
                .map(|managed| managed.session.clone());
            state.active = id.map(str::to_string);
            let current = id
                .and_then(|id| state.sessions.get(id))
                .map(|managed| managed.session.clone());
            ActiveSessionChange { previous, current }
        };
        tracing::debug!(session = ?id, "Active session changed");
        self.did_change_active.fire(&change);
        Ok(())
    }

    // === Notifications ===

    pub fn on_will_create<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.will_create.subscribe(listener)
    }

    pub fn on_did_create<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<DebugSession>) + Send + Sync + 'static,
    {
        self.did_create.subscribe(listener)
    }

    pub fn on_did_destroy<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<DebugSession>) + Send + Sync + 'static,
    {
        self.did_destroy.subscribe(listener)
    }

    pub fn on_did_change_active<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ActiveSessionChange) + Send + Sync + 'static,
    {
        self.did_change_active.subscribe(listener)
    }

    /// Fires once a session has finished its configuration handshake
    pub fn on_did_start<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<DebugSession>) + Send + Sync + 'static,
    {
        self.did_start.subscribe(listener)
    }

    // === Lifecycle ===

    /// Create, register and start a session
    ///
    /// Returns once the session is registered; launch/attach continues in
    /// the background. An unknown request kind fails before any I/O.
    #[tracing::instrument(skip(self, config), fields(debug_type = %config.debug_type))]
    pub async fn create(&self, id: &str, config: DebugConfiguration) -> Result<Arc<DebugSession>> {
        RequestKind::parse(&config.request)?;
        if self.session(id).is_some() {
            return Err(Error::Internal(format!("Debug session '{}' already exists", id)));
        }

        self.will_create.fire(&id.to_string());
        let connection = self.services.transport.open(id, &config).await?;

        let factory = self.contributions.factory(&config.debug_type);
        let options = SessionOptions {
            settings: self.settings.clone(),
            terminal: self.services.terminal.clone(),
        };
        let session = factory.create(id, config, connection, options);
        let subscriptions = self.wire(&session);

        let became_active = {
            let mut state = lock(&self.state);
            state.sessions.insert(
                id.to_string(),
                ManagedSession {
                    session: session.clone(),
                    subscriptions,
                },
            );
            if state.active.is_none() {
                state.active = Some(id.to_string());
                true
            } else {
                false
            }
        };
        tracing::info!(session = id, "Debug session created");

        self.did_create.fire(&session);
        if became_active {
            self.did_change_active.fire(&ActiveSessionChange {
                previous: None,
                current: Some(session.clone()),
            });
        }

        if let Some(manager) = self.this.upgrade() {
            let started = session.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.launch_or_attach(&started, None).await {
                    tracing::debug!(session = %started.id(), error = %e, "Session did not start");
                }
            });
        }
        Ok(session)
    }

    /// Initialize the adapter, then send `launch` or `attach`
    ///
    /// On failure the session is destroyed and the user is notified before
    /// the error is returned.
    #[tracing::instrument(skip(self, session, restart), fields(session = %session.id()))]
    pub async fn launch_or_attach(
        &self,
        session: &Arc<DebugSession>,
        restart: Option<Value>,
    ) -> Result<()> {
        let configuration = session.configuration();
        let kind = RequestKind::parse(&configuration.request)?;

        let result = async {
            session
                .initialize(self.initialize_arguments(&configuration.debug_type))
                .await?;
            let arguments = launch_arguments(configuration, kind, restart);
            session
                .send_request(kind.command(), Some(Value::Object(arguments)))
                .await?;
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to {} debuggee", kind.command());
            self.destroy(Some(session.id())).await;
            let text = format!(
                "Debug session '{}' failed to start: {}",
                configuration.name, e
            );
            self.services.messages.show_message(Message::error(text)).await;
            return Err(e);
        }
        tracing::info!("Debuggee {}ed", kind.command());
        Ok(())
    }

    /// Restart a session in place, keeping its id and configuration
    ///
    /// `restart` is handed to the adapter as `__restart`; `None` sends `true`.
    #[tracing::instrument(skip(self, session, restart), fields(session = %session.id()))]
    pub async fn restart(&self, session: &Arc<DebugSession>, restart: Option<Value>) -> Result<()> {
        tracing::info!("Restarting debug session");
        session
            .disconnect(DisconnectArguments {
                restart: true,
                terminate_debuggee: None,
            })
            .await?;
        session.clear_threads();
        self.launch_or_attach(session, Some(restart.unwrap_or(Value::Bool(true))))
            .await
    }

    /// Destroy one session, or every session when `id` is `None`
    pub async fn destroy(&self, id: Option<&str>) {
        match id {
            Some(id) => self.destroy_one(id).await,
            None => {
                let ids: Vec<String> = lock(&self.state).sessions.keys().cloned().collect();
                for id in ids {
                    self.destroy_one(&id).await;
                }
            }
        }
    }

    async fn destroy_one(&self, id: &str) {
        if self.session(id).is_none() {
            return;
        }
        if let Err(e) = self.services.debug.stop(id).await {
            tracing::warn!(session = id, error = %e, "Failed to stop debug adapter");
        }

        let (managed, promoted) = {
            let mut state = lock(&self.state);
            let Some(managed) = state.sessions.remove(id) else {
                return;
            };
            let promoted = if state.active.as_deref() == Some(id) {
                state.active = state.sessions.keys().next().cloned();
                Some(
                    state
                        .active
                        .as_ref()
                        .and_then(|next| state.sessions.get(next))
                        .map(|next| next.session.clone()),
                )
            } else {
                None
            };
            (managed, promoted)
        };

        for subscription in managed.subscriptions {
            subscription.dispose();
        }
        managed.session.dispose();
        tracing::info!(session = id, "Debug session destroyed");

        self.did_destroy.fire(&managed.session);
        if let Some(current) = promoted {
            self.did_change_active.fire(&ActiveSessionChange {
                previous: Some(managed.session.clone()),
                current,
            });
        }
    }

    // === Handshake and adapter events ===

    fn initialize_arguments(&self, adapter_id: &str) -> InitializeArguments {
        InitializeArguments {
            client_id: Some(self.client.client_id.clone()),
            client_name: Some(self.client.client_name.clone()),
            adapter_id: adapter_id.to_string(),
            locale: Some(self.client.locale.clone()),
            lines_start_at1: true,
            columns_start_at1: true,
            path_format: Some("path".to_string()),
            supports_variable_type: true,
            supports_variable_paging: true,
            supports_run_in_terminal_request: true,
        }
    }

    fn wire(&self, session: &Arc<DebugSession>) -> Vec<Subscription> {
        vec![
            self.on_session_event(session, "initialized", |manager, session, _| {
                tokio::spawn(async move { manager.configure(&session).await });
            }),
            self.on_session_event(session, "terminated", |manager, session, event| {
                let body: TerminatedEventBody = event.body_as().unwrap_or_default();
                let restart = body.restart_arg().cloned();
                tokio::spawn(async move { manager.on_terminated(&session, restart).await });
            }),
            self.on_session_event(session, "exited", |manager, session, _| {
                tokio::spawn(async move { manager.destroy(Some(session.id())).await });
            }),
            {
                let manager = self.this.clone();
                let weak = Arc::downgrade(session);
                session.on_did_change(move |_| {
                    if let (Some(manager), Some(session)) = (manager.upgrade(), weak.upgrade()) {
                        manager.promote_if_stopped(&session);
                    }
                })
            },
        ]
    }

    /// Subscribe to a session event without keeping the session or manager alive
    fn on_session_event<F>(&self, session: &Arc<DebugSession>, event: &str, handler: F) -> Subscription
    where
        F: Fn(Arc<Self>, Arc<DebugSession>, &EventMessage) + Send + Sync + 'static,
    {
        let manager = self.this.clone();
        let weak = Arc::downgrade(session);
        session.on(event, move |message| {
            if let (Some(manager), Some(session)) = (manager.upgrade(), weak.upgrade()) {
                handler(manager, session, message);
            }
        })
    }

    /// Apply breakpoints, then finish configuration
    async fn configure(&self, session: &Arc<DebugSession>) {
        if let Err(e) = self
            .services
            .breakpoints
            .apply_session_breakpoints(session)
            .await
        {
            tracing::warn!(session = %session.id(), error = %e, "Failed to apply breakpoints");
        }
        match session.configuration_done().await {
            Ok(()) => self.did_start.fire(session),
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "configurationDone failed");
            }
        }
    }

    async fn on_terminated(&self, session: &Arc<DebugSession>, restart: Option<Value>) {
        match restart {
            Some(restart) => {
                if let Err(e) = self.restart(session, Some(restart)).await {
                    tracing::warn!(session = %session.id(), error = %e, "Restart failed");
                }
            }
            None => {
                // The session is destroyed once the adapter reports `exited`
                if let Err(e) = session.disconnect(DisconnectArguments::default()).await {
                    tracing::debug!(session = %session.id(), error = %e, "Disconnect after terminate failed");
                }
            }
        }
    }

    /// A session that just stopped takes focus from one that is not stopped
    fn promote_if_stopped(&self, session: &Arc<DebugSession>) {
        if session.state() != DebugState::Stopped {
            return;
        }
        if let Some(active) = self.active_session() {
            if active.id() == session.id() || active.state() == DebugState::Stopped {
                return;
            }
        }
        if let Err(e) = self.set_active_session(Some(session.id())) {
            tracing::debug!(session = %session.id(), error = %e, "Could not activate session");
        }
    }
}

/// The user configuration plus the restart and no-debug markers
fn launch_arguments(
    configuration: &DebugConfiguration,
    kind: RequestKind,
    restart: Option<Value>,
) -> Map<String, Value> {
    let mut arguments = configuration.to_arguments();
    arguments.insert(
        "__restart".to_string(),
        restart.unwrap_or(Value::Bool(false)),
    );
    if kind == RequestKind::Launch {
        arguments
            .entry("noDebug")
            .or_insert(Value::Bool(false));
    }
    arguments
}
