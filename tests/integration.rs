//! End-to-end tests for the session manager
//!
//! Each test drives one or more scripted adapters through the public API:
//! the manager opens them via `MockTransport`, and the test emits adapter
//! events and reverse requests to exercise the lifecycle.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use dap_session::cli::LaunchFileBreakpoints;
use dap_session::common::config::{Config, LaunchBreakpoint};
use dap_session::session::{
    ContributionRegistry, DebugSessionManager, DebugState, ManagerServices, Message,
    MessageService, Terminal, TerminalOptions, TerminalService,
};
use dap_session::testing::{MockAdapter, MockTransport};
use dap_session::{DebugConfiguration, Error, Result};

/// Records user-facing notifications
#[derive(Default)]
struct RecordingMessages {
    shown: Mutex<Vec<Message>>,
}

#[async_trait]
impl MessageService for RecordingMessages {
    async fn show_message(&self, message: Message) -> Option<String> {
        self.shown.lock().unwrap().push(message);
        None
    }
}

/// Pretends to launch debuggees and remembers what it was asked to run
#[derive(Default)]
struct FakeTerminals {
    launched: Arc<Mutex<Vec<TerminalOptions>>>,
}

struct FakeTerminal {
    options: TerminalOptions,
    launched: Arc<Mutex<Vec<TerminalOptions>>>,
}

#[async_trait]
impl TerminalService for FakeTerminals {
    async fn new_terminal(&self, options: TerminalOptions) -> Result<Arc<dyn Terminal>> {
        Ok(Arc::new(FakeTerminal {
            options,
            launched: self.launched.clone(),
        }))
    }

    fn activate(&self, _terminal: &Arc<dyn Terminal>) {}
}

#[async_trait]
impl Terminal for FakeTerminal {
    async fn start(&self) -> Result<u32> {
        self.launched.lock().unwrap().push(self.options.clone());
        Ok(4242)
    }
}

/// Test context with the manager and everything it talks to
struct TestContext {
    manager: Arc<DebugSessionManager>,
    transport: Arc<MockTransport>,
    messages: Arc<RecordingMessages>,
    terminals: Arc<FakeTerminals>,
    started: Arc<Mutex<Vec<String>>>,
    destroyed: Arc<Mutex<Vec<String>>>,
    active_changes: Arc<Mutex<Vec<Option<String>>>>,
}

impl TestContext {
    fn new() -> Self {
        Self::with_transport(MockTransport::new())
    }

    fn with_setup<F>(setup: F) -> Self
    where
        F: Fn(&MockAdapter) + Send + Sync + 'static,
    {
        Self::with_transport(MockTransport::with_setup(setup))
    }

    fn with_transport(transport: MockTransport) -> Self {
        let transport = Arc::new(transport);
        let messages = Arc::new(RecordingMessages::default());
        let terminals = Arc::new(FakeTerminals::default());
        let breakpoints = LaunchFileBreakpoints::new(&[LaunchBreakpoint {
            path: "/work/src/main.rs".to_string(),
            line: 7,
            condition: None,
        }]);

        let mut config = Config::default();
        config.session.threads_debounce_ms = 20;
        let services = ManagerServices {
            transport: transport.clone(),
            debug: transport.clone(),
            terminal: terminals.clone(),
            breakpoints: Arc::new(breakpoints),
            messages: messages.clone(),
        };
        let manager = DebugSessionManager::new(services, ContributionRegistry::default(), &config);

        let started = Arc::new(Mutex::new(Vec::new()));
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let active_changes = Arc::new(Mutex::new(Vec::new()));
        {
            let started = started.clone();
            manager.on_did_start(move |s| started.lock().unwrap().push(s.id().to_string()));
        }
        {
            let destroyed = destroyed.clone();
            manager.on_did_destroy(move |s| destroyed.lock().unwrap().push(s.id().to_string()));
        }
        {
            let active_changes = active_changes.clone();
            manager.on_did_change_active(move |change| {
                let current = change.current.as_ref().map(|s| s.id().to_string());
                active_changes.lock().unwrap().push(current);
            });
        }

        Self {
            manager,
            transport,
            messages,
            terminals,
            started,
            destroyed,
            active_changes,
        }
    }

    fn adapter(&self, id: &str) -> Arc<MockAdapter> {
        self.transport.adapter(id).expect("adapter opened")
    }

    fn active_id(&self) -> Option<String> {
        self.manager.active_session().map(|s| s.id().to_string())
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    async fn start(&self, id: &str) {
        self.manager.create(id, launch_config(id)).await.unwrap();
        let expected = id.to_string();
        eventually("session start", || self.started().contains(&expected)).await;
    }
}

fn launch_config(name: &str) -> DebugConfiguration {
    DebugConfiguration::new("mock", "launch", name).with_field("program", json!("/work/app"))
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============== Lifecycle ==============

#[tokio::test]
async fn test_handshake_order() {
    let ctx = TestContext::new();
    ctx.start("s1").await;

    let adapter = ctx.adapter("s1");
    assert_eq!(
        adapter.commands(),
        vec!["initialize", "launch", "setBreakpoints", "configurationDone"]
    );

    let initialize = adapter.last_request("initialize").unwrap().arguments.unwrap();
    assert_eq!(initialize["adapterID"], "mock");
    assert_eq!(initialize["supportsRunInTerminalRequest"], true);

    let launch = adapter.last_request("launch").unwrap().arguments.unwrap();
    assert_eq!(launch["program"], "/work/app");
    assert_eq!(launch["__restart"], false);
    assert_eq!(launch["noDebug"], false);

    let session = ctx.manager.session("s1").unwrap();
    assert!(session.is_configured());
    assert_eq!(ctx.active_id().as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_unsupported_request_fails_before_io() {
    let ctx = TestContext::new();
    let config = DebugConfiguration::new("mock", "bogus", "broken");

    let result = ctx.manager.create("s1", config).await;

    assert!(matches!(result, Err(Error::UnsupportedRequest(ref kind)) if kind == "bogus"));
    assert!(ctx.transport.opened().is_empty());
    assert!(ctx.manager.active_session().is_none());
    assert!(ctx.manager.sessions().is_empty());
}

#[tokio::test]
async fn test_duplicate_session_id_rejected() {
    let ctx = TestContext::new();
    ctx.start("s1").await;

    let result = ctx.manager.create("s1", launch_config("again")).await;

    assert!(result.is_err());
    assert_eq!(ctx.transport.opened(), vec!["s1"]);
}

#[tokio::test]
async fn test_attach_omits_no_debug() {
    let ctx = TestContext::new();
    let config = DebugConfiguration::new("mock", "attach", "attach").with_field("processId", json!(77));
    ctx.manager.create("s1", config).await.unwrap();
    eventually("session start", || !ctx.started().is_empty()).await;

    let attach = ctx.adapter("s1").last_request("attach").unwrap().arguments.unwrap();
    assert_eq!(attach["processId"], 77);
    assert_eq!(attach["__restart"], false);
    assert!(attach.get("noDebug").is_none());
}

#[tokio::test]
async fn test_configuration_waits_for_initialized() {
    let ctx = TestContext::with_setup(|adapter| adapter.set_initialized_on_launch(false));
    ctx.manager.create("s1", launch_config("app")).await.unwrap();
    let adapter = ctx.adapter("s1");
    adapter.wait_for_requests("launch", 1).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(adapter.request_count("configurationDone"), 0);
    assert!(ctx.started().is_empty());

    adapter.emit_event("initialized", json!({})).await.unwrap();
    eventually("session start", || !ctx.started().is_empty()).await;
    assert_eq!(
        adapter.commands(),
        vec!["initialize", "launch", "setBreakpoints", "configurationDone"]
    );
}

#[tokio::test]
async fn test_destroy_promotes_remaining_session() {
    let ctx = TestContext::new();
    ctx.start("a").await;
    ctx.start("b").await;
    assert_eq!(ctx.active_id().as_deref(), Some("a"));

    ctx.manager.destroy(Some("a")).await;
    assert_eq!(ctx.active_id().as_deref(), Some("b"));

    ctx.manager.destroy(None).await;
    assert!(ctx.manager.active_session().is_none());
    assert!(ctx.manager.sessions().is_empty());
    assert_eq!(ctx.transport.stopped(), vec!["a", "b"]);
    assert_eq!(ctx.destroyed(), vec!["a", "b"]);
    assert_eq!(
        *ctx.active_changes.lock().unwrap(),
        vec![Some("a".to_string()), Some("b".to_string()), None]
    );
}

#[tokio::test]
async fn test_destroy_unknown_session_is_noop() {
    let ctx = TestContext::new();
    ctx.start("s1").await;

    ctx.manager.destroy(Some("missing")).await;

    assert!(ctx.transport.stopped().is_empty());
    assert!(ctx.destroyed().is_empty());
}

#[tokio::test]
async fn test_set_active_session_unknown_id() {
    let ctx = TestContext::new();
    ctx.start("s1").await;

    let err = ctx.manager.set_active_session(Some("nope")).unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
    assert_eq!(ctx.active_id().as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_launch_failure_reports_and_destroys() {
    let ctx = TestContext::with_setup(|adapter| adapter.fail("launch", "program not found"));

    ctx.manager.create("s1", launch_config("app")).await.unwrap();
    eventually("failure message", || !ctx.messages.shown.lock().unwrap().is_empty()).await;

    let shown = ctx.messages.shown.lock().unwrap().clone();
    assert_eq!(shown.len(), 1);
    assert!(shown[0].text.contains("program not found"));
    assert!(ctx.manager.sessions().is_empty());
    assert_eq!(ctx.transport.stopped(), vec!["s1"]);
    assert!(ctx.started().is_empty());
}

// ============== Adapter events ==============

#[tokio::test]
async fn test_terminated_with_restart_relaunches() {
    let ctx = TestContext::new();
    ctx.start("s1").await;
    let session = ctx.manager.session("s1").unwrap();
    let adapter = ctx.adapter("s1");

    adapter
        .emit_event("terminated", json!({ "restart": { "token": 1 } }))
        .await
        .unwrap();
    adapter.wait_for_requests("launch", 2).await;

    let disconnect = adapter.last_request("disconnect").unwrap().arguments.unwrap();
    assert_eq!(disconnect["restart"], true);
    let launch = adapter.last_request("launch").unwrap().arguments.unwrap();
    assert_eq!(launch["__restart"], json!({ "token": 1 }));
    assert_eq!(launch["program"], "/work/app");

    let current = ctx.manager.session("s1").unwrap();
    assert!(Arc::ptr_eq(&session, &current));
    assert!(ctx.destroyed().is_empty());
}

#[tokio::test]
async fn test_manual_restart_sends_true() {
    let ctx = TestContext::new();
    ctx.start("s1").await;
    let session = ctx.manager.session("s1").unwrap();

    ctx.manager.restart(&session, None).await.unwrap();

    let launch = ctx.adapter("s1").last_request("launch").unwrap().arguments.unwrap();
    assert_eq!(launch["__restart"], true);
    assert_eq!(ctx.adapter("s1").request_count("initialize"), 2);
}

#[tokio::test]
async fn test_terminated_without_restart_disconnects_only() {
    let ctx = TestContext::new();
    ctx.start("s1").await;
    let adapter = ctx.adapter("s1");

    adapter.emit_event("terminated", json!({})).await.unwrap();
    adapter.wait_for_requests("disconnect", 1).await;

    let disconnect = adapter.last_request("disconnect").unwrap().arguments.unwrap();
    assert_eq!(disconnect["restart"], false);
    assert_eq!(adapter.request_count("launch"), 1);
    assert!(ctx.manager.session("s1").is_some());
    assert!(ctx.transport.stopped().is_empty());

    adapter.emit_event("exited", json!({ "exitCode": 0 })).await.unwrap();
    eventually("destroy", || !ctx.destroyed().is_empty()).await;
    assert_eq!(ctx.transport.stopped(), vec!["s1"]);
}

#[tokio::test]
async fn test_exited_destroys_session() {
    let ctx = TestContext::new();
    ctx.start("s1").await;

    ctx.adapter("s1")
        .emit_event("exited", json!({ "exitCode": 0 }))
        .await
        .unwrap();
    eventually("destroy", || !ctx.destroyed().is_empty()).await;

    assert_eq!(ctx.destroyed(), vec!["s1"]);
    assert!(ctx.manager.active_session().is_none());
}

#[tokio::test]
async fn test_run_in_terminal_reverse_request() {
    let ctx = TestContext::new();
    ctx.start("s1").await;

    let response = ctx
        .adapter("s1")
        .send_request(
            "runInTerminal",
            json!({
                "kind": "integrated",
                "title": "app",
                "cwd": "/work",
                "args": ["/work/app", "--verbose"],
                "env": { "RUST_LOG": "debug", "UNSET_ME": null }
            }),
        )
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.body.unwrap()["processId"], 4242);

    let launched = ctx.terminals.launched.lock().unwrap().clone();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].cwd, "/work");
    assert_eq!(launched[0].shell_path, "/work/app");
    assert_eq!(launched[0].shell_args, vec!["--verbose"]);
    assert_eq!(launched[0].env.get("RUST_LOG"), Some(&Some("debug".to_string())));
    assert_eq!(launched[0].env.get("UNSET_ME"), Some(&None));
}

#[tokio::test]
async fn test_unknown_reverse_request_fails() {
    let ctx = TestContext::new();
    ctx.start("s1").await;

    let response = ctx
        .adapter("s1")
        .send_request("startDebugging", json!({ "request": "launch" }))
        .await
        .unwrap();

    assert!(!response.success);
}

#[tokio::test]
async fn test_stopped_session_becomes_active() {
    let ctx = TestContext::with_setup(|adapter| {
        adapter.set_threads(&[(1, "main")]);
        adapter.set_stack(1, &[(100, "main", 7)]);
    });
    ctx.start("a").await;
    ctx.start("b").await;
    assert_eq!(ctx.active_id().as_deref(), Some("a"));

    let frames = Arc::new(Mutex::new(Vec::new()));
    {
        let frames = frames.clone();
        ctx.manager.session("b").unwrap().on_frames_ready(move |thread| {
            let name = thread.current_frame().map(|f| f.raw().name.clone());
            frames.lock().unwrap().push((thread.id(), name));
        });
    }

    ctx.adapter("b")
        .emit_event(
            "stopped",
            json!({ "reason": "breakpoint", "threadId": 1, "allThreadsStopped": true }),
        )
        .await
        .unwrap();
    eventually("promotion", || ctx.active_id().as_deref() == Some("b")).await;

    let b = ctx.manager.session("b").unwrap();
    assert_eq!(b.state(), DebugState::Stopped);
    assert_eq!(b.current_thread().unwrap().id(), 1);

    eventually("frames", || !frames.lock().unwrap().is_empty()).await;
    assert_eq!(
        frames.lock().unwrap()[0],
        (1, Some("main".to_string()))
    );
}

#[tokio::test]
async fn test_running_session_does_not_take_focus_from_stopped() {
    let ctx = TestContext::with_setup(|adapter| adapter.set_threads(&[(1, "main")]));
    ctx.start("a").await;
    ctx.start("b").await;

    ctx.adapter("a")
        .emit_event("stopped", json!({ "reason": "pause", "threadId": 1 }))
        .await
        .unwrap();
    eventually("a stopped", || {
        ctx.manager.session("a").unwrap().state() == DebugState::Stopped
    })
    .await;

    ctx.adapter("b")
        .emit_event("stopped", json!({ "reason": "step", "threadId": 1 }))
        .await
        .unwrap();
    eventually("b stopped", || {
        ctx.manager.session("b").unwrap().state() == DebugState::Stopped
    })
    .await;

    assert_eq!(ctx.active_id().as_deref(), Some("a"));
}
