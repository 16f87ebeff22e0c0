//! CLI command handling
//!
//! Runs launch-file configurations through the session manager and prints
//! what the debuggee does.

mod breakpoints;
mod terminal;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::commands::Commands;
use crate::common::config::{Config, LaunchFile};
use crate::common::{paths, Error, Result};
use crate::dap::StdioTransport;
use crate::session::{
    ContributionRegistry, DebugSession, DebugSessionManager, DebugThread, ManagerServices,
    Message, MessageService, MessageType,
};

pub use breakpoints::LaunchFileBreakpoints;
pub use terminal::ProcessTerminalService;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            launch_file,
            name,
            stay_stopped,
            log_file: _,
        } => run(&launch_file, name.as_deref(), stay_stopped).await,
        Commands::Adapters => adapters(),
    }
}

/// Prints notifications to stderr and counts errors
#[derive(Default)]
struct ConsoleMessages {
    errors: AtomicUsize,
}

#[async_trait]
impl MessageService for ConsoleMessages {
    async fn show_message(&self, message: Message) -> Option<String> {
        if message.kind == MessageType::Error {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        eprintln!("{}: {}", message.kind, message.text);
        None
    }
}

async fn run(launch_file: &Path, name: Option<&str>, stay_stopped: bool) -> Result<()> {
    let config = Config::load()?;
    let launch = LaunchFile::load(launch_file)?;
    let configuration = launch.configuration(name).cloned().ok_or_else(|| {
        Error::Config(match name {
            Some(name) => format!("No configuration named '{}' in {}", name, launch_file.display()),
            None => format!("No configurations in {}", launch_file.display()),
        })
    })?;

    let transport = Arc::new(StdioTransport::new(config.clone()));
    let terminals = Arc::new(ProcessTerminalService::new());
    let messages = Arc::new(ConsoleMessages::default());
    let services = ManagerServices {
        transport: transport.clone(),
        debug: transport.clone(),
        terminal: terminals.clone(),
        breakpoints: Arc::new(LaunchFileBreakpoints::new(&launch.breakpoints)),
        messages: messages.clone(),
    };
    let manager = DebugSessionManager::new(services, ContributionRegistry::default(), &config);

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    manager.on_did_create(move |session| watch_session(session, stay_stopped));
    manager.on_did_start(|session| {
        println!("Session '{}' started", session.configuration().name);
    });
    manager.on_did_destroy(move |session| {
        println!("Session '{}' ended", session.configuration().name);
        let _ = ended_tx.send(session.id().to_string());
    });

    manager.create("1", configuration).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, stopping sessions");
                manager.destroy(None).await;
                break;
            }
            ended = ended_rx.recv() => {
                if ended.is_none() || manager.sessions().is_empty() {
                    break;
                }
            }
        }
    }
    terminals.kill_all();

    if messages.errors.load(Ordering::SeqCst) > 0 {
        return Err(Error::AdapterStartFailed(
            "debug session failed to start".to_string(),
        ));
    }
    Ok(())
}

/// Print stops and program output for one session
fn watch_session(session: &Arc<DebugSession>, stay_stopped: bool) {
    session.on("output", |event| {
        let Some(body) = &event.body else { return };
        let output = body.get("output").and_then(|o| o.as_str()).unwrap_or_default();
        match body.get("category").and_then(|c| c.as_str()) {
            Some("stderr") => eprint!("{}", output),
            Some("telemetry") => {}
            _ => print!("{}", output),
        }
    });

    let weak = Arc::downgrade(session);
    session.on_frames_ready(move |thread| {
        print_stop(thread);
        if stay_stopped {
            return;
        }
        if let Some(session) = weak.upgrade() {
            tokio::spawn(async move { session.continue_all().await });
        }
    });
}

fn print_stop(thread: &Arc<DebugThread>) {
    let reason = thread
        .stopped_details()
        .map(|d| d.reason)
        .unwrap_or_default();
    println!("Thread {} ({}) stopped: {}", thread.id(), thread.name(), reason);

    if let Some(frame) = thread.current_frame() {
        let raw = frame.raw();
        let location = raw
            .source
            .as_ref()
            .and_then(|s| s.path.clone().or_else(|| s.name.clone()))
            .unwrap_or_else(|| "<unknown>".to_string());
        println!("  at {} ({}:{})", raw.name, location, raw.line);
    }
}

fn adapters() -> Result<()> {
    let config = Config::load()?;

    match paths::config_path() {
        Some(path) => println!("Config: {}", path.display()),
        None => println!("Config: <no config directory>"),
    }

    if config.adapters.is_empty() {
        println!("No adapters configured; adapters are looked up on PATH by debug type.");
        return Ok(());
    }

    let mut names: Vec<&String> = config.adapters.keys().collect();
    names.sort();
    for name in names {
        let adapter = &config.adapters[name];
        let status = if adapter.path.exists() { "ok" } else { "missing" };
        println!(
            "  {:<12} {} {} [{}]",
            name,
            adapter.path.display(),
            adapter.args.join(" "),
            status
        );
    }
    Ok(())
}
