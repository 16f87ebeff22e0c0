//! Terminal service that runs the debuggee as a plain child process

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::common::emitter::lock;
use crate::common::{Error, Result};
use crate::session::{Terminal, TerminalOptions, TerminalService};

/// Spawns `runInTerminal` commands with inherited stdio
#[derive(Default)]
pub struct ProcessTerminalService {
    children: Arc<Mutex<Vec<Child>>>,
}

impl ProcessTerminalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill every process started through this service
    pub fn kill_all(&self) {
        for mut child in lock(&self.children).drain(..) {
            let _ = child.start_kill();
        }
    }
}

#[async_trait]
impl TerminalService for ProcessTerminalService {
    async fn new_terminal(&self, options: TerminalOptions) -> Result<Arc<dyn Terminal>> {
        Ok(Arc::new(ProcessTerminal {
            options,
            children: self.children.clone(),
        }))
    }

    fn activate(&self, _terminal: &Arc<dyn Terminal>) {
        // Output already goes to our own terminal
        tracing::debug!("Terminal activated");
    }
}

struct ProcessTerminal {
    options: TerminalOptions,
    children: Arc<Mutex<Vec<Child>>>,
}

#[async_trait]
impl Terminal for ProcessTerminal {
    async fn start(&self) -> Result<u32> {
        let options = &self.options;
        let mut cmd = Command::new(&options.shell_path);
        cmd.args(&options.shell_args);
        if !options.cwd.is_empty() {
            cmd.current_dir(&options.cwd);
        }
        for (key, value) in &options.env {
            match value {
                Some(value) => cmd.env(key, value),
                None => cmd.env_remove(key),
            };
        }

        let child = cmd.spawn().map_err(|e| {
            Error::TerminalFailed(format!("{}: {}", options.shell_path, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| Error::TerminalFailed("process exited before reporting its id".to_string()))?;

        tracing::info!(
            pid,
            title = ?options.title,
            command = %options.shell_path,
            "Started debuggee process"
        );
        lock(&self.children).push(child);
        Ok(pid)
    }
}
