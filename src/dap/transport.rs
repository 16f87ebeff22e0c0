//! Transports that connect a session to its debug adapter

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::common::config::Config;
use crate::common::emitter::lock;
use crate::common::{Error, Result};
use crate::session::services::DebugService;

use super::connection::DapConnection;
use super::types::DebugConfiguration;

/// Opens one duplex channel to a debug adapter per session
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn open(
        &self,
        session_id: &str,
        config: &DebugConfiguration,
    ) -> Result<Arc<DapConnection>>;
}

/// Spawns the adapter executable and talks to it over stdin/stdout
pub struct StdioTransport {
    config: Config,
    children: Mutex<HashMap<String, Child>>,
}

impl StdioTransport {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Number of adapter processes currently owned
    pub fn running(&self) -> usize {
        lock(&self.children).len()
    }
}

#[async_trait]
impl TransportProvider for StdioTransport {
    async fn open(
        &self,
        session_id: &str,
        config: &DebugConfiguration,
    ) -> Result<Arc<DapConnection>> {
        let adapter = self.config.get_adapter(&config.debug_type).ok_or_else(|| {
            Error::adapter_not_found(&config.debug_type, &["[adapters] in config.toml", "PATH"])
        })?;

        tracing::info!(
            session = session_id,
            adapter = %adapter.path.display(),
            "Starting debug adapter"
        );

        let mut cmd = Command::new(&adapter.path);
        cmd.args(&adapter.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let adapter errors go to stderr
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::AdapterStartFailed(format!(
                "Failed to start {}: {}",
                adapter.path.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::AdapterStartFailed("Failed to get adapter stdin".to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::AdapterStartFailed("Failed to get adapter stdout".to_string())
        })?;

        if let Some(mut previous) = lock(&self.children).insert(session_id.to_string(), child) {
            tracing::warn!(session = session_id, "Replacing running adapter process");
            let _ = previous.start_kill();
        }

        Ok(Arc::new(DapConnection::new(session_id, stdout, stdin)))
    }
}

#[async_trait]
impl DebugService for StdioTransport {
    async fn stop(&self, session_id: &str) -> Result<()> {
        let child = lock(&self.children).remove(session_id);
        let Some(mut child) = child else {
            return Ok(());
        };

        match child.try_wait()? {
            Some(status) => {
                tracing::debug!(session = session_id, %status, "Adapter already exited");
            }
            None => {
                tracing::info!(session = session_id, "Stopping debug adapter");
                child.kill().await?;
            }
        }
        Ok(())
    }
}
