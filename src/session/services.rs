//! Collaborators the session engine consumes but does not implement

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::Result;

use super::session::DebugSession;

/// Severity of a user-visible message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Error,
    Warning,
    Info,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A notification shown to the user
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    pub text: String,
    /// Action labels the user may pick from
    pub actions: Vec<String>,
}

impl Message {
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            text: text.into(),
            actions: Vec::new(),
        }
    }
}

#[async_trait]
pub trait MessageService: Send + Sync {
    /// Show `message`; returns the chosen action, if any
    async fn show_message(&self, message: Message) -> Option<String>;
}

/// What the adapter asked to run in a terminal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminalOptions {
    pub title: Option<String>,
    pub cwd: String,
    pub shell_path: String,
    pub shell_args: Vec<String>,
    /// `None` values unset the variable
    pub env: HashMap<String, Option<String>>,
}

#[async_trait]
pub trait Terminal: Send + Sync {
    /// Start the terminal's process and return its process id
    async fn start(&self) -> Result<u32>;
}

#[async_trait]
pub trait TerminalService: Send + Sync {
    async fn new_terminal(&self, options: TerminalOptions) -> Result<Arc<dyn Terminal>>;

    /// Bring the terminal to the user's attention
    fn activate(&self, terminal: &Arc<dyn Terminal>);
}

/// Pushes the user's breakpoints to a freshly initialized adapter
#[async_trait]
pub trait BreakpointApplier: Send + Sync {
    async fn apply_session_breakpoints(&self, session: &Arc<DebugSession>) -> Result<()>;
}

/// Backend bookkeeping for adapter processes
#[async_trait]
pub trait DebugService: Send + Sync {
    /// Stop whatever runs on behalf of `session_id`
    async fn stop(&self, session_id: &str) -> Result<()>;
}
