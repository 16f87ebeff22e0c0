//! Debug session engine
//!
//! Sessions reconcile adapter events into a thread/frame model; the manager
//! owns their lifecycle.

pub mod contribution;
pub mod debounce;
pub mod manager;
pub mod services;
#[allow(clippy::module_inception)]
pub mod session;
pub mod thread;

pub use contribution::{
    ContributionRegistry, DebugSessionContribution, DebugSessionFactory, DefaultSessionFactory,
};
pub use manager::{ActiveSessionChange, DebugSessionManager, ManagerServices, RequestKind};
pub use services::{
    BreakpointApplier, DebugService, Message, MessageService, MessageType, Terminal,
    TerminalOptions, TerminalService,
};
pub use session::{DebugSession, DebugState, SessionOptions};
pub use thread::{DebugStackFrame, DebugThread, StoppedDetails, ThreadState};
