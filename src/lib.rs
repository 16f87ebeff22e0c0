//! dap-session - a client-side Debug Adapter Protocol session engine
//!
//! This library drives debug adapters over DAP: it multiplexes each adapter
//! connection, keeps a live thread/frame model per session, and manages the
//! lifecycle of many sessions at once.

pub mod cli;
pub mod commands;
pub mod common;
pub mod dap;
pub mod session;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use dap::{DapConnection, DebugConfiguration};
pub use session::{DebugSession, DebugSessionManager};
