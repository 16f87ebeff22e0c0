//! Debug Adapter Protocol (DAP) client plumbing
//!
//! Framing, the multiplexed connection, and transports that reach the
//! debug adapter process.

pub mod codec;
pub mod connection;
pub mod transport;
pub mod types;

pub use connection::DapConnection;
pub use transport::{StdioTransport, TransportProvider};
pub use types::*;
