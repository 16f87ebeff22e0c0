//! Common utilities shared by the engine and the CLI

pub mod config;
pub mod emitter;
pub mod error;
pub mod logging;
pub mod paths;

pub use emitter::{Emitter, Subscription};
pub use error::{Error, Result};
