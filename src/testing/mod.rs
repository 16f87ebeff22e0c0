//! Test support: an in-process scripted debug adapter

mod mock;

pub use mock::{MockAdapter, MockTransport};
