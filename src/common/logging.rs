//! Logging and tracing configuration
//!
//! Logs are controlled by the `RUST_LOG` environment variable.

use std::path::PathBuf;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

use super::paths;

const LOG_FILE: &str = "dap-session.log";

/// Initialize tracing for the CLI (stderr logging)
///
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dap_session=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer())
        .init();
}

fn stderr_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
}

/// Initialize tracing to stderr plus a log file with full protocol traces
///
/// The file lives at `<data_dir>/logs/dap-session.log`; if it cannot be
/// opened only stderr logging is installed. Returns the log file path.
pub fn init_file() -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dap_session=trace,info"));

    let log_file = paths::log_dir().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        let path = dir.join(LOG_FILE);
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some((path, file)),
            Err(e) => {
                eprintln!("Warning: Could not open log file: {}", e);
                None
            }
        }
    });

    match log_file {
        Some((path, file)) => {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .with(stderr_layer())
                .init();
            Some(path)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer())
                .init();
            None
        }
    }
}
