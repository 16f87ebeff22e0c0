//! CLI command definitions
//!
//! Defines the clap commands for the dap-session CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a configuration from a launch file until every session ends
    Run {
        /// Path to the launch file (TOML with [[configurations]])
        launch_file: PathBuf,

        /// Configuration to run (default: the first one)
        #[arg(long, short)]
        name: Option<String>,

        /// Pause at every stop instead of continuing automatically
        #[arg(long)]
        stay_stopped: bool,

        /// Also write full protocol traces to the log file
        #[arg(long)]
        log_file: bool,
    },

    /// List configured debug adapters
    Adapters,
}
