//! dap-session - run debug configurations against Debug Adapter Protocol adapters

use clap::Parser;
use dap_session::common::logging;
use dap_session::{cli, commands::Commands};

#[derive(Parser)]
#[command(name = "dap-session", about = "Drive debug adapters from launch files")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { log_file: true, .. } => {
            if let Some(path) = logging::init_file() {
                eprintln!("Logging to {}", path.display());
            }
        }
        _ => logging::init_cli(),
    }

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
