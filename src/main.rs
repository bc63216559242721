//! ctlsock - local control-socket tool
//!
//! Runs a reference daemon behind the control socket and pokes it from the
//! command line, over whichever transport backend is configured.

use clap::Parser;
use commands::Commands;
use ctlsock::common::{config::Config, logging};
use ctlsock::{cli, commands, daemon};

#[derive(Parser)]
#[command(name = "ctlsock", about = "Local control-socket transport tool")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { .. } => {
            if let Some(path) = logging::init_daemon() {
                tracing::debug!(log = %path.display(), "Logging to file");
            }
        }
        _ => logging::init_cli(),
    }

    let result = match Config::load() {
        Ok(config) => match cli.command {
            Commands::Serve { target } => match cli::resolve(&target, &config) {
                Ok(strategy) => daemon::run(strategy).await,
                Err(e) => Err(e),
            },
            command => cli::dispatch(command, &config).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error [{}]: {e}", e.code());
        std::process::exit(1);
    }
}
