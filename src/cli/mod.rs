//! CLI command handling
//!
//! Resolves the rendezvous strategy, talks to the daemon, and turns transport
//! errors into guidance for the operator.

use std::time::Duration;

use crate::commands::{Commands, Target};
use crate::common::{config::Config, logging, paths, Error, Result};
use crate::ipc::{backend_for, BackendKind, ConnectionStrategy, DaemonClient};

/// Resolve the strategy for a command target
pub fn resolve(target: &Target, config: &Config) -> Result<ConnectionStrategy> {
    let name = target
        .name
        .as_deref()
        .unwrap_or(&config.daemon.socket_name);

    let strategy = match target.backend.as_deref() {
        Some(backend) => ConnectionStrategy::resolve_with(BackendKind::parse(backend)?, name, config),
        None => ConnectionStrategy::resolve(name, config),
    };
    Ok(strategy)
}

/// Dispatch a CLI command
pub async fn dispatch(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Serve { .. } => {
            // Should never happen - daemon mode is handled in main
            Err(Error::Config("serve is handled by the daemon entry point".to_string()))
        }

        Commands::Ping {
            target,
            message,
            timeout,
        } => {
            let strategy = resolve(&target, config)?;
            let client = DaemonClient::connect(&strategy).await.map_err(explain)?;

            let reply = client
                .echo(message.as_bytes(), Duration::from_secs(timeout))
                .await?;
            println!("{}", String::from_utf8_lossy(&reply));

            client.close().await
        }

        Commands::Info { target } => {
            let strategy = resolve(&target, config)?;
            let backend = backend_for(strategy.backend())?;
            let caps = backend.capabilities();

            println!("Backend:      {}", backend.kind());
            println!("Path:         {}", strategy.path().display());
            println!("Deadlines:    {}", if caps.deadlines { "supported" } else { "unsupported" });
            println!("Multi-accept: {}", if caps.multi_accept { "yes" } else { "no (one peer per listen)" });
            println!(
                "Handshake:    {:?}, timeout {} ms",
                String::from_utf8_lossy(crate::ipc::handshake::TOKEN),
                strategy.handshake_timeout().as_millis()
            );
            if let Some(path) = paths::config_path() {
                println!("Config:       {}", path.display());
            }
            if let Some(path) = logging::daemon_log_path() {
                println!("Daemon log:   {}", path.display());
            }
            Ok(())
        }
    }
}

/// Add operator guidance to transport errors
fn explain(err: Error) -> Error {
    match err {
        Error::NotFound(path) => Error::Config(format!(
            "no daemon is accepting at '{path}'. Start one with 'ctlsock serve', or retry if it is busy with another client"
        )),
        Error::PermissionDenied(path) => Error::Config(format!(
            "not allowed to open '{path}'. The daemon belongs to another user"
        )),
        other => other,
    }
}
