//! CLI command definitions
//!
//! Defines the clap commands for the ctlsock CLI.

use clap::{Args, Subcommand};

/// Where to rendezvous, shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct Target {
    /// Socket name or path (default: daemon.socket_name from config)
    #[arg(long, short)]
    pub name: Option<String>,

    /// Transport backend: local_socket or srv (default: from config)
    #[arg(long, short)]
    pub backend: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the echo daemon in the foreground
    Serve {
        #[command(flatten)]
        target: Target,
    },

    /// Send a message to the daemon and print the echoed reply
    Ping {
        #[command(flatten)]
        target: Target,

        /// Message to send
        #[arg(default_value = "PING")]
        message: String,

        /// Seconds to wait for the reply
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// Show the resolved rendezvous path and backend capabilities
    Info {
        #[command(flatten)]
        target: Target,
    },
}
