//! gantryd — the Gantry daemon.
//!
//! One binary, two roles:
//! - `panel`: the control plane. Owns the inventory store, placement,
//!   server lifecycle, and the REST API operators and agents talk to.
//! - `agent`: the per-node daemon. Supervises server containers against
//!   the local container engine and serves the API the panel drives.
//!
//! # Usage
//!
//! ```text
//! gantryd panel --port 8443 --data-dir /var/lib/gantry
//! gantryd agent --config /etc/gantry/config.json
//! ```

mod agent_mode;
mod control_plane;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gantryd", about = "Gantry daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Panel {
        /// Port the REST API listens on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/gantry")]
        data_dir: PathBuf,

        /// Base URL agents reach this panel at. Defaults to this host's
        /// name and the listen port.
        #[arg(long)]
        remote_base: Option<String>,

        /// Seconds without an agent check-in before a node is marked
        /// offline.
        #[arg(long, default_value = "90")]
        node_stale_after: u64,

        /// Seconds between node liveness sweeps.
        #[arg(long, default_value = "30")]
        sweep_interval: u64,

        /// Seconds before a request to an agent times out.
        #[arg(long, default_value = "30")]
        request_timeout: u64,
    },

    /// Run the node agent.
    Agent {
        /// Path to the agent configuration file.
        #[arg(long, default_value = "/etc/gantry/config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gantryd=debug,gantry=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Panel {
            port,
            data_dir,
            remote_base,
            node_stale_after,
            sweep_interval,
            request_timeout,
        } => {
            control_plane::run_panel(
                port,
                data_dir,
                remote_base,
                node_stale_after,
                sweep_interval,
                request_timeout,
            )
            .await
        }
        Command::Agent { config } => agent_mode::run_agent(config).await,
    }
}
