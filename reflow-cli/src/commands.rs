//! Subcommands for one-shot run management.

use anyhow::{Context, Result};
use clap::Subcommand;

use reflow_core::{AgentTransport, Config, HttpAgentTransport};

/// Run management commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Query the current status of an agent run
    Status {
        /// The run to query
        run_id: String,
    },

    /// Request cancellation of an agent run
    Stop {
        /// The run to stop
        run_id: String,
    },
}

/// Build the HTTP transport from configuration.
pub fn build_transport(config: &Config) -> HttpAgentTransport {
    let transport = HttpAgentTransport::new(&config.base_url);
    match config.api_key {
        Some(ref key) => transport.with_api_key(key),
        None => transport,
    }
}

/// Execute a subcommand against the configured API.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let transport = build_transport(config);

    match command {
        Commands::Status { run_id } => {
            let response = transport
                .get_agent_status(&run_id)
                .await
                .context("Failed to query agent status")?;
            match response.error {
                Some(error) => println!("{} ({})", response.status, error),
                None => println!("{}", response.status),
            }
            Ok(())
        }
        Commands::Stop { run_id } => {
            transport
                .stop_agent(&run_id)
                .await
                .context("Failed to stop agent run")?;
            println!("Stop requested for {run_id}");
            Ok(())
        }
    }
}
