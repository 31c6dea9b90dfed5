//! Mender - autonomous CI/CD healing agent
//!
//! Clones a repository, finds failing tests and lint errors, repairs
//! them with deterministic tools and a multi-provider LLM ensemble,
//! validates every patch, and pushes the fixes on a dedicated branch.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mender::config::Config;
use mender::heal;
use mender::providers;
use mender::report::RunRequest;
use mender::server;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mender",
    about = "Autonomous CI/CD healing agent",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "8000")]
        port: u16,
    },
    /// Execute one healing run in the foreground and print the
    /// report JSON.
    Run {
        /// Repository to heal.
        repo_url: String,
        #[arg(long, default_value = "solo")]
        team_name: String,
        #[arg(long, default_value = "agent")]
        team_leader: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env();

    match cli.command {
        Commands::Serve { port } => {
            server::serve(port, cfg).await?;
        }
        Commands::Run {
            repo_url,
            team_name,
            team_leader,
        } => {
            let registry = providers::build_registry(&cfg)?;
            let request = RunRequest {
                repo_url,
                team_name,
                team_leader,
                auth_token: None,
            };
            let report = heal::run_healing(request, &cfg, registry).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
