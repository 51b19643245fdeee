use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use coverage_bot::api::{AppState, start_api};
use coverage_bot::config::Config;
use coverage_bot::db::{BotDb, DbHandle};
use coverage_bot::host::GithubHost;
use coverage_bot::worker::run_worker;

#[derive(Parser)]
#[command(name = "coverage-bot")]
#[command(version, about = "Automated test generation for TypeScript repositories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API process (commands in, snapshots out)
    Api {
        /// Port to serve on (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the worker process (queue consumers + sandbox)
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Api { port } => {
            let port = port.unwrap_or(config.port);
            let db = DbHandle::new(BotDb::new(&config.db_path)?);
            let host = Arc::new(GithubHost::new(
                config.github_token.clone(),
                config.clone_base_path.clone(),
            ));
            let state = Arc::new(AppState { db, host });
            start_api(state, port).await
        }
        Commands::Worker => run_worker(config).await,
    }
}
