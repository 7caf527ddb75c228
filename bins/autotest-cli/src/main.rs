mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "autotest-cli")]
#[command(about = "Autotest CLI - Install the autotester and manage its users and queues", long_about = None)]
struct Cli {
    /// Configuration file (defaults to AUTOTEST_CONFIG or config/autotest.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check workers and testers, create the workspace and record the schema
    Install,

    /// Register an API user and print its key
    Register {
        /// User name
        name: String,

        /// Authentication type stored with the credentials
        #[arg(long)]
        auth_type: Option<String>,
    },

    /// Show pending jobs and pop rate per queue
    Queues,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Install => {
            commands::install(&config).await?;
        }
        Commands::Register { name, auth_type } => {
            commands::register(&config, &name, auth_type.as_deref()).await?;
        }
        Commands::Queues => {
            commands::show_queues(&config).await?;
        }
    }

    Ok(())
}
