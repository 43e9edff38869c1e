use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shenyu-register")]
#[command(about = "Publish an application's routes to the gateway registration backend")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "register.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,

    /// Publish a route set
    Publish {
        /// Route set file (metadata and uris)
        #[arg(short, long, default_value = "routes.yaml")]
        routes: PathBuf,

        /// Keep the registration alive until Ctrl-C
        #[arg(long)]
        hold: bool,
    },

    /// Print the keys a route set would be written to, without connecting
    Keys {
        /// Route set file (metadata and uris)
        #[arg(short, long, default_value = "routes.yaml")]
        routes: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate => commands::validate::run(&cli.config).await,
        Commands::Publish { routes, hold } => commands::publish::run(&cli.config, &routes, hold).await,
        Commands::Keys { routes } => commands::keys::run(&cli.config, &routes).await,
    }
}
