//! Treedb server binary: serve a disk-backed authority store over TCP.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use treedb::driver::DriverFactories;
use treedb::logging::{self, LogFormat};
use treedb::protocol::authority::Authority;
use treedb::{Config, Repository, RepositoryOptions};

#[derive(Parser)]
#[command(name = "treedb", about = "Synchronized hierarchical JSON document store")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "treedb.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines instead of text.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the data directory and serve mirrors over TCP.
    Serve {
        /// Listen address; overrides the config file.
        #[arg(short, long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(
        &cli.log_level,
        if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
    );

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve { listen } => {
            let addr = match listen.or_else(|| config.listen.clone()) {
                Some(addr) => addr,
                None => bail!("no listen address: pass --listen or set `listen` in the config"),
            };

            let options = RepositoryOptions {
                config,
                ..RepositoryOptions::default()
            };
            let repository =
                Repository::new(options, &DriverFactories::standard()).context("building repository")?;
            repository.open().await.context("opening repository")?;
            info!(entries = repository.entries().len(), "store loaded");

            let authority = Authority::new(
                std::sync::Arc::clone(repository.engine()),
                std::sync::Arc::clone(repository.driver()),
            );
            authority.start();

            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding {}", addr))?;
            authority.serve(listener).await?;
            Ok(())
        }
    }
}
