//! tether: continuous one-way directory sync over TCP.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tether::{sync, transport, watcher};

#[derive(Parser)]
#[command(name = "tether", version)]
#[command(about = "Continuous one-way delta sync of a directory over TCP")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory: accept one client and mirror its changes
    Server {
        /// Directory to synchronize into
        dir: PathBuf,

        /// TCP port to listen on
        port: u16,
    },

    /// Watch a directory and push its changes to a server
    Client {
        /// Directory to watch
        dir: PathBuf,

        /// Server address (host:port)
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Server { dir, port } => {
            let stream = transport::listen_one(port).await?;
            let (reader, writer) = stream.into_split();
            sync::server::run(dir, reader, writer).await
        }
        Commands::Client { dir, addr } => {
            let stream = transport::dial(&addr).await?;
            let (reader, writer) = stream.into_split();

            let (events, watcher_task) = watcher::spawn(&dir);
            tokio::select! {
                r = sync::client::run(dir, reader, writer, events) => r,
                r = watcher_task => r.context("watcher task panicked")?,
            }
        }
    }
}
