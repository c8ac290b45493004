//! testd - on-demand test orchestration daemon
//!
//! `testd serve` runs the daemon; every other command either executes a
//! one-shot run locally or talks to a live daemon over HTTP.

use std::path::PathBuf;

use clap::Parser;
use testd::commands::Commands;
use testd::common::config::Config;
use testd::common::logging;
use testd::{cli, daemon};

#[derive(Parser)]
#[command(name = "testd", about = "On-demand test orchestration daemon")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        // Daemon mode sets up its own logging (file + relay layers)
        Commands::Serve {
            config,
            port,
            manifest_dir,
        } => match serve_config(config, port, manifest_dir) {
            Ok(config) => daemon::run(config).await,
            Err(e) => Err(e),
        },
        command => {
            logging::init_cli();
            cli::dispatch(command).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn serve_config(
    path: Option<PathBuf>,
    port: Option<u16>,
    manifest_dir: Option<PathBuf>,
) -> testd::Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(dir) = manifest_dir {
        config.registry.manifest_dir = dir;
    }
    Ok(config)
}
