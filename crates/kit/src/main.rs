//! kit - signed change journal client

mod commands;
mod config;

use clap::Parser;
use config::{Command, Config};
use kit_journal::Workspace;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default = if config.verbose {
        "kit=debug,kit_journal=debug"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let network = config.network_id();
    let ws = Workspace::new(&config.dir);
    debug!(dir = %config.dir.display(), "workspace");

    match config.command {
        Command::Init { email, hubs } => {
            let me = commands::init(&ws, email, hubs)?;
            println!("{}", me.to_hex());
        }
        Command::Mail { diff } => {
            let msg = commands::mail(&ws, diff)?;
            println!("{}", msg);
        }
        Command::List => {
            for msg in commands::list(&ws)? {
                println!("{}", msg);
            }
        }
        Command::Sync { timeout_secs } => {
            let timeout = Duration::from_secs(timeout_secs.max(1));
            for (hub, report) in commands::sync(&ws, network, timeout).await? {
                println!(
                    "{}: sent {}, received {}, duplicates {}, rejected {}",
                    hub, report.sent, report.received, report.duplicates, report.rejected
                );
            }
        }
    }
    Ok(())
}
