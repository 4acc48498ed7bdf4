//! kithub - kit journal relay hub

use clap::Parser;
use kithub::config::{Command, Config, LogFormat};
use kithub::server::Server;
use kit_core::Register;
use kit_journal::{Workspace, WorkspaceConfig};
use std::collections::BTreeMap;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LISTEN: &str = "127.0.0.1:34567";

fn init_logging(config: &Config) {
    let default = if config.verbose {
        "kithub=debug,kit_journal=debug"
    } else {
        "kithub=info,kit_journal=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("kithub v{}", env!("CARGO_PKG_VERSION"));

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
    match config.command {
        Command::Init => {
            let ws = Workspace::new(&config.dir);
            let hub_config = WorkspaceConfig {
                addrs: vec![DEFAULT_LISTEN.to_string()],
                hubs: BTreeMap::new(),
            };
            let loaded = ws.init(&hub_config, Register { email: String::new() })?;
            info!("Hub key: {}", loaded.identity().to_hex());
            println!("{}", loaded.identity().to_hex());
        }
        Command::Serve(args) => {
            let server = Server::new(&config.dir, network, args)?;
            server
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                    info!("Received shutdown signal");
                })
                .await?;
        }
    }
    Ok(())
}
