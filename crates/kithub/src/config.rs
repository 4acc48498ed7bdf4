//! Configuration for kithub

use crate::hub::HubConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use kit_core::crypto::{derive_network_id, DEFAULT_NETWORK_PHRASE};
use kit_core::NetworkId;
use std::path::PathBuf;
use std::time::Duration;

/// kithub - kit journal relay hub
#[derive(Parser, Debug, Clone)]
#[command(name = "kithub")]
#[command(about = "Relays signed kit journals between connected peers")]
pub struct Config {
    /// Hub workspace directory (journal, key and config file)
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Network phrase; peers on a different network are refused
    #[arg(long, env = "KIT_NETWORK", default_value = DEFAULT_NETWORK_PHRASE)]
    pub network: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the hub key, config file and registration message
    Init,
    /// Listen for peers and relay messages
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Delay-buffer sweep period in milliseconds
    #[arg(long, default_value = "1000")]
    pub tick_ms: u64,

    /// How long a peer's own message is held before it is echoed back
    #[arg(long, default_value = "3")]
    pub echo_delay_secs: u64,

    /// Pause between attempts to reach a peer hub
    #[arg(long, default_value = "10")]
    pub reconnect_secs: u64,

    /// Handshake deadline in seconds
    #[arg(long, default_value = "10")]
    pub handshake_timeout_secs: u64,

    /// Stats logging interval in seconds
    #[arg(long, default_value = "300")]
    pub stats_interval_secs: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            echo_delay_secs: 3,
            reconnect_secs: 10,
            handshake_timeout_secs: 10,
            stats_interval_secs: 300,
        }
    }
}

impl ServeArgs {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            tick: Duration::from_millis(self.tick_ms),
            echo_delay: Duration::from_secs(self.echo_delay_secs),
            ..HubConfig::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.network.trim().is_empty() {
            anyhow::bail!("Network phrase cannot be empty");
        }
        if let Command::Serve(args) = &self.command {
            if args.tick_ms == 0 {
                anyhow::bail!("--tick-ms must be positive");
            }
            if args.handshake_timeout_secs == 0 {
                anyhow::bail!("--handshake-timeout-secs must be positive");
            }
            if args.stats_interval_secs == 0 {
                anyhow::bail!("--stats-interval-secs must be positive");
            }
        }
        Ok(())
    }

    pub fn network_id(&self) -> NetworkId {
        derive_network_id(&self.network)
    }
}
