//! kit command line

use clap::{Parser, Subcommand};
use kit_core::crypto::{derive_network_id, DEFAULT_NETWORK_PHRASE};
use kit_core::NetworkId;
use std::path::PathBuf;

/// kit - signed, hash-chained change journal
#[derive(Parser, Debug, Clone)]
#[command(name = "kit")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Workspace directory
    #[arg(short, long, default_value = ".kit")]
    pub dir: PathBuf,

    /// Network phrase shared with the hubs
    #[arg(long, env = "KIT_NETWORK", default_value = DEFAULT_NETWORK_PHRASE)]
    pub network: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Initialize workspace
    Init {
        /// Email recorded in the registration message
        #[arg(long, default_value = "my@email.com")]
        email: String,

        /// Hub to sync with, as `<hex public key>=<host:port>`
        #[arg(long = "hub", value_parser = parse_hub)]
        hubs: Vec<(String, String)>,
    },
    /// Mail changes
    Mail {
        /// Diff text to record
        #[arg(long, default_value = "+some code")]
        diff: String,
    },
    /// List journal entries
    List,
    /// Sync with hubs
    Sync {
        /// Connect and handshake deadline in seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

fn parse_hub(s: &str) -> Result<(String, String), String> {
    let (key, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <key>=<addr>, got {s:?}"))?;
    if key.is_empty() || addr.is_empty() {
        return Err(format!("expected <key>=<addr>, got {s:?}"));
    }
    Ok((key.to_string(), addr.to_string()))
}

impl Config {
    pub fn network_id(&self) -> NetworkId {
        derive_network_id(&self.network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_with_hubs() {
        let config = Config::try_parse_from([
            "kit",
            "--dir",
            "/tmp/ws",
            "init",
            "--email",
            "dev@example.com",
            "--hub",
            "aa=127.0.0.1:34567",
        ])
        .unwrap();
        assert_eq!(config.dir, PathBuf::from("/tmp/ws"));
        let Command::Init { email, hubs } = config.command else {
            panic!("expected init");
        };
        assert_eq!(email, "dev@example.com");
        assert_eq!(hubs, vec![("aa".to_string(), "127.0.0.1:34567".to_string())]);
    }

    #[test]
    fn test_bad_hub_argument() {
        assert!(Config::try_parse_from(["kit", "init", "--hub", "no-separator"]).is_err());
        assert!(Config::try_parse_from(["kit", "init", "--hub", "=addr"]).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["kit", "list"]).unwrap();
        assert_eq!(config.dir, PathBuf::from(".kit"));
        assert!(!config.verbose);
        let config = Config::try_parse_from(["kit", "sync"]).unwrap();
        assert!(matches!(config.command, Command::Sync { timeout_secs: 10 }));
    }
}
