//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap, broker options also from the environment
//! - TOML configuration file (`--config`, or `duodrop.toml` if present)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::broker::server::BrokerConfig;
use crate::core::broker::BrokerLimits;
use crate::core::config::DEFAULT_BROKER_PORT;
use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "duodrop.toml";
pub const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:3001";

/// Duodrop - pair two peers through a broker and send files directly.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML configuration file. Defaults to ./duodrop.toml when present.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the signaling broker.
    Broker(BrokerArgs),
    /// Create a room and send files and text to whoever joins it.
    Send(SendArgs),
    /// Join a room and receive everything the sender offers.
    Receive(ReceiveArgs),
}

#[derive(ClapArgs, Clone, Debug, Default)]
pub struct BrokerArgs {
    /// Port to listen on.
    #[clap(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Address to bind.
    #[clap(long)]
    pub bind: Option<IpAddr>,

    /// Allowed CORS origins, comma separated. `*` allows any.
    #[clap(long = "origin", env = "FRONTEND_ORIGIN", value_delimiter = ',')]
    pub origins: Vec<String>,

    /// HTTP requests allowed per address per 15 minutes.
    #[clap(long)]
    pub http_rate_limit: Option<usize>,

    /// Broker operations allowed per connection per minute.
    #[clap(long)]
    pub connection_rate_limit: Option<u32>,
}

#[derive(ClapArgs, Clone, Debug, Default)]
pub struct PeerArgs {
    /// Broker WebSocket URL.
    #[clap(long, env = "DUODROP_BROKER")]
    pub broker: Option<String>,

    /// STUN/TURN server URLs. Defaults to a public STUN server.
    #[clap(long = "ice-server")]
    pub ice_servers: Vec<String>,
}

#[derive(ClapArgs, Clone, Debug, Default)]
pub struct SendArgs {
    /// Files to send, in order.
    pub files: Vec<PathBuf>,

    /// Text messages to send before the files.
    #[clap(long)]
    pub text: Vec<String>,

    /// Room key. A random one is generated when omitted.
    #[clap(short, long)]
    pub key: Option<String>,

    /// Fan chunks out over N logical lanes (3 when given without a value).
    #[clap(long, num_args = 0..=1, default_missing_value = "3")]
    pub lanes: Option<usize>,

    /// Send payloads unencrypted.
    #[clap(long)]
    pub no_encrypt: bool,

    /// Never compress chunks.
    #[clap(long)]
    pub no_compress: bool,

    #[command(flatten)]
    pub peer: PeerArgs,
}

#[derive(ClapArgs, Clone, Debug, Default)]
pub struct ReceiveArgs {
    /// Room key shared by the sender.
    pub key: String,

    /// Directory received files are written to.
    #[clap(short, long)]
    pub out: Option<PathBuf>,

    #[command(flatten)]
    pub peer: PeerArgs,
}

// ── File config ──────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct FileConfig {
    pub verbose: Option<u8>,
    pub broker: BrokerSection,
    pub peer: PeerSection,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct BrokerSection {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub origins: Vec<String>,
    pub http_rate_limit: Option<usize>,
    pub connection_rate_limit: Option<u32>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct PeerSection {
    pub broker_url: Option<String>,
    pub ice_servers: Vec<String>,
    pub out: Option<PathBuf>,
    pub lanes: Option<usize>,
}

impl Args {
    /// Load Args from CLI + TOML file (if any).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let cli = Args::parse();
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let explicit = cli.config.is_some();

        match Self::from_file(&path)? {
            Some(file) => Ok(Self::merge(file, cli)),
            None if explicit => anyhow::bail!("config file {} not found", path.display()),
            None => Ok(cli),
        }
    }

    /// Load a TOML file. A missing file is not an error.
    fn from_file(path: &Path) -> Result<Option<FileConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str::<FileConfig>(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(Some(config))
    }

    /// Merge file config into CLI args (CLI takes precedence).
    pub fn merge(file: FileConfig, mut cli: Args) -> Args {
        if cli.verbose == 0 {
            cli.verbose = file.verbose.unwrap_or(0);
        }
        match &mut cli.command {
            Command::Broker(b) => {
                b.port = b.port.or(file.broker.port);
                b.bind = b.bind.or(file.broker.bind);
                if b.origins.is_empty() {
                    b.origins = file.broker.origins;
                }
                b.http_rate_limit = b.http_rate_limit.or(file.broker.http_rate_limit);
                b.connection_rate_limit =
                    b.connection_rate_limit.or(file.broker.connection_rate_limit);
            }
            Command::Send(s) => {
                s.lanes = s.lanes.or(file.peer.lanes);
                merge_peer(&mut s.peer, file.peer);
            }
            Command::Receive(r) => {
                r.out = r.out.take().or(file.peer.out.clone());
                merge_peer(&mut r.peer, file.peer);
            }
        }
        cli
    }
}

fn merge_peer(cli: &mut PeerArgs, file: PeerSection) {
    if cli.broker.is_none() {
        cli.broker = file.broker_url;
    }
    if cli.ice_servers.is_empty() {
        cli.ice_servers = file.ice_servers;
    }
}

impl BrokerArgs {
    pub fn to_config(&self) -> BrokerConfig {
        let defaults = BrokerConfig::default();
        BrokerConfig {
            bind: SocketAddr::new(
                self.bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                self.port.unwrap_or(DEFAULT_BROKER_PORT),
            ),
            allowed_origins: if self.origins.is_empty() {
                defaults.allowed_origins
            } else {
                self.origins.iter().map(|o| o.trim().to_string()).collect()
            },
            http_rate_limit: self.http_rate_limit.unwrap_or(defaults.http_rate_limit),
            connection_limits: BrokerLimits {
                operations: self
                    .connection_rate_limit
                    .unwrap_or(defaults.connection_limits.operations),
                ..defaults.connection_limits
            },
            ..defaults
        }
    }
}

impl PeerArgs {
    pub fn broker_url(&self) -> &str {
        self.broker.as_deref().unwrap_or(DEFAULT_BROKER_URL)
    }
}
