//! Configuration for bitmessaged

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// bitmessaged - Bitmessage protocol engine daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "bitmessaged")]
#[command(about = "Bitmessage store-and-forward node")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:8444")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/bitmessaged")]
    pub data_dir: PathBuf,

    /// Streams this node subscribes to (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "1")]
    pub streams: Vec<u64>,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Idle-connection timeout in seconds before an ACTIVE connection is closed
    #[arg(long, default_value = "1800")]
    pub connection_ttl_secs: u64,

    /// nonceTrialsPerByte advertised for identities created on this node
    #[arg(long, default_value = "1000")]
    pub nonce_trials_per_byte: u64,

    /// extraBytes advertised for identities created on this node
    #[arg(long, default_value = "1000")]
    pub extra_bytes: u64,

    /// User agent string carried in the `version` handshake
    #[arg(long, default_value = "/bitmessage-rs:0.1/")]
    pub user_agent: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.streams.is_empty() {
            anyhow::bail!("at least one stream must be configured");
        }
        if self.streams.iter().any(|s| *s == 0) {
            anyhow::bail!("stream 0 does not exist");
        }
        Ok(())
    }
}
