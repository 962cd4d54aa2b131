use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Conduit LLM gateway
#[derive(Debug, Parser)]
#[command(name = "conduit", about = "Multi-tenant LLM gateway with failover and usage billing")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "conduit.toml", env = "CONDUIT_CONFIG")]
    pub config: PathBuf,

    /// Log filter directive, e.g. `info,conduit_gateway=debug`
    #[arg(long, default_value = "info", env = "CONDUIT_LOG")]
    pub log: String,

    /// Override the listen address
    #[arg(long, env = "CONDUIT_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,
}
