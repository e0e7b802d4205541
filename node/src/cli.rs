//! # CLI Interface
//!
//! Defines the command-line argument structure for `pocket-node` using
//! `clap` derive. Supports three subcommands: `run`, `keygen` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pocket_p2p::config::DEFAULT_P2P_PORT;

/// Pocket node hosting the P2P subsystem.
///
/// Joins the staked RainTree overlay and the background gossip network,
/// refreshes the staked set on every committed height, and exposes
/// health, peer and Prometheus endpoints over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "pocket-node",
    about = "Pocket node P2P subsystem",
    version,
    propagate_version = true
)]
pub struct PocketNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Generate a fresh Ed25519 key and print its address and peer id.
    Keygen(KeygenArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a JSON file holding a full P2P configuration.
    ///
    /// Flags below override the values read from it.
    #[arg(long, short = 'c', env = "POCKET_P2P_CONFIG")]
    pub config: Option<PathBuf>,

    /// Hex-encoded Ed25519 private key of this node.
    #[arg(long, env = "POCKET_P2P_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Interface the P2P host listens on.
    #[arg(long, env = "POCKET_P2P_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// TCP port for P2P traffic.
    #[arg(long, env = "POCKET_P2P_PORT", default_value_t = DEFAULT_P2P_PORT)]
    pub p2p_port: u16,

    /// Comma-separated bootstrap multiaddrs, each ending in `/p2p/<peer id>`.
    #[arg(long, env = "POCKET_P2P_BOOTSTRAP_PEERS")]
    pub bootstrap_peers: Option<String>,

    /// JSON file listing the staked actors (address, public key, service URL).
    ///
    /// Re-read at every committed height.
    #[arg(long, env = "POCKET_P2P_PEERS_FILE")]
    pub peers_file: PathBuf,

    /// Run as a client debug node: no inbound handlers, DHT in client mode.
    #[arg(long, env = "POCKET_P2P_CLIENT_DEBUG_MODE")]
    pub client_debug_mode: bool,

    /// Port for the HTTP API (`/health`, `/status`, `/peers`).
    #[arg(long, env = "POCKET_API_PORT", default_value_t = 50832)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "POCKET_METRICS_PORT", default_value_t = 9000)]
    pub metrics_port: u16,

    /// Seconds between simulated block commits.
    ///
    /// Each commit advances the height and refreshes the staked set.
    #[arg(long, env = "POCKET_BLOCK_INTERVAL_SECS", default_value_t = 15)]
    pub block_interval_secs: u64,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "POCKET_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `keygen` subcommand.
#[derive(Parser, Debug)]
pub struct KeygenArgs {
    /// Write the private key here instead of printing it.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}
