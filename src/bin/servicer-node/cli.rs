//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use servicer_node::NodeConfig;
use std::path::PathBuf;

/// Session-scoped relay metering node for staked servicers.
#[derive(Parser, Debug)]
#[command(name = "servicer-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for node data.
    #[arg(long, env = "SERVICER_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Directory holding the servicer key pair.
    #[arg(long, env = "SERVICER_KEY_DIR")]
    pub key_dir: Option<PathBuf>,

    /// Genesis file for the development chain.
    #[arg(long, env = "SERVICER_GENESIS")]
    pub genesis: Option<PathBuf>,

    /// Hosted chain as `ID=URL` (repeatable).
    #[arg(long = "chain", value_parser = parse_hosted_chain, env = "SERVICER_CHAINS", value_delimiter = ',')]
    pub chains: Vec<(String, String)>,

    /// Nominal number of servicers per session.
    #[arg(long, env = "SERVICER_NODE_COUNT")]
    pub node_count: Option<usize>,

    /// Blocks per session window.
    #[arg(long, env = "SERVICER_BLOCKS_PER_SESSION")]
    pub blocks_per_session: Option<u64>,

    /// Downstream execution timeout in milliseconds.
    #[arg(long, env = "SERVICER_RELAY_TIMEOUT_MS")]
    pub relay_timeout_ms: Option<u64>,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: CliLogFormat,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Log format CLI enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Convert CLI arguments into a NodeConfig.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<NodeConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            NodeConfig::from_file(path)?
        } else {
            NodeConfig::default()
        };

        // Override with CLI arguments
        if let Some(root_dir) = self.root_dir {
            config.root_dir = root_dir;
        }
        if self.key_dir.is_some() {
            config.key_dir = self.key_dir;
        }
        if self.genesis.is_some() {
            config.chain.genesis = self.genesis;
        }
        if let Some(node_count) = self.node_count {
            config.session.node_count = node_count;
        }
        if let Some(blocks) = self.blocks_per_session {
            config.session.blocks_per_session = blocks;
        }
        if let Some(timeout) = self.relay_timeout_ms {
            config.relay.timeout_ms = timeout;
        }
        config.relay.hosted_chains.extend(self.chains);
        config.log_level = self.log_level;

        Ok(config)
    }
}

fn parse_hosted_chain(value: &str) -> Result<(String, String), String> {
    let (id, url) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=URL, got '{value}'"))?;
    if id.is_empty() || url.is_empty() {
        return Err(format!("expected ID=URL, got '{value}'"));
    }
    Ok((id.to_string(), url.to_string()))
}
