//! Configuration for servicer-node.

use crate::challenge::DEFAULT_MAX_CHALLENGES_PER_SESSION;
use crate::reward::DEFAULT_RELAY_REWARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory for node data.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Directory holding the servicer key pair (defaults to `<root_dir>/keys`).
    #[serde(default)]
    pub key_dir: Option<PathBuf>,

    /// Session configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Relay configuration.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Reward configuration.
    #[serde(default)]
    pub reward: RewardConfig,

    /// Challenge configuration.
    #[serde(default)]
    pub challenge: ChallengeConfig,

    /// Development chain configuration.
    #[serde(default)]
    pub chain: DevChainConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Session formation and caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Nominal number of servicers per session.
    #[serde(default = "default_node_count")]
    pub node_count: usize,

    /// Blocks per session window.
    #[serde(default = "default_blocks_per_session")]
    pub blocks_per_session: u64,

    /// Maximum number of cached sessions.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Number of past session windows kept in the cache.
    #[serde(default = "default_retained_sessions")]
    pub retained_sessions: u64,

    /// Session windows after a session closes during which its batches and
    /// challenges are still accepted. Older settlement and challenge
    /// records are pruned.
    #[serde(default = "default_claim_window")]
    pub claim_window: u64,

    /// Maintenance loop interval in seconds.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

/// Relay execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Downstream execution timeout in milliseconds.
    #[serde(default = "default_relay_timeout")]
    pub timeout_ms: u64,

    /// Hosted chains: chain identifier to base URL.
    #[serde(default)]
    pub hosted_chains: BTreeMap<String, String>,
}

/// Reward issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    /// Coins credited per verified relay.
    #[serde(default = "default_relay_reward")]
    pub relay_reward: u64,
}

/// Challenge handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Challenges one node accepts per session.
    #[serde(default = "default_max_challenges")]
    pub max_per_session: u64,
}

/// In-memory development chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevChainConfig {
    /// Genesis file (TOML) with staked servicers and applications.
    #[serde(default)]
    pub genesis: Option<PathBuf>,

    /// Seconds between committed blocks (0 disables block production).
    #[serde(default = "default_block_interval")]
    pub block_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            key_dir: None,
            session: SessionConfig::default(),
            relay: RelayConfig::default(),
            reward: RewardConfig::default(),
            challenge: ChallengeConfig::default(),
            chain: DevChainConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            node_count: default_node_count(),
            blocks_per_session: default_blocks_per_session(),
            cache_capacity: default_cache_capacity(),
            retained_sessions: default_retained_sessions(),
            claim_window: default_claim_window(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_relay_timeout(),
            hosted_chains: BTreeMap::new(),
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            relay_reward: default_relay_reward(),
        }
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            max_per_session: default_max_challenges(),
        }
    }
}

impl Default for DevChainConfig {
    fn default() -> Self {
        Self {
            genesis: None,
            block_interval_secs: default_block_interval(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "servicer-node")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".servicer-node"))
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_node_count() -> usize {
    5
}

const fn default_blocks_per_session() -> u64 {
    4
}

const fn default_cache_capacity() -> usize {
    10_000
}

const fn default_retained_sessions() -> u64 {
    3
}

const fn default_claim_window() -> u64 {
    4
}

const fn default_maintenance_interval() -> u64 {
    30
}

const fn default_relay_timeout() -> u64 {
    10_000
}

const fn default_relay_reward() -> u64 {
    DEFAULT_RELAY_REWARD
}

const fn default_max_challenges() -> u64 {
    DEFAULT_MAX_CHALLENGES_PER_SESSION
}

const fn default_block_interval() -> u64 {
    60
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the node cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] naming the offending field.
    pub fn validate(&self) -> crate::Result<()> {
        if self.session.node_count == 0 {
            return Err(crate::Error::Config("session.node_count must be > 0".into()));
        }
        if self.session.blocks_per_session == 0 {
            return Err(crate::Error::Config(
                "session.blocks_per_session must be > 0".into(),
            ));
        }
        if self.session.claim_window == 0 {
            return Err(crate::Error::Config("session.claim_window must be > 0".into()));
        }
        if self.relay.timeout_ms == 0 {
            return Err(crate::Error::Config("relay.timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Directory holding the servicer key pair.
    #[must_use]
    pub fn key_dir(&self) -> PathBuf {
        self.key_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("keys"))
    }

    /// Downstream execution timeout.
    #[must_use]
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.timeout_ms)
    }
}
