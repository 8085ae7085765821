//! Test harness that stands up a small servicer network over one chain.
//!
//! The `TestHarness` stakes a set of servicers and one application on a
//! [`MemoryChain`], wires a [`Servicer`] per node against a shared proof
//! ledger, and exposes a [`MsgHandler`] playing the role of the chain's
//! transaction processor.

use async_trait::async_trait;
use parking_lot::Mutex;
use servicer_node::challenge::{ChallengeStore, StandingCounter};
use servicer_node::chain::{
    session_block_height, Application, MemoryChain, StateCommitmentView, Validator,
};
use servicer_node::handler::HandlerSettings;
use servicer_node::relay::RelayExecutor;
use servicer_node::servicer::ServicerSettings;
use servicer_node::{
    Address, EntitlementToken, Error, Keypair, MsgHandler, MsgProofOfRelays, ProofLedger, Relay,
    RelayPayload, RelayProof, RelayResponse, Servicer, SessionCache, SessionHeader,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Chain served by the in-session nodes.
pub const CHAIN: &str = "0001";

/// Chain served only by outsider nodes.
pub const OTHER_CHAIN: &str = "0002";

/// Reward per relay used by the harness handler.
pub const RELAY_REWARD: u128 = 1_000;

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Node library error
    #[error("Node error: {0}")]
    Node(#[from] Error),

    /// Node not found
    #[error("Node not found: index {0}")]
    NodeNotFound(usize),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// How the mock hosted chain answers.
#[derive(Debug, Clone)]
pub enum ExecMode {
    /// Reply with a fixed body.
    Reply(String),
    /// Fail every call.
    Fail,
    /// Sleep before replying.
    Delay(Duration),
}

/// Hosted-chain stand-in with switchable behavior.
pub struct MockExecutor {
    chains: BTreeSet<String>,
    mode: Mutex<ExecMode>,
    calls: AtomicUsize,
}

impl MockExecutor {
    /// Host `chains`, replying `"0x64"` until told otherwise.
    pub fn new(chains: &[&str]) -> Self {
        Self {
            chains: chains.iter().map(|c| (*c).to_string()).collect(),
            mode: Mutex::new(ExecMode::Reply("0x64".to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    /// Switch the behavior for subsequent calls.
    pub fn set_mode(&self, mode: ExecMode) {
        *self.mode.lock() = mode;
    }

    /// Number of payloads forwarded so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayExecutor for MockExecutor {
    fn hosts(&self, chain: &str) -> bool {
        self.chains.contains(chain)
    }

    async fn execute(&self, chain: &str, _payload: &RelayPayload) -> servicer_node::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().clone();
        match mode {
            ExecMode::Reply(body) => Ok(body),
            ExecMode::Fail => Err(Error::DownstreamExecution(format!("{chain} is offline"))),
            ExecMode::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok("0x64".to_string())
            }
        }
    }
}

/// Shape of the harness network.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Staked servicers advertising [`CHAIN`].
    pub members: usize,
    /// Staked servicers advertising only [`OTHER_CHAIN`].
    pub outsiders: usize,
    /// Nominal session size.
    pub node_count: usize,
    /// Blocks per session window.
    pub blocks_per_session: u64,
    /// Relay ceiling of the application.
    pub max_relays: u64,
    /// Downstream execution timeout.
    pub relay_timeout: Duration,
    /// Challenges one node accepts per session.
    pub max_challenges: u64,
    /// Sessions after closing during which claims and challenges are accepted.
    pub claim_window: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            members: 3,
            outsiders: 1,
            node_count: 5,
            blocks_per_session: 4,
            max_relays: 3,
            relay_timeout: Duration::from_secs(5),
            max_challenges: 10,
            claim_window: 4,
        }
    }
}

/// One servicer of the harness network.
pub struct TestNode {
    /// Identity of the servicer.
    pub keypair: Keypair,
    /// Relay-serving context.
    pub servicer: Arc<Servicer>,
}

impl TestNode {
    /// Address of the node.
    pub fn address(&self) -> Address {
        self.keypair.address()
    }
}

/// Test harness that manages the complete test environment.
pub struct TestHarness {
    /// Chain backend shared by every node.
    pub chain: Arc<MemoryChain>,
    /// Application identity that signs entitlement tokens.
    pub app: Keypair,
    /// Client identity that signs proofs of relay.
    pub client: Keypair,
    /// Session members first, then outsiders.
    pub nodes: Vec<TestNode>,
    /// Ledger shared by all nodes and the handler.
    pub ledger: Arc<ProofLedger>,
    /// Transaction processor for proof batches.
    pub handler: MsgHandler,
    /// Hosted-chain stand-in used by every node.
    pub executor: Arc<MockExecutor>,
    /// Standing hook fed by accepted challenges.
    pub standing: Arc<StandingCounter>,
    /// Configuration the harness was built with.
    pub config: HarnessConfig,
}

impl TestHarness {
    /// Create the default network: three members and one outsider.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn setup() -> Result<Self> {
        Self::setup_with_config(HarnessConfig::default())
    }

    /// Create a network with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn setup_with_config(config: HarnessConfig) -> Result<Self> {
        info!(
            "Setting up test harness with {} member(s) and {} outsider(s)",
            config.members, config.outsiders
        );

        let chain = Arc::new(MemoryChain::new());
        let app = Keypair::generate()?;
        let client = Keypair::generate()?;

        chain.stake_application(Application {
            public_key: app.public_key().clone(),
            chains: [CHAIN, OTHER_CHAIN].iter().map(|c| (*c).to_string()).collect(),
            staked_tokens: 1,
            max_relays: config.max_relays,
        });

        let executor = Arc::new(MockExecutor::new(&[CHAIN, OTHER_CHAIN]));
        let standing = Arc::new(StandingCounter::new());
        let ledger = Arc::new(ProofLedger::new());
        let settings = ServicerSettings {
            node_count: config.node_count,
            blocks_per_session: config.blocks_per_session,
            relay_timeout: config.relay_timeout,
            retained_sessions: 1,
            claim_window: config.claim_window,
        };

        let mut nodes = Vec::with_capacity(config.members + config.outsiders);
        for i in 0..config.members + config.outsiders {
            let keypair = Keypair::generate()?;
            let served = if i < config.members { CHAIN } else { OTHER_CHAIN };
            chain.stake_validator(Validator {
                public_key: keypair.public_key().clone(),
                chains: BTreeSet::from([served.to_string()]),
                service_url: format!("http://node-{i}.test"),
                staked_tokens: 100,
                staked: true,
            });

            let servicer = Servicer::new(
                keypair.clone(),
                chain.clone(),
                executor.clone(),
                SessionCache::with_capacity(64),
                Arc::clone(&ledger),
                ChallengeStore::new(config.max_challenges, standing.clone()),
                settings.clone(),
            );
            nodes.push(TestNode {
                keypair,
                servicer: Arc::new(servicer),
            });
        }

        chain.commit_block();

        let handler = MsgHandler::new(
            chain.clone(),
            chain.clone(),
            Arc::clone(&ledger),
            SessionCache::with_capacity(64),
            HandlerSettings {
                node_count: config.node_count,
                blocks_per_session: config.blocks_per_session,
                relay_reward: RELAY_REWARD,
                claim_window: config.claim_window,
            },
        );

        Ok(Self {
            chain,
            app,
            client,
            nodes,
            ledger,
            handler,
            executor,
            standing,
            config,
        })
    }

    /// Get a node by index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of range.
    pub fn node(&self, index: usize) -> Result<&TestNode> {
        self.nodes.get(index).ok_or(HarnessError::NodeNotFound(index))
    }

    /// Start height of the session containing the latest block.
    pub fn current_session(&self) -> u64 {
        session_block_height(self.chain.latest_height(), self.config.blocks_per_session)
    }

    /// Header of the current session for `chain`.
    pub fn header(&self, chain: &str) -> SessionHeader {
        SessionHeader::new(self.app.public_key().clone(), chain, self.current_session())
    }

    /// Token for `header`, valid for two session windows.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn token(&self, header: &SessionHeader) -> Result<EntitlementToken> {
        Ok(EntitlementToken::issue(
            &self.app,
            self.client.public_key().clone(),
            header.chain.clone(),
            header.session_block_height,
            header.session_block_height + 2 * self.config.blocks_per_session,
        )?)
    }

    /// Signed relay of request `index` addressed to node `node`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist or signing fails.
    pub fn relay(&self, node: usize, index: u64) -> Result<Relay> {
        self.relay_for(node, &self.header(CHAIN), index)
    }

    /// Signed relay of request `index` under `header`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist or signing fails.
    pub fn relay_for(&self, node: usize, header: &SessionHeader, index: u64) -> Result<Relay> {
        let servicer_key = self.node(node)?.keypair.public_key().clone();
        let payload = RelayPayload::new(format!(
            r#"{{"jsonrpc":"2.0","method":"eth_blockNumber","id":{index}}}"#
        ));
        let proof = RelayProof::sign(
            &self.client,
            servicer_key,
            header.clone(),
            index,
            &payload,
            self.token(header)?,
        )?;
        Ok(Relay { payload, proof })
    }

    /// Send a relay to node `node`.
    ///
    /// # Errors
    ///
    /// Returns the servicer's rejection.
    pub async fn send(&self, node: usize, relay: Relay) -> Result<RelayResponse> {
        Ok(self.node(node)?.servicer.handle_relay(relay).await?)
    }

    /// Commit blocks until the current session has closed.
    pub fn close_session(&self) {
        self.chain
            .advance_to(self.current_session() + self.config.blocks_per_session);
    }

    /// Batch node `node` would claim for its closed sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist.
    pub fn claim(&self, node: usize) -> Result<Option<MsgProofOfRelays>> {
        Ok(self.node(node)?.servicer.claimable_batches().into_iter().next())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_stakes_every_node() {
        let harness = TestHarness::setup().unwrap();
        assert_eq!(harness.nodes.len(), 4);
        assert_eq!(harness.current_session(), 1);

        let state = harness.chain.state_at_height(1).unwrap();
        for node in &harness.nodes {
            assert!(state.is_staked(&node.address()));
        }
        assert!(harness.node(4).is_err());
    }
}
