//! Node implementation: wires the servicer, the batch handler and a
//! maintenance loop around a chain backend.

use crate::challenge::{ChallengeStore, StandingCounter, StandingHook};
use crate::chain::{Genesis, MemoryChain, StakingLedger, StateCommitmentView};
use crate::config::NodeConfig;
use crate::crypto::Keypair;
use crate::error::{Error, Result};
use crate::event::{create_event_channel, NodeEvent, NodeEventsChannel, NodeEventsSender};
use crate::handler::{HandlerSettings, Msg, MsgHandler, TxResult};
use crate::ledger::{ProofLedger, LEDGER_FILE};
use crate::relay::{HttpExecutor, RelayExecutor};
use crate::servicer::{Servicer, ServicerSettings};
use crate::session::SessionCache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Builder for constructing a servicer node.
pub struct NodeBuilder {
    config: NodeConfig,
    keypair: Option<Keypair>,
    chain: Option<(Arc<dyn StateCommitmentView>, Arc<dyn StakingLedger>)>,
    executor: Option<Arc<dyn RelayExecutor>>,
    standing: Option<Arc<dyn StandingHook>>,
}

impl NodeBuilder {
    /// Create a new node builder with the given configuration.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            keypair: None,
            chain: None,
            executor: None,
            standing: None,
        }
    }

    /// Use `keypair` instead of loading one from the key directory.
    #[must_use]
    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Use an external chain backend instead of the development chain.
    #[must_use]
    pub fn with_chain(
        mut self,
        chain: Arc<dyn StateCommitmentView>,
        staking: Arc<dyn StakingLedger>,
    ) -> Self {
        self.chain = Some((chain, staking));
        self
    }

    /// Use `executor` instead of the HTTP executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn RelayExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Report accepted challenges to `hook`.
    #[must_use]
    pub fn with_standing_hook(mut self, hook: Arc<dyn StandingHook>) -> Self {
        self.standing = Some(hook);
        self
    }

    /// Build the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the key pair or
    /// genesis cannot be loaded, or the persisted ledger is corrupt.
    pub fn build(self) -> Result<RunningNode> {
        info!("Building servicer-node with config: {:?}", self.config);
        self.config.validate()?;

        // Ensure root directory exists
        std::fs::create_dir_all(&self.config.root_dir)?;

        let keypair = match self.keypair {
            Some(keypair) => keypair,
            None => Keypair::load(&self.config.key_dir())?,
        };
        info!("Servicer address: {}", keypair.address());

        let (chain, staking, dev_chain) = match self.chain {
            Some((chain, staking)) => (chain, staking, None),
            None => {
                let genesis = match self.config.chain.genesis {
                    Some(ref path) => Genesis::from_file(path)?,
                    None => {
                        warn!("No genesis configured, starting an empty development chain");
                        Genesis::default()
                    }
                };
                let dev = Arc::new(MemoryChain::from_genesis(genesis));
                let chain: Arc<dyn StateCommitmentView> = dev.clone();
                let staking: Arc<dyn StakingLedger> = dev.clone();
                (chain, staking, Some(dev))
            }
        };

        let executor: Arc<dyn RelayExecutor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(HttpExecutor::new(self.config.relay.hosted_chains.clone())?),
        };

        let ledger_path = self.config.root_dir.join(LEDGER_FILE);
        let ledger = Arc::new(ProofLedger::load(&ledger_path)?);
        let cache = SessionCache::with_capacity(self.config.session.cache_capacity);

        let (events_tx, events_rx) = create_event_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let standing: Arc<dyn StandingHook> = match self.standing {
            Some(hook) => hook,
            None => Arc::new(StandingCounter::new()),
        };
        let challenges = ChallengeStore::new(self.config.challenge.max_per_session, standing);

        let servicer = Servicer::new(
            keypair,
            Arc::clone(&chain),
            executor,
            cache.clone(),
            Arc::clone(&ledger),
            challenges,
            ServicerSettings::from(&self.config),
        )
        .with_events(events_tx.clone());

        let handler = MsgHandler::new(
            chain,
            staking,
            Arc::clone(&ledger),
            cache,
            HandlerSettings {
                node_count: self.config.session.node_count,
                blocks_per_session: self.config.session.blocks_per_session,
                relay_reward: u128::from(self.config.reward.relay_reward),
                claim_window: self.config.session.claim_window,
            },
        )
        .with_events(events_tx.clone());

        Ok(RunningNode {
            config: self.config,
            servicer: Arc::new(servicer),
            handler: Arc::new(handler),
            ledger,
            ledger_path,
            dev_chain,
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

/// A running servicer node.
pub struct RunningNode {
    config: NodeConfig,
    servicer: Arc<Servicer>,
    handler: Arc<MsgHandler>,
    ledger: Arc<ProofLedger>,
    ledger_path: PathBuf,
    dev_chain: Option<Arc<MemoryChain>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: NodeEventsSender,
    events_rx: Option<NodeEventsChannel>,
}

impl RunningNode {
    /// Get the node's root directory.
    #[must_use]
    pub fn root_dir(&self) -> &PathBuf {
        &self.config.root_dir
    }

    /// The relay-serving context.
    #[must_use]
    pub fn servicer(&self) -> &Arc<Servicer> {
        &self.servicer
    }

    /// The batch-commit handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<MsgHandler> {
        &self.handler
    }

    /// The development chain, when no external backend was supplied.
    #[must_use]
    pub fn dev_chain(&self) -> Option<&Arc<MemoryChain>> {
        self.dev_chain.as_ref()
    }

    /// Get a receiver for node events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<NodeEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to node events.
    #[must_use]
    pub fn subscribe_events(&self) -> NodeEventsChannel {
        self.events_tx.subscribe()
    }

    /// Run the node until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if an invariant violation was raised, or
    /// an error if the ledger cannot be persisted at shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting servicer-node");
        let _ = self.events_tx.send(NodeEvent::Started);

        let mut maintenance = tokio::time::interval(Duration::from_secs(
            self.config.session.maintenance_interval_secs.max(1),
        ));
        let block_interval = self.block_interval();
        let mut blocks =
            tokio::time::interval(block_interval.unwrap_or(Duration::from_secs(3600)));

        info!("Node running, waiting for shutdown signal");

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break Ok(());
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    self.shutdown();
                    break Ok(());
                }
                () = self.servicer.fatal_raised() => {
                    let message = self.servicer.fatal_error().unwrap_or_default();
                    error!("Stopping node after fatal error: {message}");
                    break Err(Error::Internal(message));
                }
                _ = maintenance.tick() => {
                    self.maintain();
                }
                _ = blocks.tick(), if block_interval.is_some() => {
                    if let Some(ref chain) = self.dev_chain {
                        chain.commit_block();
                    }
                }
            }
        };

        let _ = self.events_tx.send(NodeEvent::ShuttingDown);
        self.ledger.persist(&self.ledger_path)?;
        info!("Node shutdown complete");
        outcome
    }

    /// One maintenance pass: evict stale sessions, prune expired claims,
    /// submit claimable batches and persist the ledger.
    pub fn maintain(&self) {
        let evicted = self.servicer.evict_stale_sessions();
        if evicted > 0 {
            debug!("Maintenance evicted {evicted} session(s)");
        }
        let pruned = self.servicer.prune_expired_claims();
        if pruned > 0 {
            debug!("Maintenance pruned {pruned} expired claim record(s)");
        }

        for batch in self.servicer.claimable_batches() {
            let result = self.submit(&Msg::ProofOfRelays(batch));
            if !result.is_ok() {
                warn!("Batch claim rejected ({}): {}", result.code, result.log);
            }
        }

        if let Err(e) = self.ledger.persist(&self.ledger_path) {
            warn!("Failed to persist proof ledger: {e}");
            let _ = self.events_tx.send(NodeEvent::Error {
                message: format!("Ledger persistence failed: {e}"),
            });
        }
    }

    /// Deliver a message to the batch-commit handler.
    pub fn submit(&self, msg: &Msg) -> TxResult {
        self.handler.handle(msg)
    }

    /// Request the node to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn block_interval(&self) -> Option<Duration> {
        match (self.dev_chain.as_ref(), self.config.chain.block_interval_secs) {
            (Some(_), secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }
}
