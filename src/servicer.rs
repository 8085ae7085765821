//! Servicer runtime context: relay handling and challenge adjudication.
//!
//! ```text
//! Relay ─▶ validate token, header, session ─▶ ledger.store ─▶ execute ─▶ sign
//!                                               (before)      (bounded)
//! ```
//!
//! The proof is recorded before the hosted chain is called, so a failed or
//! timed-out execution still consumes the request index.

use crate::challenge::{Challenge, ChallengeResponse, ChallengeStore};
use crate::chain::{claim_window_start, session_block_height, StateCommitmentView};
use crate::config::NodeConfig;
use crate::crypto::{Address, Keypair};
use crate::error::{Error, ProofError, Result, SessionError};
use crate::event::{NodeEvent, NodeEventsSender};
use crate::ledger::{MsgProofOfRelays, ProofLedger};
use crate::metrics::ServiceMetrics;
use crate::relay::{check_index, Relay, RelayExecutor, RelayResponse};
use crate::session::{form_session_at, Session, SessionCache, SessionHeader};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Tunables of the servicer.
#[derive(Debug, Clone)]
pub struct ServicerSettings {
    /// Nominal session size.
    pub node_count: usize,
    /// Blocks per session window.
    pub blocks_per_session: u64,
    /// Downstream execution timeout.
    pub relay_timeout: Duration,
    /// Past session windows kept in the cache.
    pub retained_sessions: u64,
    /// Sessions after closing during which challenges are accepted.
    pub claim_window: u64,
}

impl From<&NodeConfig> for ServicerSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            node_count: config.session.node_count,
            blocks_per_session: config.session.blocks_per_session,
            relay_timeout: config.relay_timeout(),
            retained_sessions: config.session.retained_sessions,
            claim_window: config.session.claim_window,
        }
    }
}

/// Serves relays and adjudicates challenges for one servicer identity.
pub struct Servicer {
    keypair: Keypair,
    chain: Arc<dyn StateCommitmentView>,
    executor: Arc<dyn RelayExecutor>,
    cache: SessionCache,
    ledger: Arc<ProofLedger>,
    challenges: ChallengeStore,
    metrics: ServiceMetrics,
    settings: ServicerSettings,
    events_tx: Option<NodeEventsSender>,
    fatal: Mutex<Option<String>>,
    fatal_notify: Notify,
}

impl Servicer {
    /// Create a servicer.
    #[must_use]
    pub fn new(
        keypair: Keypair,
        chain: Arc<dyn StateCommitmentView>,
        executor: Arc<dyn RelayExecutor>,
        cache: SessionCache,
        ledger: Arc<ProofLedger>,
        challenges: ChallengeStore,
        settings: ServicerSettings,
    ) -> Self {
        Self {
            keypair,
            chain,
            executor,
            cache,
            ledger,
            challenges,
            metrics: ServiceMetrics::new(),
            settings,
            events_tx: None,
            fatal: Mutex::new(None),
            fatal_notify: Notify::new(),
        }
    }

    /// Broadcast node events on `events_tx`.
    #[must_use]
    pub fn with_events(mut self, events_tx: NodeEventsSender) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    /// Address of this servicer.
    #[must_use]
    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    /// The session cache.
    #[must_use]
    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// The proof ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<ProofLedger> {
        &self.ledger
    }

    /// Accepted challenge outcomes.
    #[must_use]
    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    /// Service metrics.
    #[must_use]
    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    /// Validate, record, execute and sign one relay.
    ///
    /// # Errors
    ///
    /// Returns the first failed validation, [`Error::InvalidProof`] if the
    /// request index was already consumed, or
    /// [`Error::DownstreamExecution`] if the hosted chain failed or timed
    /// out. In the last case the index stays consumed.
    pub async fn handle_relay(&self, relay: Relay) -> Result<RelayResponse> {
        let started = Instant::now();
        let self_address = self.keypair.address();
        let latest = self.chain.latest_height();
        let current_session = session_block_height(latest, self.settings.blocks_per_session);

        let proof = &relay.proof;
        let header = &proof.header;

        if !self.executor.hosts(&header.chain) {
            return Err(SessionError::ChainNotHosted(header.chain.clone()).into());
        }
        if proof.servicer_public_key != *self.keypair.public_key() {
            return Err(ProofError::WrongServicer.into());
        }
        if proof.request_hash != relay.payload.hash() {
            return Err(ProofError::RequestHashMismatch.into());
        }
        if !proof.token.verify_signature() {
            return Err(ProofError::BadSignature("entitlement token").into());
        }
        proof.token.check_binding(header)?;
        proof.token.check_expiration(latest)?;
        if header.session_block_height != current_session {
            return Err(SessionError::StaleHeight {
                requested: header.session_block_height,
                current: current_session,
            }
            .into());
        }

        let state = self.chain.state_at_height(current_session)?;
        let app = state
            .application_by_public_key(&header.application_public_key)
            .ok_or_else(|| Error::ApplicationNotFound(header.application_public_key.short_hex()))?;
        if !app.authorizes(&header.chain) {
            return Err(SessionError::ChainNotAuthorized(header.chain.clone()).into());
        }
        if !state.is_staked(&self_address) {
            return Err(Error::NodeNotFound(self_address));
        }

        let session = self.session(header)?;
        if !session.contains(&self_address) {
            return Err(SessionError::NodeNotInSession(self_address).into());
        }
        if !proof.verify_client_signature() {
            return Err(ProofError::BadSignature("client").into());
        }
        check_index(proof.request_index, app.max_relays)?;

        self.ledger
            .store(app.max_relays, &self_address, relay.proof.clone())?;

        let chain_id = header.chain.clone();
        let body = match tokio::time::timeout(
            self.settings.relay_timeout,
            self.executor.execute(&chain_id, &relay.payload),
        )
        .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                warn!("Relay {} on chain {} failed: {e}", proof.request_index, chain_id);
                self.metrics.record_error(&chain_id);
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "Relay {} on chain {} timed out after {:?}",
                    proof.request_index, chain_id, self.settings.relay_timeout
                );
                self.metrics.record_error(&chain_id);
                return Err(Error::DownstreamExecution(format!(
                    "timed out after {:?}",
                    self.settings.relay_timeout
                )));
            }
        };

        let response = RelayResponse::sign(&self.keypair, body, relay.proof)?;

        self.metrics.record_relay(&chain_id, started.elapsed());
        self.emit(NodeEvent::RelayServed { chain: chain_id });
        Ok(response)
    }

    /// Adjudicate a client challenge.
    ///
    /// The application and session are resolved at the challenge's own
    /// height. A cached session is used when present, but a historical
    /// formation is never added to the cache.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StaleHeight`] once the session has left the
    /// claim window, [`Error::ApplicationNotFound`] if the application is
    /// not staked at the session height, [`Error::ChallengeValidation`] for
    /// invalid evidence, or the lookup error if the session cannot be
    /// resolved.
    pub fn handle_challenge(&self, challenge: &Challenge) -> Result<ChallengeResponse> {
        let self_address = self.keypair.address();
        let header = &challenge.header;
        let height = header.session_block_height;

        let latest = self.chain.latest_height();
        let bps = self.settings.blocks_per_session;
        if height < claim_window_start(latest, bps, self.settings.claim_window) {
            return Err(SessionError::StaleHeight {
                requested: height,
                current: session_block_height(latest, bps),
            }
            .into());
        }

        let state = self.chain.state_at_height(height)?;
        if state
            .application_by_public_key(&header.application_public_key)
            .is_none()
        {
            return Err(Error::ApplicationNotFound(
                header.application_public_key.short_hex(),
            ));
        }

        let session = match self.cache.get(header) {
            Some(session) => session,
            None => Arc::new(form_session_at(
                self.chain.as_ref(),
                header,
                self.settings.node_count,
            )?),
        };
        if !session.contains(&self_address) {
            return Err(SessionError::NodeNotInSession(self_address).into());
        }

        let accused = challenge.validate(&session)?;
        if self.challenges.record(challenge, accused, self_address)? {
            self.metrics.record_challenge(&header.chain);
            self.emit(NodeEvent::ChallengeAccepted { accused });
        }

        Ok(ChallengeResponse {
            response: format!("successfully stored challenge proof for {accused}"),
        })
    }

    /// Session for `header`, formed and cached on first use.
    ///
    /// # Errors
    ///
    /// Returns the formation error. An [`Error::Internal`] is also recorded
    /// as fatal for the running node.
    pub fn session(&self, header: &SessionHeader) -> Result<Arc<Session>> {
        self.cache
            .get_or_form(header, || {
                form_session_at(self.chain.as_ref(), header, self.settings.node_count)
            })
            .map_err(|e| {
                if let Error::Internal(ref message) = e {
                    self.raise_fatal(message.clone());
                }
                e
            })
    }

    /// Drop cached sessions older than the retained window.
    pub fn evict_stale_sessions(&self) -> usize {
        let bps = self.settings.blocks_per_session;
        let current = session_block_height(self.chain.latest_height(), bps);
        let min_height =
            current.saturating_sub(self.settings.retained_sessions.saturating_mul(bps));
        self.cache.evict_before(min_height)
    }

    /// Forget settlement and challenge records of sessions that have left
    /// the claim window.
    ///
    /// Returns the number of entries dropped.
    pub fn prune_expired_claims(&self) -> usize {
        let min_height = claim_window_start(
            self.chain.latest_height(),
            self.settings.blocks_per_session,
            self.settings.claim_window,
        );
        self.ledger.prune_before(min_height) + self.challenges.prune_before(min_height)
    }

    /// Batches this servicer can claim for sessions that have closed.
    #[must_use]
    pub fn claimable_batches(&self) -> Vec<MsgProofOfRelays> {
        let latest = self.chain.latest_height();
        self.ledger
            .closed_sessions(
                &self.keypair.address(),
                latest,
                self.settings.blocks_per_session,
            )
            .iter()
            .filter_map(|header| self.ledger.build_batch(self.keypair.public_key(), header))
            .collect()
    }

    /// The first fatal error raised, if any.
    #[must_use]
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Wait until a fatal error is raised.
    pub async fn fatal_raised(&self) {
        loop {
            let notified = self.fatal_notify.notified();
            if self.fatal.lock().is_some() {
                return;
            }
            notified.await;
        }
    }

    fn raise_fatal(&self, message: String) {
        error!("Fatal invariant violation: {message}");
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(message.clone());
            self.emit(NodeEvent::Error { message });
        }
        drop(fatal);
        self.fatal_notify.notify_waiters();
    }

    fn emit(&self, event: NodeEvent) {
        if let Some(ref tx) = self.events_tx {
            if tx.send(event).is_err() {
                debug!("No event subscribers");
            }
        }
    }
}
