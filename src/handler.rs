//! Transaction handler for proof-of-relay batches.
//!
//! Validation order for a batch:
//!
//! 1. every proof shares the message's servicer and session header, and
//!    the session is still inside the claim window
//! 2. servicer and application exist at the session height
//! 3. the servicer is a member of the session, the application is
//!    authorized for the chain, and the session window has closed
//! 4. the batch was not settled before
//! 5. every proof verifies and the claimed total matches
//! 6. settlement and reward apply together or not at all

use crate::chain::{
    claim_window_start, is_session_closed, session_block_height, StakingLedger,
    StateCommitmentView,
};
use crate::error::{Error, Result, SessionError};
use crate::event::{NodeEvent, NodeEventsSender};
use crate::ledger::{check_homogeneous, MsgProofOfRelays, ProofLedger};
use crate::reward::award_coins_for_relays;
use crate::session::{form_session_at, SessionCache};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event type emitted for a settled batch.
pub const PROOF_BATCH_EVENT: &str = "proof_batch";

/// Attribute carrying the credited servicer's address.
pub const SERVICER_ATTRIBUTE: &str = "servicer";

/// Messages routed to this module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    /// Claim for a closed session.
    ProofOfRelays(MsgProofOfRelays),
    /// Any message type this module does not handle.
    Unsupported(String),
}

impl Msg {
    /// Encode with `rmp-serde`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode message: {e}")))
    }

    /// Decode from `rmp-serde` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("Failed to decode message: {e}")))
    }
}

/// Event attached to a successful transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    pub kind: String,
    /// Key/value attributes.
    pub attributes: Vec<(String, String)>,
}

impl Event {
    /// Value of attribute `key`.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome reported to the transaction submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    /// Zero on success, otherwise [`Error::code`].
    pub code: u32,
    /// Error message on failure.
    pub log: String,
    /// Events on success.
    pub events: Vec<Event>,
}

impl TxResult {
    fn ok(events: Vec<Event>) -> Self {
        Self {
            code: 0,
            log: String::new(),
            events,
        }
    }

    fn from_error(err: &Error) -> Self {
        Self {
            code: err.code(),
            log: err.to_string(),
            events: Vec::new(),
        }
    }

    /// Whether the transaction succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Tunables of the handler.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Nominal session size.
    pub node_count: usize,
    /// Blocks per session window.
    pub blocks_per_session: u64,
    /// Coins credited per relay.
    pub relay_reward: u128,
    /// Sessions after closing during which a batch may still be claimed.
    pub claim_window: u64,
}

/// Applies proof batches to chain state.
pub struct MsgHandler {
    chain: Arc<dyn StateCommitmentView>,
    staking: Arc<dyn StakingLedger>,
    ledger: Arc<ProofLedger>,
    cache: SessionCache,
    settings: HandlerSettings,
    events_tx: Option<NodeEventsSender>,
}

impl MsgHandler {
    /// Create a handler.
    #[must_use]
    pub fn new(
        chain: Arc<dyn StateCommitmentView>,
        staking: Arc<dyn StakingLedger>,
        ledger: Arc<ProofLedger>,
        cache: SessionCache,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            chain,
            staking,
            ledger,
            cache,
            settings,
            events_tx: None,
        }
    }

    /// Broadcast node events on `events_tx`.
    #[must_use]
    pub fn with_events(mut self, events_tx: NodeEventsSender) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    /// Handle one routed message.
    pub fn handle(&self, msg: &Msg) -> TxResult {
        let result = match msg {
            Msg::ProofOfRelays(batch) => self.handle_proof_batch(batch),
            Msg::Unsupported(kind) => Err(Error::UnknownRequest(format!(
                "unrecognized message type: {kind}"
            ))),
        };

        match result {
            Ok(events) => TxResult::ok(events),
            Err(e) => {
                warn!("Transaction rejected: {e}");
                TxResult::from_error(&e)
            }
        }
    }

    /// Decode and handle an `rmp-serde` encoded message.
    pub fn handle_tx_bytes(&self, bytes: &[u8]) -> TxResult {
        match Msg::from_bytes(bytes) {
            Ok(msg) => self.handle(&msg),
            Err(e) => TxResult::from_error(&e),
        }
    }

    fn handle_proof_batch(&self, batch: &MsgProofOfRelays) -> Result<Vec<Event>> {
        check_homogeneous(batch)?;

        let servicer = batch.servicer_address();
        let header = &batch.header;
        let height = header.session_block_height;
        let bps = self.settings.blocks_per_session;

        // Settlement markers older than the claim window are pruned.
        let latest = self.chain.latest_height();
        if height < claim_window_start(latest, bps, self.settings.claim_window) {
            return Err(SessionError::StaleHeight {
                requested: height,
                current: session_block_height(latest, bps),
            }
            .into());
        }

        let state = self.chain.state_at_height(height)?;
        if state.validator(&servicer).is_none() {
            return Err(Error::NodeNotFound(servicer));
        }
        let app = state
            .application_by_public_key(&header.application_public_key)
            .ok_or_else(|| Error::ApplicationNotFound(header.application_public_key.short_hex()))?;

        if session_block_height(height, bps) != height {
            return Err(SessionError::StaleHeight {
                requested: height,
                current: session_block_height(height, bps),
            }
            .into());
        }
        if !app.authorizes(&header.chain) {
            return Err(SessionError::ChainNotAuthorized(header.chain.clone()).into());
        }
        let session = self.cache.get_or_form(header, || {
            form_session_at(self.chain.as_ref(), header, self.settings.node_count)
        })?;
        if !session.contains(&servicer) {
            return Err(SessionError::NodeNotInSession(servicer).into());
        }
        if !is_session_closed(height, self.chain.latest_height(), bps) {
            return Err(SessionError::SessionOpen(height).into());
        }

        if self.ledger.is_settled(&servicer, header) {
            return Err(Error::BatchAlreadySettled {
                servicer,
                session_height: height,
            });
        }

        let relays = self.ledger.are_proofs_valid(app.max_relays, batch)?;
        debug!("Batch from {} carries {} valid proof(s)", servicer, relays);

        let rate = self.settings.relay_reward;
        self.ledger.settle(&servicer, header, relays, || {
            award_coins_for_relays(self.staking.as_ref(), relays, &servicer, rate).map(|_| ())
        })?;

        info!(
            "Proof batch settled: {} relay(s) for {} on chain {}",
            relays, servicer, header.chain
        );
        if let Some(ref tx) = self.events_tx {
            let _ = tx.send(NodeEvent::BatchSettled {
                servicer,
                session_height: height,
                relays,
            });
        }

        Ok(vec![Event {
            kind: PROOF_BATCH_EVENT.to_string(),
            attributes: vec![(SERVICER_ATTRIBUTE.to_string(), servicer.to_string())],
        }])
    }
}
