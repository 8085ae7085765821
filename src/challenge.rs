//! Challenge adjudication.
//!
//! A client that received conflicting answers from session nodes for the
//! same request submits the minority response together with the agreeing
//! majority. A node that validates the evidence records an outcome against
//! the minority servicer and reports it to the [`StandingHook`].

use crate::crypto::Address;
use crate::error::{Error, Result};
use crate::relay::{EntitlementToken, RelayResponse};
use crate::session::{Session, SessionHeader};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Minimum number of agreeing responses needed to outvote the minority.
pub const MIN_MAJORITY_RESPONSES: usize = 2;

/// Default number of challenges one node accepts per session.
pub const DEFAULT_MAX_CHALLENGES_PER_SESSION: u64 = 10;

/// Client evidence that one session node disagreed with the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Session the disputed request belongs to.
    pub header: SessionHeader,
    /// Entitlement the client relayed under.
    pub token: EntitlementToken,
    /// The dissenting response.
    pub minority_response: RelayResponse,
    /// Responses that agree with each other.
    pub majority_responses: Vec<RelayResponse>,
}

/// Reply to an accepted challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Human-readable acknowledgement.
    pub response: String,
}

/// Accepted challenge against one servicer in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeOutcome {
    /// Session of the disputed request.
    pub header: SessionHeader,
    /// Servicer that returned the minority response.
    pub accused: Address,
    /// Nodes that accepted evidence against the accused.
    pub accusers: BTreeSet<Address>,
    /// The dissenting payload.
    pub minority_payload: String,
    /// The payload the majority agreed on.
    pub majority_payload: String,
}

impl Challenge {
    /// Validate the evidence against `session` and return the accused servicer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChallengeValidation`] describing the first failed check.
    pub fn validate(&self, session: &Session) -> Result<Address> {
        if session.header != self.header {
            return Err(invalid("session does not match the challenge header"));
        }

        if self.token.application_public_key != self.header.application_public_key {
            return Err(invalid("token belongs to another application"));
        }
        if !self.token.verify_signature() {
            return Err(invalid("token signature does not verify"));
        }
        self.token
            .check_binding(&self.header)
            .map_err(|e| invalid(&e.to_string()))?;

        if self.majority_responses.len() < MIN_MAJORITY_RESPONSES {
            return Err(invalid(&format!(
                "majority needs at least {MIN_MAJORITY_RESPONSES} responses, got {}",
                self.majority_responses.len()
            )));
        }

        let request_hash = self.minority_response.proof.request_hash;
        let mut signers = BTreeSet::new();
        for response in self.responses() {
            if response.proof.header != self.header {
                return Err(invalid("response belongs to another session"));
            }
            if response.proof.request_hash != request_hash {
                return Err(invalid("responses answer different requests"));
            }
            // Signed fields are compared since signatures need not be deterministic.
            let token = &response.proof.token;
            if token.signable_bytes() != self.token.signable_bytes() || !token.verify_signature()
            {
                return Err(invalid("response was relayed under another token"));
            }
            if !response.proof.verify_client_signature() {
                return Err(invalid("client signature on relay proof does not verify"));
            }
            if !response.verify_signature() {
                return Err(invalid("response signature does not verify"));
            }

            let signer = response.servicer_address();
            if !session.contains(&signer) {
                return Err(invalid(&format!("{signer} is not a session node")));
            }
            if !signers.insert(signer) {
                return Err(invalid(&format!("{signer} signed more than one response")));
            }
        }

        let majority_payload = &self.majority_responses[0].payload;
        if self
            .majority_responses
            .iter()
            .any(|r| &r.payload != majority_payload)
        {
            return Err(invalid("majority responses disagree"));
        }
        if &self.minority_response.payload == majority_payload {
            return Err(invalid("minority response agrees with the majority"));
        }

        Ok(self.minority_response.servicer_address())
    }

    fn responses(&self) -> impl Iterator<Item = &RelayResponse> {
        std::iter::once(&self.minority_response).chain(self.majority_responses.iter())
    }
}

fn invalid(reason: &str) -> Error {
    Error::ChallengeValidation(reason.to_string())
}

/// Receives accepted challenges so standing can be adjusted.
///
/// Called exactly once per (session, accused, accuser).
pub trait StandingHook: Send + Sync {
    /// An accusation against `accused` was accepted.
    fn on_challenge_accepted(&self, header: &SessionHeader, accused: &Address, accuser: &Address);
}

/// Standing hook that counts accepted accusations per servicer.
#[derive(Debug, Default)]
pub struct StandingCounter {
    penalties: Mutex<HashMap<Address, u64>>,
}

impl StandingCounter {
    /// Create a counter with no penalties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted accusations against `address`.
    #[must_use]
    pub fn penalties(&self, address: &Address) -> u64 {
        self.penalties.lock().get(address).copied().unwrap_or(0)
    }
}

impl StandingHook for StandingCounter {
    fn on_challenge_accepted(&self, header: &SessionHeader, accused: &Address, accuser: &Address) {
        let mut penalties = self.penalties.lock();
        let count = penalties.entry(*accused).or_insert(0);
        *count += 1;
        debug!(
            "Standing of {} lowered by {} (session height {}), {} accusation(s)",
            accused, accuser, header.session_block_height, count
        );
    }
}

#[derive(Default)]
struct StoreInner {
    outcomes: HashMap<(SessionHeader, Address), ChallengeOutcome>,
    accepted_per_accuser: HashMap<(SessionHeader, Address), u64>,
}

/// Accepted challenge outcomes with per-accuser rate limiting.
pub struct ChallengeStore {
    inner: Mutex<StoreInner>,
    max_per_session: u64,
    hook: Arc<dyn StandingHook>,
}

impl ChallengeStore {
    /// Create a store reporting to `hook`.
    #[must_use]
    pub fn new(max_per_session: u64, hook: Arc<dyn StandingHook>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            max_per_session,
            hook,
        }
    }

    /// Record a validated challenge by `accuser` against `accused`.
    ///
    /// Returns `false` if this accuser already reported this accused for the
    /// session; the hook is not invoked again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChallengeValidation`] once the accuser has reached
    /// its per-session limit.
    pub fn record(&self, challenge: &Challenge, accused: Address, accuser: Address) -> Result<bool> {
        let header = &challenge.header;
        let mut inner = self.inner.lock();

        let outcome_key = (header.clone(), accused);
        if inner
            .outcomes
            .get(&outcome_key)
            .is_some_and(|o| o.accusers.contains(&accuser))
        {
            debug!("Duplicate challenge against {accused} from {accuser} ignored");
            return Ok(false);
        }

        let accepted = inner
            .accepted_per_accuser
            .entry((header.clone(), accuser))
            .or_insert(0);
        if *accepted >= self.max_per_session {
            return Err(invalid(&format!(
                "challenge limit of {} reached for this session",
                self.max_per_session
            )));
        }
        *accepted += 1;

        let majority_payload = challenge
            .majority_responses
            .first()
            .map(|r| r.payload.clone())
            .unwrap_or_default();
        inner
            .outcomes
            .entry(outcome_key)
            .or_insert_with(|| ChallengeOutcome {
                header: header.clone(),
                accused,
                accusers: BTreeSet::new(),
                minority_payload: challenge.minority_response.payload.clone(),
                majority_payload,
            })
            .accusers
            .insert(accuser);

        self.hook.on_challenge_accepted(header, &accused, &accuser);
        info!(
            "Challenge accepted against {} for chain {} at session height {}",
            accused, header.chain, header.session_block_height
        );
        Ok(true)
    }

    /// Forget outcomes and rate-limit counters for sessions that started
    /// before `min_height`.
    ///
    /// Returns the number of entries dropped.
    pub fn prune_before(&self, min_height: u64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.outcomes.len() + inner.accepted_per_accuser.len();
        inner
            .outcomes
            .retain(|(header, _), _| header.session_block_height >= min_height);
        inner
            .accepted_per_accuser
            .retain(|(header, _), _| header.session_block_height >= min_height);
        let pruned = before - inner.outcomes.len() - inner.accepted_per_accuser.len();
        if pruned > 0 {
            debug!("Pruned {pruned} challenge record(s) older than height {min_height}");
        }
        pruned
    }

    /// Number of recorded outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().outcomes.len()
    }

    /// Whether no outcome is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outcome recorded against `accused` in the session, if any.
    #[must_use]
    pub fn outcome(&self, header: &SessionHeader, accused: &Address) -> Option<ChallengeOutcome> {
        self.inner
            .lock()
            .outcomes
            .get(&(header.clone(), *accused))
            .cloned()
    }
}
