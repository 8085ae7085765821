//! Error types for servicer-node.
//!
//! Every failure the relay core can produce is a distinct variant so callers
//! can react by kind: an [`Error::InvalidProof`] is terminal for the request,
//! while an [`Error::DownstreamExecution`] may be retried by the client
//! against another session node.

use crate::crypto::Address;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in servicer-node.
#[derive(Error, Debug)]
pub enum Error {
    /// The servicer is not staked (or unknown) at the relevant height.
    #[error("servicer node not found: {0}")]
    NodeNotFound(Address),

    /// The application public key does not resolve to a staked application.
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    /// The relay or batch does not match an active session.
    #[error("session verification failed: {0}")]
    SessionVerification(#[from] SessionError),

    /// A proof of relay is malformed, forged, replayed or over the ceiling.
    #[error("invalid proof: {0}")]
    InvalidProof(#[from] ProofError),

    /// The hosted external chain could not serve the request.
    #[error("downstream execution failed: {0}")]
    DownstreamExecution(String),

    /// The local signing key is unavailable or signing failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The (servicer, session) pair was already claimed.
    #[error("proof batch already settled for {servicer} at session height {session_height}")]
    BatchAlreadySettled {
        /// Servicer that submitted the batch.
        servicer: Address,
        /// Session start height of the batch.
        session_height: u64,
    },

    /// The challenge evidence is structurally or cryptographically invalid.
    #[error("challenge validation failed: {0}")]
    ChallengeValidation(String),

    /// The staking ledger rejected a balance operation.
    #[error("staking ledger error: {0}")]
    Staking(String),

    /// The message router delivered a message type this module does not handle.
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cryptographic error outside of signing (key parsing, key files).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violation. Fatal for the running node.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Reasons a relay or batch fails session verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No block hash or state exists for the requested height.
    #[error("no committed state at height {0}")]
    UnknownHeight(u64),

    /// The header refers to a session other than the current one.
    #[error("stale session height {requested}, current session starts at {current}")]
    StaleHeight {
        /// Height carried by the request.
        requested: u64,
        /// Current session start height.
        current: u64,
    },

    /// The session window has not closed yet.
    #[error("session at height {0} is still open")]
    SessionOpen(u64),

    /// The servicer is not one of the session's nodes.
    #[error("node {0} is not a member of the session")]
    NodeNotInSession(Address),

    /// The chain named by the token and the proof header differ.
    #[error("chain mismatch: expected {expected}, got {actual}")]
    ChainMismatch {
        /// Chain the session was formed for.
        expected: String,
        /// Chain named by the request.
        actual: String,
    },

    /// The application is not authorized for the requested chain.
    #[error("application is not authorized for chain {0}")]
    ChainNotAuthorized(String),

    /// This node does not host the requested chain.
    #[error("chain {0} is not hosted by this node")]
    ChainNotHosted(String),

    /// The entitlement token is past its expiration height.
    #[error("entitlement token expired at height {expiration}, current height {current}")]
    TokenExpired {
        /// Last height the token is valid for.
        expiration: u64,
        /// Current chain height.
        current: u64,
    },
}

/// Reasons a proof of relay is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    /// A signature did not verify.
    #[error("bad {0} signature")]
    BadSignature(&'static str),

    /// The request index was already used in this session.
    #[error("request index {0} already used")]
    DuplicateIndex(u64),

    /// The request index is outside `1..=max`.
    #[error("request index {index} outside 1..={max}")]
    IndexOutOfRange {
        /// Index carried by the proof.
        index: u64,
        /// Entitlement ceiling for the session.
        max: u64,
    },

    /// The proof names a different servicer than the one handling it.
    #[error("proof is addressed to another servicer")]
    WrongServicer,

    /// The request payload does not match the proof's request hash.
    #[error("request hash mismatch")]
    RequestHashMismatch,

    /// The token does not match the session header it is used with.
    #[error("entitlement token does not match the session header")]
    TokenMismatch,

    /// A batch mixes servicers or sessions.
    #[error("batch contains proofs for more than one servicer or session")]
    HeterogeneousBatch,

    /// A batch carries no proofs.
    #[error("batch contains no proofs")]
    EmptyBatch,

    /// The claimed relay total exceeds (or misstates) the valid proofs.
    #[error("batch claims {claimed} relays but only {valid} valid proofs exist")]
    OverClaim {
        /// Relay total claimed by the batch.
        claimed: u64,
        /// Number of unique, valid proofs.
        valid: u64,
    },
}

impl Error {
    /// Stable numeric code reported to transaction submitters.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::NodeNotFound(_) => 1,
            Self::ApplicationNotFound(_) => 2,
            Self::SessionVerification(_) => 3,
            Self::InvalidProof(_) => 4,
            Self::DownstreamExecution(_) => 5,
            Self::Signing(_) => 6,
            Self::BatchAlreadySettled { .. } => 7,
            Self::ChallengeValidation(_) => 8,
            Self::UnknownRequest(_) => 9,
            Self::Config(_) => 10,
            Self::Crypto(_) => 11,
            Self::Io(_) => 12,
            Self::Serialization(_) => 13,
            Self::Internal(_) => 14,
            Self::Staking(_) => 15,
        }
    }

    /// Whether a client may reasonably retry the request against another node.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DownstreamExecution(_))
    }
}
