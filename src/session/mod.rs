//! Session formation and caching.
//!
//! A session assigns a fixed-size, ordered set of servicers to an
//! (application, chain, session start height) tuple. Formation is a pure
//! function of committed chain state, so every validator derives the same set
//! without coordination.
//!
//! # Architecture
//!
//! ```text
//! SessionHeader
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ Check SessionCache  │
//! └─────────┬───────────┘
//!           │
//!    ┌──────┴──────┐
//!    │             │
//!   HIT          MISS
//!    │             │
//!    ▼             ▼
//!  Session    block hash + state at height
//!                  │
//!                  ▼
//!          seeded SHA-256 draw
//!                  │
//!                  ▼
//!          cache (once per header)
//! ```

mod cache;
mod formation;

pub use cache::{CacheStats, SessionCache};
pub use formation::{form_session, form_session_at, SessionSeed};

use crate::chain::BlockHash;
use crate::crypto::{hash_fields, Address, PublicKey};
use serde::{Deserialize, Serialize};

/// Key identifying a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Public key of the application the session serves.
    pub application_public_key: PublicKey,
    /// Target (non-native) chain identifier.
    pub chain: String,
    /// First block of the session.
    pub session_block_height: u64,
}

impl SessionHeader {
    /// Create a session header.
    #[must_use]
    pub fn new(application_public_key: PublicKey, chain: impl Into<String>, height: u64) -> Self {
        Self {
            application_public_key,
            chain: chain.into(),
            session_block_height: height,
        }
    }

    /// Digest binding every header field.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        hash_fields(&[
            self.application_public_key.as_bytes(),
            self.chain.as_bytes(),
            &self.session_block_height.to_be_bytes(),
        ])
    }
}

/// A formed session. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Header this session was formed for.
    pub header: SessionHeader,
    /// Selected servicers, in draw order.
    pub nodes: Vec<Address>,
    /// Block hash at the session start height that seeded the draw.
    pub block_hash: BlockHash,
}

impl Session {
    /// Whether `address` is one of the session's servicers.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.contains(address)
    }

    /// Number of servicers in the session.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no servicer could be drawn.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
