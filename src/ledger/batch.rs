//! Batch claim message.

use crate::crypto::{Address, PublicKey};
use crate::error::{Error, Result};
use crate::relay::RelayProof;
use crate::session::SessionHeader;
use serde::{Deserialize, Serialize};

/// Claim for every relay a servicer performed in one closed session.
///
/// Submitted once per (servicer, session); immutable once settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgProofOfRelays {
    /// Session being claimed.
    pub header: SessionHeader,
    /// Servicer claiming the relays.
    pub servicer_public_key: PublicKey,
    /// Client-signed proofs, one per relay.
    pub proofs: Vec<RelayProof>,
    /// Number of relays claimed.
    pub total_relays: u64,
}

impl MsgProofOfRelays {
    /// Address of the claiming servicer.
    #[must_use]
    pub fn servicer_address(&self) -> Address {
        self.servicer_public_key.address()
    }

    /// Encode with `rmp-serde`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode batch: {e}")))
    }

    /// Decode from `rmp-serde` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("Failed to decode batch: {e}")))
    }
}
