//! Capability interfaces onto the surrounding chain.
//!
//! The relay core never touches concrete storage. Everything it needs from
//! the chain is expressed by the narrow traits below: validator and
//! application lookups over a historical state view, block hashes and commit
//! references per height, and the staking ledger's balance-credit primitive.
//!
//! [`MemoryChain`] implements all of them in memory for development runs and
//! tests.

mod commit;
mod memory;

pub use commit::{CommitInfo, CommitReference, StoreInfo};
pub use memory::{Genesis, MemoryChain};

use crate::crypto::{Address, PublicKey};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Hash of a committed block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A staked (or unstaking) servicer as seen at some height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Servicer public key.
    pub public_key: PublicKey,
    /// Chains this servicer advertises support for.
    pub chains: BTreeSet<String>,
    /// Public endpoint of the servicer.
    #[serde(default)]
    pub service_url: String,
    /// Staked tokens.
    pub staked_tokens: u64,
    /// Whether the servicer is currently staked (not jailed or unbonding).
    pub staked: bool,
}

impl Validator {
    /// Address of the servicer.
    #[must_use]
    pub fn address(&self) -> Address {
        self.public_key.address()
    }

    /// Whether this servicer can be drawn into sessions for `chain`.
    #[must_use]
    pub fn serves(&self, chain: &str) -> bool {
        self.staked && self.chains.contains(chain)
    }
}

/// A staked application (client identity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Registered application key.
    pub public_key: PublicKey,
    /// Chains the application is authorized to relay to.
    pub chains: BTreeSet<String>,
    /// Staked tokens.
    pub staked_tokens: u64,
    /// Maximum relays per session per servicer, derived from the stake.
    pub max_relays: u64,
}

impl Application {
    /// Build an application whose relay ceiling scales with its stake.
    #[must_use]
    pub fn with_stake(
        public_key: PublicKey,
        chains: BTreeSet<String>,
        staked_tokens: u64,
        relays_per_token: u64,
    ) -> Self {
        let max_relays = staked_tokens.saturating_mul(relays_per_token);
        Self {
            public_key,
            chains,
            staked_tokens,
            max_relays,
        }
    }

    /// Whether the application may relay to `chain`.
    #[must_use]
    pub fn authorizes(&self, chain: &str) -> bool {
        self.chains.contains(chain)
    }
}

/// Servicer lookups over a state view.
pub trait ValidatorLookup: Send + Sync {
    /// Servicer by address, if known at this height.
    fn validator(&self, address: &Address) -> Option<Validator>;

    /// Every servicer known at this height, staked or not.
    fn all_validators(&self) -> Vec<Validator>;

    /// Whether the address belongs to a staked servicer.
    fn is_staked(&self, address: &Address) -> bool {
        self.validator(address).is_some_and(|v| v.staked)
    }
}

/// Application lookups over a state view.
pub trait ApplicationLookup: Send + Sync {
    /// Application registered under `public_key`, if staked at this height.
    fn application_by_public_key(&self, public_key: &PublicKey) -> Option<Application>;
}

/// A read-only view of chain state at one height.
pub trait StateView: ValidatorLookup + ApplicationLookup {
    /// Height of this view.
    fn height(&self) -> u64;
}

/// Historical access to committed state.
pub trait StateCommitmentView: Send + Sync {
    /// Height of the latest committed block.
    fn latest_height(&self) -> u64;

    /// Block hash at `height`.
    ///
    /// # Errors
    ///
    /// Returns an error if the height is pruned or not yet produced.
    fn block_hash_at_height(&self, height: u64) -> Result<BlockHash>;

    /// Commit reference at `height`.
    ///
    /// # Errors
    ///
    /// Returns an error if the height is pruned or not yet produced.
    fn commit_at_height(&self, height: u64) -> Result<CommitReference>;

    /// Read-only state view at `height`.
    ///
    /// # Errors
    ///
    /// Returns an error if the height is pruned or not yet produced.
    fn state_at_height(&self, height: u64) -> Result<Arc<dyn StateView>>;
}

/// Balance-credit primitive of the staking ledger.
pub trait StakingLedger: Send + Sync {
    /// Credit `amount` to `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger rejects the credit; the enclosing
    /// transaction must then abort.
    fn award_coins_to(&self, amount: u128, address: &Address) -> Result<()>;
}

/// First block of the session containing `height`.
///
/// Sessions start at height 1 and last `blocks_per_session` blocks.
#[must_use]
pub fn session_block_height(height: u64, blocks_per_session: u64) -> u64 {
    if height == 0 || blocks_per_session == 0 {
        return height.max(1);
    }
    height - (height - 1) % blocks_per_session
}

/// Whether the session starting at `session_height` has ended at `current_height`.
#[must_use]
pub fn is_session_closed(session_height: u64, current_height: u64, blocks_per_session: u64) -> bool {
    current_height >= session_height.saturating_add(blocks_per_session)
}

/// Oldest session start still inside the claim window at `current_height`.
///
/// A session may be claimed or challenged for `claim_window` full sessions
/// after it closes; anything starting below the returned height has expired.
#[must_use]
pub fn claim_window_start(current_height: u64, blocks_per_session: u64, claim_window: u64) -> u64 {
    session_block_height(current_height, blocks_per_session)
        .saturating_sub(claim_window.saturating_mul(blocks_per_session))
}
