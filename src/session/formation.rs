//! Deterministic session formation.
//!
//! The draw is seeded from the session header and the block hash at the
//! session start height, then driven by a SHA-256 counter stream:
//!
//! ```text
//! seed     = H(len‖app_key ‖ len‖chain ‖ len‖height ‖ len‖block_hash)
//! draw(i)  = LE64(H(seed ‖ BE64(i))[0..8]) mod remaining
//! ```
//!
//! Candidates are staked servicers advertising the chain, sorted by address,
//! and each draw removes its pick. No local randomness or clock is involved,
//! so the result is bit-identical on every validator.

use super::{Session, SessionHeader};
use crate::chain::{BlockHash, StateCommitmentView, StateView, Validator};
use crate::crypto::{hash_fields, Address};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Counter-based pseudo-random stream for session draws.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    seed: [u8; 32],
    counter: u64,
}

impl SessionSeed {
    /// Seed the stream from a header and the block hash at its height.
    #[must_use]
    pub fn new(header: &SessionHeader, block_hash: &BlockHash) -> Self {
        let seed = hash_fields(&[
            header.application_public_key.as_bytes(),
            header.chain.as_bytes(),
            &header.session_block_height.to_be_bytes(),
            &block_hash.0,
        ]);
        Self { seed, counter: 0 }
    }

    /// Next index in `0..bound`. `bound` must be non-zero.
    pub fn next_index(&mut self, bound: usize) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(self.counter.to_be_bytes());
        let digest = hasher.finalize();
        self.counter += 1;

        let value = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);

        let bound = bound.max(1) as u64;
        usize::try_from(value % bound).unwrap_or(0)
    }
}

/// Draw up to `node_count` servicers for `header` from `state`.
///
/// If fewer eligible servicers exist than `node_count`, the session is
/// smaller than nominal; that is not an error.
///
/// # Errors
///
/// Returns [`Error::ApplicationNotFound`] if the application is not staked at
/// the state's height.
pub fn form_session(
    header: &SessionHeader,
    state: &dyn StateView,
    block_hash: BlockHash,
    node_count: usize,
) -> Result<Session> {
    if state
        .application_by_public_key(&header.application_public_key)
        .is_none()
    {
        return Err(Error::ApplicationNotFound(
            header.application_public_key.short_hex(),
        ));
    }

    let mut candidates: Vec<Address> = state
        .all_validators()
        .iter()
        .filter(|v| v.serves(&header.chain))
        .map(Validator::address)
        .collect();
    candidates.sort_unstable();
    candidates.dedup();

    let mut seed = SessionSeed::new(header, &block_hash);
    let mut nodes = Vec::with_capacity(node_count.min(candidates.len()));
    while nodes.len() < node_count && !candidates.is_empty() {
        let index = seed.next_index(candidates.len());
        nodes.push(candidates.remove(index));
    }

    debug!(
        "Formed session for app {} on chain {} at height {}: {} node(s)",
        header.application_public_key.short_hex(),
        header.chain,
        header.session_block_height,
        nodes.len()
    );

    Ok(Session {
        header: header.clone(),
        nodes,
        block_hash,
    })
}

/// Resolve the block hash and state at the header's height, then form.
///
/// # Errors
///
/// Returns an error if the height cannot be resolved (pruned or not yet
/// produced) or the application is unknown at that height.
pub fn form_session_at(
    chain: &dyn StateCommitmentView,
    header: &SessionHeader,
    node_count: usize,
) -> Result<Session> {
    let block_hash = chain.block_hash_at_height(header.session_block_height)?;
    let state = chain.state_at_height(header.session_block_height)?;
    form_session(header, state.as_ref(), block_hash, node_count)
}
