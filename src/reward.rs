//! Reward issuance for settled relays.

use crate::chain::StakingLedger;
use crate::crypto::Address;
use crate::error::{Error, Result};
use tracing::debug;

/// Default reward per verified relay, in the smallest coin unit.
pub const DEFAULT_RELAY_REWARD: u64 = 1_000;

/// Credit `relays * rate` to `to` through the staking ledger.
///
/// # Errors
///
/// Returns [`Error::Staking`] if the amount overflows, or the ledger's error
/// if it rejects the credit. Either aborts the enclosing batch commit.
pub fn award_coins_for_relays(
    staking: &dyn StakingLedger,
    relays: u64,
    to: &Address,
    rate: u128,
) -> Result<u128> {
    let amount = u128::from(relays)
        .checked_mul(rate)
        .ok_or_else(|| Error::Staking(format!("reward for {relays} relays overflows")))?;

    staking.award_coins_to(amount, to)?;
    debug!("Awarded {} for {} relay(s) to {}", amount, relays, to);
    Ok(amount)
}
