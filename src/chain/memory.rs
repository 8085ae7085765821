//! In-memory chain backend.
//!
//! Keeps one immutable snapshot per committed height so historical session
//! reconstruction and challenge adjudication can read past state exactly as
//! a real multi-store would serve it.

use super::{
    Application, ApplicationLookup, BlockHash, CommitInfo, CommitReference, StakingLedger,
    StateCommitmentView, StateView, StoreInfo, Validator, ValidatorLookup,
};
use crate::crypto::{hash_fields, Address, PublicKey};
use crate::error::{Error, Result, SessionError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Initial staking state for a development chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Genesis {
    /// Staked servicers.
    #[serde(default)]
    pub validators: Vec<Validator>,
    /// Staked applications.
    #[serde(default)]
    pub applications: Vec<Application>,
}

impl Genesis {
    /// Load a genesis file (TOML).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    height: u64,
    validators: BTreeMap<Address, Validator>,
    applications: BTreeMap<PublicKey, Application>,
}

impl Snapshot {
    fn pos_hash(&self) -> BlockHash {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        for (address, validator) in &self.validators {
            fields.push(address.as_bytes().to_vec());
            fields.push(vec![u8::from(validator.staked)]);
            fields.push(validator.staked_tokens.to_be_bytes().to_vec());
            for chain in &validator.chains {
                fields.push(chain.as_bytes().to_vec());
            }
        }
        let refs: Vec<&[u8]> = fields.iter().map(Vec::as_slice).collect();
        BlockHash(hash_fields(&refs))
    }

    fn apps_hash(&self) -> BlockHash {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        for (key, app) in &self.applications {
            fields.push(key.as_bytes().to_vec());
            fields.push(app.max_relays.to_be_bytes().to_vec());
            for chain in &app.chains {
                fields.push(chain.as_bytes().to_vec());
            }
        }
        let refs: Vec<&[u8]> = fields.iter().map(Vec::as_slice).collect();
        BlockHash(hash_fields(&refs))
    }
}

impl ValidatorLookup for Snapshot {
    fn validator(&self, address: &Address) -> Option<Validator> {
        self.validators.get(address).cloned()
    }

    fn all_validators(&self) -> Vec<Validator> {
        self.validators.values().cloned().collect()
    }
}

impl ApplicationLookup for Snapshot {
    fn application_by_public_key(&self, public_key: &PublicKey) -> Option<Application> {
        self.applications.get(public_key).cloned()
    }
}

impl StateView for Snapshot {
    fn height(&self) -> u64 {
        self.height
    }
}

struct CommittedBlock {
    snapshot: Arc<Snapshot>,
    commit: CommitInfo,
}

#[derive(Default)]
struct Inner {
    working: Snapshot,
    committed: BTreeMap<u64, CommittedBlock>,
    balances: HashMap<Address, u128>,
    reject_awards: bool,
}

/// An in-memory chain with per-height snapshots and a balance ledger.
#[derive(Default)]
pub struct MemoryChain {
    inner: RwLock<Inner>,
}

impl MemoryChain {
    /// Create an empty chain with no committed blocks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain from genesis and commit block 1.
    #[must_use]
    pub fn from_genesis(genesis: Genesis) -> Self {
        let chain = Self::new();
        for validator in genesis.validators {
            chain.stake_validator(validator);
        }
        for app in genesis.applications {
            chain.stake_application(app);
        }
        chain.commit_block();
        info!(
            "Development chain initialized at height {}",
            chain.latest_height()
        );
        chain
    }

    /// Stake (or update) a servicer in the working state.
    pub fn stake_validator(&self, validator: Validator) {
        let mut inner = self.inner.write();
        inner.working.validators.insert(validator.address(), validator);
    }

    /// Mark a servicer as unstaked in the working state.
    pub fn unstake_validator(&self, address: &Address) {
        let mut inner = self.inner.write();
        if let Some(validator) = inner.working.validators.get_mut(address) {
            validator.staked = false;
        }
    }

    /// Stake (or update) an application in the working state.
    pub fn stake_application(&self, app: Application) {
        let mut inner = self.inner.write();
        inner.working.applications.insert(app.public_key.clone(), app);
    }

    /// Remove an application from the working state.
    pub fn unstake_application(&self, public_key: &PublicKey) {
        self.inner.write().working.applications.remove(public_key);
    }

    /// Commit the working state as the next block.
    pub fn commit_block(&self) -> CommitReference {
        let mut inner = self.inner.write();
        let height = inner.committed.keys().next_back().map_or(1, |h| h + 1);

        let mut snapshot = inner.working.clone();
        snapshot.height = height;

        let commit = CommitInfo {
            version: height,
            store_infos: vec![
                StoreInfo {
                    name: "pos".to_string(),
                    commit_id: CommitReference {
                        height,
                        hash: snapshot.pos_hash(),
                    },
                },
                StoreInfo {
                    name: "application".to_string(),
                    commit_id: CommitReference {
                        height,
                        hash: snapshot.apps_hash(),
                    },
                },
            ],
        };
        let reference = commit.commit_reference();

        debug!("Committed block {} ({})", height, reference.hash);
        inner.committed.insert(
            height,
            CommittedBlock {
                snapshot: Arc::new(snapshot),
                commit,
            },
        );
        reference
    }

    /// Commit empty blocks until the chain reaches `height`.
    pub fn advance_to(&self, height: u64) {
        while self.latest_height() < height {
            self.commit_block();
        }
    }

    /// Drop committed state below `height`.
    pub fn prune_below(&self, height: u64) {
        let mut inner = self.inner.write();
        inner.committed = inner.committed.split_off(&height);
    }

    /// Balance credited to `address` by reward issuance.
    #[must_use]
    pub fn balance(&self, address: &Address) -> u128 {
        self.inner.read().balances.get(address).copied().unwrap_or(0)
    }

    /// Make every subsequent credit fail.
    pub fn set_reject_awards(&self, reject: bool) {
        self.inner.write().reject_awards = reject;
    }

    fn block(&self, height: u64) -> Result<(Arc<Snapshot>, CommitInfo)> {
        let inner = self.inner.read();
        inner
            .committed
            .get(&height)
            .map(|b| (Arc::clone(&b.snapshot), b.commit.clone()))
            .ok_or_else(|| SessionError::UnknownHeight(height).into())
    }
}

impl StateCommitmentView for MemoryChain {
    fn latest_height(&self) -> u64 {
        self.inner
            .read()
            .committed
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    fn block_hash_at_height(&self, height: u64) -> Result<BlockHash> {
        self.block(height).map(|(_, commit)| commit.hash())
    }

    fn commit_at_height(&self, height: u64) -> Result<CommitReference> {
        self.block(height).map(|(_, commit)| commit.commit_reference())
    }

    fn state_at_height(&self, height: u64) -> Result<Arc<dyn StateView>> {
        let (snapshot, _) = self.block(height)?;
        Ok(snapshot)
    }
}

impl StakingLedger for MemoryChain {
    fn award_coins_to(&self, amount: u128, address: &Address) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.reject_awards {
            return Err(Error::Staking(format!("credit to {address} rejected")));
        }

        let balance = inner.balances.entry(*address).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| Error::Staking(format!("balance overflow for {address}")))?;
        Ok(())
    }
}
