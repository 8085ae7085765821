//! Proof-of-relay ledger.
//!
//! Holds, per servicer per session, the client-signed proof records a node
//! collects while serving, and the set of (servicer, session) pairs whose
//! batch has been settled.
//!
//! ```text
//! relay ──store──▶ local records ──build_batch──▶ MsgProofOfRelays
//!                                                      │
//!                                  are_proofs_valid ◀──┘
//!                                         │
//!                                      settle ──▶ settled (exactly once)
//! ```

mod batch;

pub use batch::MsgProofOfRelays;

use crate::chain::is_session_closed;
use crate::crypto::{Address, PublicKey};
use crate::error::{Error, ProofError, Result};
use crate::relay::{check_index, RelayProof};
use crate::session::SessionHeader;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// File name of the persisted ledger under the node root directory.
pub const LEDGER_FILE: &str = "proof_ledger.mp";

type SessionKey = (Address, SessionHeader);

#[derive(Default)]
struct Inner {
    local: HashMap<SessionKey, BTreeMap<u64, RelayProof>>,
    settled: HashMap<SessionKey, u64>,
}

#[derive(Default, Serialize, Deserialize)]
struct LedgerFile {
    records: Vec<RelayProof>,
    settled: Vec<SettledEntry>,
}

#[derive(Serialize, Deserialize)]
struct SettledEntry {
    servicer: Address,
    header: SessionHeader,
    relays: u64,
}

/// Per-servicer, per-session proof records and settlement state.
#[derive(Default)]
pub struct ProofLedger {
    inner: Mutex<Inner>,
}

impl ProofLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one proof for `servicer`.
    ///
    /// Insert-if-absent: an existing record is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`ProofError::IndexOutOfRange`] outside `1..=max_relays`,
    /// [`ProofError::DuplicateIndex`] if the index was already recorded and
    /// [`ProofError::WrongServicer`] if the proof names another servicer.
    pub fn store(&self, max_relays: u64, servicer: &Address, proof: RelayProof) -> Result<()> {
        check_index(proof.request_index, max_relays)?;
        if proof.servicer_address() != *servicer {
            return Err(ProofError::WrongServicer.into());
        }

        let mut inner = self.inner.lock();
        let records = inner
            .local
            .entry((*servicer, proof.header.clone()))
            .or_default();
        if records.contains_key(&proof.request_index) {
            return Err(ProofError::DuplicateIndex(proof.request_index).into());
        }
        records.insert(proof.request_index, proof);
        Ok(())
    }

    /// Number of records held for (servicer, session).
    #[must_use]
    pub fn record_count(&self, servicer: &Address, header: &SessionHeader) -> usize {
        self.inner
            .lock()
            .local
            .get(&(*servicer, header.clone()))
            .map_or(0, BTreeMap::len)
    }

    /// Whether the (servicer, session) batch has been settled.
    #[must_use]
    pub fn is_settled(&self, servicer: &Address, header: &SessionHeader) -> bool {
        self.inner
            .lock()
            .settled
            .contains_key(&(*servicer, header.clone()))
    }

    /// Re-verify every proof of `batch` and return the number of relays it
    /// may be credited for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProof`] for an empty or heterogeneous batch,
    /// any individually invalid proof, a repeated index, or a claimed total
    /// that differs from the number of unique valid proofs.
    pub fn are_proofs_valid(&self, max_relays: u64, batch: &MsgProofOfRelays) -> Result<u64> {
        if batch.proofs.is_empty() {
            return Err(ProofError::EmptyBatch.into());
        }
        check_homogeneous(batch)?;

        let mut indices = BTreeSet::new();
        for proof in &batch.proofs {
            proof.verify(max_relays)?;
            if !indices.insert(proof.request_index) {
                return Err(ProofError::DuplicateIndex(proof.request_index).into());
            }
        }

        let valid = indices.len() as u64;
        if batch.total_relays != valid {
            return Err(ProofError::OverClaim {
                claimed: batch.total_relays,
                valid,
            }
            .into());
        }
        Ok(valid)
    }

    /// Mark (servicer, session) as settled, running `apply` under the ledger
    /// lock first.
    ///
    /// If `apply` fails nothing is recorded and the batch stays claimable.
    /// Local records of the session are dropped on success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchAlreadySettled`] on a second settlement, or the
    /// error from `apply`.
    pub fn settle<F>(
        &self,
        servicer: &Address,
        header: &SessionHeader,
        relays: u64,
        apply: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut inner = self.inner.lock();
        let key = (*servicer, header.clone());
        if inner.settled.contains_key(&key) {
            return Err(Error::BatchAlreadySettled {
                servicer: *servicer,
                session_height: header.session_block_height,
            });
        }

        apply()?;

        inner.settled.insert(key.clone(), relays);
        inner.local.remove(&key);
        info!(
            "Settled {} relay(s) for {} at session height {}",
            relays, servicer, header.session_block_height
        );
        Ok(())
    }

    /// Assemble a claim from the local records of (servicer, session).
    #[must_use]
    pub fn build_batch(
        &self,
        servicer_public_key: &PublicKey,
        header: &SessionHeader,
    ) -> Option<MsgProofOfRelays> {
        let inner = self.inner.lock();
        let records = inner
            .local
            .get(&(servicer_public_key.address(), header.clone()))?;
        if records.is_empty() {
            return None;
        }

        let proofs: Vec<RelayProof> = records.values().cloned().collect();
        Some(MsgProofOfRelays {
            header: header.clone(),
            servicer_public_key: servicer_public_key.clone(),
            total_relays: proofs.len() as u64,
            proofs,
        })
    }

    /// Sessions of `servicer` with unsettled records whose window has closed.
    #[must_use]
    pub fn closed_sessions(
        &self,
        servicer: &Address,
        current_height: u64,
        blocks_per_session: u64,
    ) -> Vec<SessionHeader> {
        let inner = self.inner.lock();
        let mut headers: Vec<SessionHeader> = inner
            .local
            .iter()
            .filter(|((owner, header), records)| {
                owner == servicer
                    && !records.is_empty()
                    && !inner.settled.contains_key(&(*owner, header.clone()))
                    && is_session_closed(
                        header.session_block_height,
                        current_height,
                        blocks_per_session,
                    )
            })
            .map(|((_, header), _)| header.clone())
            .collect();
        headers.sort();
        headers
    }

    /// Drop records and settlement markers of sessions that started before
    /// `min_height`.
    ///
    /// Callers must refuse claims for such sessions, since a pruned
    /// settlement marker no longer guards against a second payout.
    /// Returns the number of (servicer, session) entries dropped.
    pub fn prune_before(&self, min_height: u64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.local.len() + inner.settled.len();
        inner
            .local
            .retain(|(_, header), _| header.session_block_height >= min_height);
        inner
            .settled
            .retain(|(_, header), _| header.session_block_height >= min_height);
        let pruned = before - inner.local.len() - inner.settled.len();
        if pruned > 0 {
            debug!("Pruned {pruned} ledger entries older than height {min_height}");
        }
        pruned
    }

    /// Write the ledger to `path`.
    ///
    /// The file is written beside the target and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let file = {
            let inner = self.inner.lock();
            LedgerFile {
                records: inner
                    .local
                    .values()
                    .flat_map(|records| records.values().cloned())
                    .collect(),
                settled: inner
                    .settled
                    .iter()
                    .map(|((servicer, header), relays)| SettledEntry {
                        servicer: *servicer,
                        header: header.clone(),
                        relays: *relays,
                    })
                    .collect(),
            }
        };

        let bytes = rmp_serde::to_vec_named(&file)
            .map_err(|e| Error::Serialization(format!("Failed to encode ledger: {e}")))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;

        debug!(
            "Persisted {} record(s), {} settlement(s) to {}",
            file.records.len(),
            file.settled.len(),
            path.display()
        );
        Ok(())
    }

    /// Load a ledger written by [`ProofLedger::persist`].
    ///
    /// A missing file yields an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let bytes = std::fs::read(path)?;
        let file: LedgerFile = rmp_serde::from_slice(&bytes)
            .map_err(|e| Error::Serialization(format!("Failed to decode ledger: {e}")))?;

        let mut inner = Inner::default();
        for record in file.records {
            inner
                .local
                .entry((record.servicer_address(), record.header.clone()))
                .or_default()
                .insert(record.request_index, record);
        }
        for entry in file.settled {
            inner
                .settled
                .insert((entry.servicer, entry.header), entry.relays);
        }

        info!(
            "Loaded proof ledger from {} ({} session(s) unsettled)",
            path.display(),
            inner.local.len()
        );
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }
}

/// Reject batches whose proofs name another servicer or session.
pub(crate) fn check_homogeneous(batch: &MsgProofOfRelays) -> Result<()> {
    let mixed = batch.proofs.iter().any(|proof| {
        proof.servicer_public_key != batch.servicer_public_key || proof.header != batch.header
    });
    if mixed {
        return Err(ProofError::HeterogeneousBatch.into());
    }
    Ok(())
}
