//! Multi-store commit records.
//!
//! A commit is a version plus one commit id per named sub-store. The relay
//! core only ever consumes the resulting [`CommitReference`]; the store
//! breakdown exists so backends can derive a tamper-evident block hash.

use super::BlockHash;
use crate::crypto::hash_fields;
use serde::{Deserialize, Serialize};

/// Fingerprint of chain state at one height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CommitReference {
    /// Version (block height) of the commit.
    pub height: u64,
    /// Hash committing to the state at that height.
    pub hash: BlockHash,
}

/// Commit of a single named sub-store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Store name.
    pub name: String,
    /// Commit id of the store at this version.
    pub commit_id: CommitReference,
}

/// Commit of every sub-store at one version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Version (block height).
    pub version: u64,
    /// Per-store commits.
    pub store_infos: Vec<StoreInfo>,
}

impl CommitInfo {
    /// Hash over the version and the name-sorted store commits.
    #[must_use]
    pub fn hash(&self) -> BlockHash {
        let mut stores: Vec<&StoreInfo> = self.store_infos.iter().collect();
        stores.sort_by(|a, b| a.name.cmp(&b.name));

        let version = self.version.to_be_bytes();
        let mut fields: Vec<&[u8]> = vec![version.as_slice()];
        let heights: Vec<[u8; 8]> = stores
            .iter()
            .map(|s| s.commit_id.height.to_be_bytes())
            .collect();
        for (store, height) in stores.iter().zip(&heights) {
            fields.push(store.name.as_bytes());
            fields.push(height);
            fields.push(&store.commit_id.hash.0);
        }

        BlockHash(hash_fields(&fields))
    }

    /// Commit reference for this version.
    #[must_use]
    pub fn commit_reference(&self) -> CommitReference {
        CommitReference {
            height: self.version,
            hash: self.hash(),
        }
    }
}
