//! # servicer-node
//!
//! A staked validator node that sells metered access to external
//! ("non-native") blockchains through relayed RPC calls.
//!
//! The crate implements the session-scoped relay metering and fraud
//! detection protocol:
//! - Deterministic session formation from committed chain state
//! - Relay validation, execution and signed responses
//! - A proof-of-relay ledger with replay protection and exactly-once settlement
//! - Challenge adjudication between minority and majority responses
//! - Reward issuance for settled relays
//!
//! ## Architecture
//!
//! The chain is consumed only through the capability traits in [`chain`]:
//! historical state views, block hashes per height, and the staking ledger's
//! balance credit. [`chain::MemoryChain`] implements them for development
//! runs and tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use servicer_node::{NodeBuilder, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::default();
//!     let mut node = NodeBuilder::new(config).build()?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod chain;
pub mod challenge;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod handler;
pub mod ledger;
pub mod metrics;
pub mod node;
pub mod relay;
pub mod reward;
pub mod servicer;
pub mod session;

pub use challenge::{Challenge, ChallengeOutcome, ChallengeResponse, StandingHook};
pub use config::NodeConfig;
pub use crypto::{Address, Keypair, PublicKey, Signature};
pub use error::{Error, ProofError, Result, SessionError};
pub use event::{NodeEvent, NodeEventsChannel};
pub use handler::{Msg, MsgHandler, TxResult};
pub use ledger::{MsgProofOfRelays, ProofLedger};
pub use node::{NodeBuilder, RunningNode};
pub use relay::{EntitlementToken, Relay, RelayPayload, RelayProof, RelayResponse};
pub use servicer::Servicer;
pub use session::{Session, SessionCache, SessionHeader};
