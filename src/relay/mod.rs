//! Relays: inbound requests, their proofs, and forwarding to hosted chains.

mod executor;
mod types;

pub use executor::{HttpExecutor, RelayExecutor};
pub use types::{check_index, EntitlementToken, Relay, RelayPayload, RelayProof, RelayResponse};
