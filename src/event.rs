//! Node event system.

use crate::crypto::Address;
use tokio::sync::broadcast;

/// Events emitted by the node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Node has started successfully.
    Started,

    /// Node is shutting down.
    ShuttingDown,

    /// A relay was served.
    RelayServed {
        /// Chain the relay was forwarded to.
        chain: String,
    },

    /// A proof batch was settled and rewarded.
    BatchSettled {
        /// Servicer credited.
        servicer: Address,
        /// Session start height.
        session_height: u64,
        /// Relays credited.
        relays: u64,
    },

    /// A challenge was accepted.
    ChallengeAccepted {
        /// Servicer that returned the minority response.
        accused: Address,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving node events.
pub type NodeEventsChannel = broadcast::Receiver<NodeEvent>;

/// Sender for node events.
pub type NodeEventsSender = broadcast::Sender<NodeEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (NodeEventsSender, NodeEventsChannel) {
    broadcast::channel(256)
}
