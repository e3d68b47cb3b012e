//! Session state machine.
//!
//! ```text
//! PendingOutgoing --answer--> Active --close--> Closed
//!        |                      ^
//!        +--reject--> Rejected  |
//!                               |
//! PendingIncoming --accept------+
//!        +--reject--> Rejected
//! ```
//!
//! Both pending states may also go straight to `Closed`.

use crate::channel::SessionDescription;
use crate::ids::PeerId;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// We sent an offer and wait for the answer
    PendingOutgoing,
    /// Peer sent an offer; waiting for the application
    PendingIncoming,
    /// Offer answered, transfers allowed
    Active,
    /// Offer declined by either side
    Rejected,
    /// Torn down
    Closed,
}

impl SessionState {
    /// No further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Rejected | SessionState::Closed)
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, to),
            (PendingOutgoing | PendingIncoming, Active | Rejected | Closed) | (Active, Closed)
        )
    }
}

/// Negotiation state with one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Remote peer
    pub peer_id: PeerId,
    /// Node-local handle, unique per negotiator
    pub local_handle: u64,
    /// Current state
    pub state: SessionState,
    /// Raw offer payload the peer sent, if any
    pub remote_offer: Option<Vec<u8>>,
    /// Peer parameters decoded from its offer or answer
    pub remote: Option<SessionDescription>,
}

impl Session {
    pub(crate) fn new(peer_id: PeerId, local_handle: u64, state: SessionState) -> Self {
        Self {
            peer_id,
            local_handle,
            state,
            remote_offer: None,
            remote: None,
        }
    }

    /// Session allows transfers
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}
