//! Transfer state machine and descriptors.
//!
//! ```text
//! Queried -> Requested -> Accepted -> Transferring <-> Paused
//!                                          |             |
//!                                          +--> Completed <--+
//!
//! any non-terminal -> Rejected | Canceled | Aborted
//! ```

use crate::ids::{FileId, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Sender asked whether the receiver wants the file
    Queried,
    /// Sender formally offered the file
    Requested,
    /// Receiver accepted and allocated storage
    Accepted,
    /// Chunks are flowing
    Transferring,
    /// Chunk flow suspended, bytes kept
    Paused,
    /// All bytes delivered and verified
    Completed,
    /// Receiver declined
    Rejected,
    /// Either side canceled
    Canceled,
    /// Stopped by an error
    Aborted,
}

impl TransferState {
    /// No further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Rejected
                | TransferState::Canceled
                | TransferState::Aborted
        )
    }

    /// Chunks may be accepted in this state
    #[must_use]
    pub fn accepts_chunks(self) -> bool {
        matches!(
            self,
            TransferState::Accepted | TransferState::Transferring | TransferState::Paused
        )
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(self, to: TransferState) -> bool {
        use TransferState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, to) {
            (_, Rejected | Canceled | Aborted) => true,
            (Queried, Requested) => true,
            (Requested, Accepted) => true,
            (Accepted, Transferring) => true,
            (Transferring, Paused | Completed) => true,
            (Paused, Transferring | Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sending file
    Send,
    /// Receiving file
    Receive,
}

/// Why a transfer was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Received content did not match the announced digest
    IntegrityMismatch,
    /// Peer channel failed
    ChannelFailure(String),
    /// Local file I/O failed
    Io(String),
    /// Peer sent a frame that violates the transfer protocol
    Protocol(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::IntegrityMismatch => write!(f, "integrity mismatch"),
            AbortReason::ChannelFailure(msg) => write!(f, "channel failure: {msg}"),
            AbortReason::Io(msg) => write!(f, "I/O error: {msg}"),
            AbortReason::Protocol(msg) => write!(f, "protocol violation: {msg}"),
        }
    }
}

/// Registry record of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// Transfer id
    pub file_id: FileId,
    /// Remote peer
    pub peer_id: PeerId,
    /// File name as announced by the sender
    pub file_name: String,
    /// Resolved receiver-side path, once accepted
    pub full_path: Option<PathBuf>,
    /// Total size; unknown while `Queried`
    pub total_size: Option<u64>,
    /// Bytes delivered so far
    pub transferred_bytes: u64,
    /// Send or receive side
    pub direction: Direction,
    /// Current state
    pub state: TransferState,
}

impl TransferDescriptor {
    /// Outbound descriptor created by a query (size not yet known)
    pub fn queried(
        file_id: FileId,
        peer_id: PeerId,
        file_name: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            file_id,
            peer_id,
            file_name: file_name.into(),
            full_path: None,
            total_size: None,
            transferred_bytes: 0,
            direction,
            state: TransferState::Queried,
        }
    }

    /// Descriptor created directly by a request
    pub fn requested(
        file_id: FileId,
        peer_id: PeerId,
        file_name: impl Into<String>,
        total_size: u64,
        direction: Direction,
    ) -> Self {
        Self {
            total_size: Some(total_size),
            state: TransferState::Requested,
            ..Self::queried(file_id, peer_id, file_name, direction)
        }
    }

    /// Total size, or zero while unknown
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total_size.unwrap_or(0)
    }

    /// Check if the descriptor reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransferState::*;

    const ALL: [TransferState; 9] = [
        Queried,
        Requested,
        Accepted,
        Transferring,
        Paused,
        Completed,
        Rejected,
        Canceled,
        Aborted,
    ];

    #[test]
    fn test_happy_path_transitions() {
        let path = [Queried, Requested, Accepted, Transferring, Paused, Transferring, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(Paused.can_transition(Completed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Completed.can_transition(Paused));
        assert!(!Queried.can_transition(Paused));
        assert!(!Queried.can_transition(Accepted));
        assert!(!Requested.can_transition(Transferring));
        assert!(!Accepted.can_transition(Paused));
        assert!(!Transferring.can_transition(Transferring));
        assert!(!Paused.can_transition(Paused));
    }

    #[test]
    fn test_terminal_states_are_closed() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_any_non_terminal_can_stop() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            for to in [Rejected, Canceled, Aborted] {
                assert!(from.can_transition(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_descriptor_constructors() {
        let queried = TransferDescriptor::queried(
            FileId::from("f1"),
            PeerId::from("a"),
            "a.bin",
            Direction::Send,
        );
        assert_eq!(queried.total_size, None);
        assert_eq!(queried.state, Queried);

        let requested = TransferDescriptor::requested(
            FileId::from("f2"),
            PeerId::from("a"),
            "a.bin",
            1024,
            Direction::Receive,
        );
        assert_eq!(requested.total(), 1024);
        assert_eq!(requested.state, Requested);
    }
}
