//! Error types for the Carrier core
//!
//! Errors are categorized to support caller-side retry decisions. The engine
//! itself never retries: every failure is reported once, through the
//! returned error of the call that triggered it and, for transfers, through
//! the terminal event on the [`EventSink`](crate::events::EventSink).
//!
//! # Error Categories
//!
//! - **Transient**: channel or I/O failures that a fresh attempt may survive
//! - **Permanent**: contract violations (unknown ids, invalid transitions,
//!   duplicates) and integrity failures

use crate::ids::{FileId, PeerId};
use crate::session::SessionState;
use crate::transfer::TransferState;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in Carrier operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CarrierError {
    // ============ Session Errors ============
    /// The transport could not provide a channel to the peer
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    /// A non-terminal session already exists for the peer
    #[error("Session already open with peer {0}")]
    AlreadyOpen(PeerId),

    /// No `Active` session exists for the peer
    #[error("No active session with peer {0}")]
    NoActiveSession(PeerId),

    /// No session of any kind exists for the peer
    #[error("Session not found for peer {0}")]
    UnknownSession(PeerId),

    /// Session state machine violation
    #[error("Invalid session transition for {peer_id}: {from:?} -> {to:?}")]
    InvalidSessionTransition {
        /// Peer the session belongs to
        peer_id: PeerId,
        /// Current state
        from: SessionState,
        /// Requested state
        to: SessionState,
    },

    /// The peer's session description names a protocol version we do not speak
    #[error("Peer {peer_id} speaks unsupported protocol version {version}")]
    UnsupportedProtocol {
        /// Peer that sent the description
        peer_id: PeerId,
        /// Version it announced
        version: u16,
    },

    // ============ Transfer Errors ============
    /// Another non-terminal transfer already covers this file, or the id was used before
    #[error("Duplicate transfer of '{file_name}' to peer {peer_id}")]
    DuplicateTransfer {
        /// Peer the transfer targets
        peer_id: PeerId,
        /// File name of the clashing transfer
        file_name: String,
    },

    /// Transfer not found in the registry
    #[error("Transfer not found: {0}")]
    UnknownTransfer(FileId),

    /// Transfer state machine violation
    #[error("Invalid transition for transfer {file_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Transfer id
        file_id: FileId,
        /// Current state
        from: TransferState,
        /// Requested state
        to: TransferState,
    },

    /// Received content does not match the announced digest
    #[error("Integrity verification failed for transfer {0}")]
    IntegrityMismatch(FileId),

    // ============ Channel & I/O Errors ============
    /// Sending on a peer channel failed
    #[error("Channel failure: {0}")]
    ChannelFailure(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    // ============ Configuration & State Errors ============
    /// Caller supplied an unusable request
    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// The node has been shut down
    #[error("Carrier node is shut down")]
    ShutDown,
}

impl CarrierError {
    /// Returns true if a fresh attempt may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CarrierError::ChannelFailure(_)
                | CarrierError::PeerUnreachable(_)
                | CarrierError::Io(_)
        )
    }

    /// Returns true if the failure will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CarrierError::UnknownSession(_)
                | CarrierError::UnknownTransfer(_)
                | CarrierError::DuplicateTransfer { .. }
                | CarrierError::InvalidTransition { .. }
                | CarrierError::InvalidSessionTransition { .. }
                | CarrierError::UnsupportedProtocol { .. }
                | CarrierError::IntegrityMismatch(_)
                | CarrierError::InvalidRequest(_)
                | CarrierError::InvalidConfig(_)
                | CarrierError::ShutDown
        )
    }

    /// Create a channel failure with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        CarrierError::ChannelFailure(Cow::Borrowed(context))
    }

    /// Create an invalid request error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_request(context: &'static str) -> Self {
        CarrierError::InvalidRequest(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        CarrierError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for CarrierError {
    fn from(err: std::io::Error) -> Self {
        CarrierError::Io(err.to_string())
    }
}

impl From<crate::channel::ChannelError> for CarrierError {
    fn from(err: crate::channel::ChannelError) -> Self {
        CarrierError::ChannelFailure(Cow::Owned(err.to_string()))
    }
}

/// Result type for Carrier operations
pub type Result<T> = std::result::Result<T, CarrierError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;

    #[test]
    fn test_transient_errors() {
        assert!(CarrierError::channel("closed").is_transient());
        assert!(CarrierError::PeerUnreachable(PeerId::from("a")).is_transient());
        assert!(CarrierError::Io("disk full".into()).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(CarrierError::UnknownTransfer(FileId::from("f1")).is_permanent());
        assert!(CarrierError::IntegrityMismatch(FileId::from("f1")).is_permanent());
        assert!(
            CarrierError::InvalidTransition {
                file_id: FileId::from("f1"),
                from: TransferState::Completed,
                to: TransferState::Paused,
            }
            .is_permanent()
        );
        assert!(CarrierError::ShutDown.is_permanent());
    }

    #[test]
    fn test_mutual_exclusivity() {
        let errors = [
            CarrierError::channel("x"),
            CarrierError::invalid_request("x"),
            CarrierError::invalid_config("x"),
            CarrierError::AlreadyOpen(PeerId::from("a")),
            CarrierError::NoActiveSession(PeerId::from("a")),
            CarrierError::UnsupportedProtocol {
                peer_id: PeerId::from("a"),
                version: 9,
            },
        ];
        for err in &errors {
            assert!(!(err.is_transient() && err.is_permanent()), "{err}");
        }
    }

    #[test]
    fn test_error_display() {
        let err = CarrierError::InvalidTransition {
            file_id: FileId::from("f1"),
            from: TransferState::Queried,
            to: TransferState::Paused,
        };
        let text = err.to_string();
        assert!(text.contains("f1"));
        assert!(text.contains("Queried"));
        assert!(text.contains("Paused"));
    }

    #[test]
    fn test_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(matches!(CarrierError::from(io_err), CarrierError::Io(_)));

        let err: CarrierError = ChannelError::Closed.into();
        assert!(matches!(err, CarrierError::ChannelFailure(_)));
    }
}
