//! Peer channel abstraction and protocol frames.
//!
//! A [`PeerChannel`] is an ordered, reliable, already-authenticated message
//! pipe to exactly one peer. A [`PeerTransport`] hands out channels by
//! [`PeerId`]. Real transports (DHT, relays, encryption) live outside this
//! crate; [`MemoryTransport`](crate::memory::MemoryTransport) wires nodes
//! together in-process.

use crate::ids::{FileId, PeerId};
use crate::transfer::AbortReason;
use async_trait::async_trait;
use carrier_files::Digest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Protocol version advertised in session offers
pub const PROTOCOL_VERSION: u16 = 1;

/// Peer channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Channel is closed
    #[error("Channel is closed")]
    Closed,

    /// Peer cannot be reached
    #[error("Peer unreachable: {0}")]
    Unreachable(PeerId),

    /// Channel-specific error
    #[error("Channel error: {0}")]
    Other(String),
}

/// Ordered, reliable message channel to one peer
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Remote end of the channel
    fn peer_id(&self) -> &PeerId;

    /// Enqueue one frame for delivery.
    ///
    /// Frames are delivered in send order or not at all.
    ///
    /// # Errors
    /// Returns `ChannelError` if the frame cannot be delivered
    async fn send(&self, message: PeerMessage) -> Result<(), ChannelError>;
}

/// Source of peer channels
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open (or reuse) a channel to `peer`.
    ///
    /// # Errors
    /// Returns `ChannelError::Unreachable` if no channel can be provided
    async fn open_channel(&self, peer: &PeerId) -> Result<Arc<dyn PeerChannel>, ChannelError>;
}

/// Local session parameters carried in the offer payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Frame protocol version
    pub protocol_version: u16,
    /// Chunk size the offering side sends with
    pub chunk_size: u32,
    /// Unacknowledged chunks the offering side keeps in flight
    pub window_size: u32,
}

impl SessionDescription {
    /// Encode as an opaque offer/answer payload
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a payload produced by [`to_payload`](Self::to_payload)
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}

/// Transfer control actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAction {
    /// Suspend chunk flow
    Pause,
    /// Resume chunk flow
    Resume,
    /// Stop the transfer
    Cancel,
    /// Receiver verified the content
    Complete,
    /// Transfer failed
    Abort(AbortReason),
}

/// Protocol frames exchanged between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Session offer with the opaque local description
    SessionOffer {
        /// Offer payload
        payload: Vec<u8>,
    },
    /// Answer to a pending offer
    SessionAnswer {
        /// Answer payload
        payload: Vec<u8>,
    },
    /// Offer declined
    SessionReject {
        /// Human-readable reason
        reason: String,
    },
    /// Session torn down
    SessionClose,
    /// Ask whether the peer wants a file
    FileQuery {
        /// Transfer id
        file_id: FileId,
        /// Announced file name
        file_name: String,
        /// Free-form note to the receiver
        message: String,
    },
    /// Formal offer of a file
    FileRequest {
        /// Transfer id
        file_id: FileId,
        /// Announced file name
        file_name: String,
        /// Exact byte length
        total_size: u64,
        /// BLAKE3 digest of the content
        digest: Digest,
    },
    /// Receiver accepted and allocated storage
    FileAccept {
        /// Transfer id
        file_id: FileId,
        /// Receiver-side path
        full_path: String,
        /// Exact byte length
        total_size: u64,
    },
    /// Receiver declined
    FileReject {
        /// Transfer id
        file_id: FileId,
        /// Human-readable reason
        reason: String,
    },
    /// File data
    Chunk {
        /// Transfer id
        file_id: FileId,
        /// Byte offset of the payload
        offset: u64,
        /// Chunk bytes
        payload: Vec<u8>,
    },
    /// Cumulative acknowledgement of received bytes
    ChunkAck {
        /// Transfer id
        file_id: FileId,
        /// Bytes written so far
        received: u64,
    },
    /// Transfer control
    Control {
        /// Transfer id
        file_id: FileId,
        /// Action
        action: ControlAction,
    },
}

impl PeerMessage {
    /// Transfer the frame belongs to, if any
    #[must_use]
    pub fn file_id(&self) -> Option<&FileId> {
        match self {
            PeerMessage::FileQuery { file_id, .. }
            | PeerMessage::FileRequest { file_id, .. }
            | PeerMessage::FileAccept { file_id, .. }
            | PeerMessage::FileReject { file_id, .. }
            | PeerMessage::Chunk { file_id, .. }
            | PeerMessage::ChunkAck { file_id, .. }
            | PeerMessage::Control { file_id, .. } => Some(file_id),
            PeerMessage::SessionOffer { .. }
            | PeerMessage::SessionAnswer { .. }
            | PeerMessage::SessionReject { .. }
            | PeerMessage::SessionClose => None,
        }
    }

    /// Short frame name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::SessionOffer { .. } => "SessionOffer",
            PeerMessage::SessionAnswer { .. } => "SessionAnswer",
            PeerMessage::SessionReject { .. } => "SessionReject",
            PeerMessage::SessionClose => "SessionClose",
            PeerMessage::FileQuery { .. } => "FileQuery",
            PeerMessage::FileRequest { .. } => "FileRequest",
            PeerMessage::FileAccept { .. } => "FileAccept",
            PeerMessage::FileReject { .. } => "FileReject",
            PeerMessage::Chunk { .. } => "Chunk",
            PeerMessage::ChunkAck { .. } => "ChunkAck",
            PeerMessage::Control { .. } => "Control",
        }
    }
}

/// Connectivity notifications from the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Transport loop is idle
    Idle,
    /// Node joined the network
    NetworkConnected,
    /// Node lost the network
    NetworkDisconnected,
    /// Friend came online
    PeerConnected(PeerId),
    /// Friend went offline
    PeerDisconnected(PeerId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_payload() {
        let desc = SessionDescription {
            protocol_version: PROTOCOL_VERSION,
            chunk_size: 16384,
            window_size: 8,
        };
        let payload = desc.to_payload();
        assert_eq!(SessionDescription::from_payload(&payload), Some(desc));
        assert_eq!(SessionDescription::from_payload(b"not json"), None);
    }

    #[test]
    fn test_message_file_id() {
        let chunk = PeerMessage::Chunk {
            file_id: FileId::from("f1"),
            offset: 0,
            payload: vec![1, 2, 3],
        };
        assert_eq!(chunk.file_id(), Some(&FileId::from("f1")));
        assert_eq!(chunk.kind(), "Chunk");
        assert_eq!(PeerMessage::SessionClose.file_id(), None);
    }

    #[test]
    fn test_control_frame_serializes() {
        let frame = PeerMessage::Control {
            file_id: FileId::from("f1"),
            action: ControlAction::Abort(AbortReason::IntegrityMismatch),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: PeerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
