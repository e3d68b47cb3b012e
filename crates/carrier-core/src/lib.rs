//! # Carrier Core
//!
//! Session negotiation and file transfer for a Carrier node.
//!
//! This crate provides:
//! - Per-peer session negotiation (offer, accept, reject, close)
//! - A registry of file transfers and their state machine
//! - Chunked, windowed, pausable transfers with BLAKE3 verification
//! - An ordered event sink for the embedding application
//! - An in-process transport for tests and demos
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         CarrierNode                              │
//! │   (explicit composition, inbound dispatch, shutdown)             │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │      SessionNegotiator         │      FileTransferEngine        │
//! │   (one session per peer)       │   (registry, chunk windows)    │
//! ├────────────────────────────────┴────────────────────────────────┤
//! │                    PeerTransport / PeerChannel                   │
//! │   (ordered frame delivery, supplied by the host)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ids;
pub mod memory;
pub mod negotiator;
pub mod node;
pub mod progress;
pub mod registry;
pub mod session;
pub mod transfer;

pub use channel::{
    ChannelError, ControlAction, PROTOCOL_VERSION, PeerChannel, PeerMessage, PeerTransport,
    SessionDescription, TransportEvent,
};
pub use config::{CarrierConfig, EventConfig, LoggingConfig, PartialFilePolicy, TransferConfig};
pub use engine::FileTransferEngine;
pub use error::{CarrierError, Result};
pub use events::{ConnectionStatus, Event, EventSink};
pub use ids::{FileId, PeerId};
pub use memory::{Inbox, MemoryTransport};
pub use negotiator::SessionNegotiator;
pub use node::CarrierNode;
pub use registry::TransferRegistry;
pub use session::{Session, SessionState};
pub use transfer::{AbortReason, Direction, TransferDescriptor, TransferState};

pub use carrier_files::FileSource;
