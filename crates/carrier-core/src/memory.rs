//! In-process transport.
//!
//! Every [`MemoryTransport`] created from the same root shares one routing
//! table. Registering a peer yields the inbox its frames arrive on, tagged
//! with the sending peer. Used by the integration tests and the CLI demo.

use crate::channel::{ChannelError, PeerChannel, PeerMessage, PeerTransport};
use crate::ids::PeerId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Frames delivered to a registered peer, tagged with the sender
pub type Inbox = mpsc::UnboundedReceiver<(PeerId, PeerMessage)>;

type Routes = DashMap<PeerId, mpsc::UnboundedSender<(PeerId, PeerMessage)>>;

/// Transport backed by in-process channels
#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    routes: Arc<Routes>,
    failing: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// New network with `local` as the sending identity
    pub fn new(local: impl Into<PeerId>) -> Self {
        Self {
            local: local.into(),
            routes: Arc::new(DashMap::new()),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Transport for another identity on the same network
    #[must_use]
    pub fn endpoint(&self, local: impl Into<PeerId>) -> Self {
        Self {
            local: local.into(),
            routes: Arc::clone(&self.routes),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make `peer` reachable, replacing any previous inbox
    pub fn register(&self, peer: impl Into<PeerId>) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(peer.into(), tx);
        rx
    }

    /// Make `peer` unreachable
    pub fn unregister(&self, peer: &PeerId) {
        self.routes.remove(peer);
    }

    /// Fail every send from this endpoint while set
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

struct MemoryChannel {
    local: PeerId,
    peer: PeerId,
    routes: Arc<Routes>,
    failing: Arc<AtomicBool>,
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    async fn send(&self, message: PeerMessage) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Other("simulated failure".to_string()));
        }
        let route = self
            .routes
            .get(&self.peer)
            .map(|tx| tx.clone())
            .ok_or(ChannelError::Closed)?;
        tracing::trace!("{} -> {}: {}", self.local, self.peer, message.kind());
        route
            .send((self.local.clone(), message))
            .map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn open_channel(&self, peer: &PeerId) -> Result<Arc<dyn PeerChannel>, ChannelError> {
        if !self.routes.contains_key(peer) {
            return Err(ChannelError::Unreachable(peer.clone()));
        }
        Ok(Arc::new(MemoryChannel {
            local: self.local.clone(),
            peer: peer.clone(),
            routes: Arc::clone(&self.routes),
            failing: Arc::clone(&self.failing),
        }))
    }
}
