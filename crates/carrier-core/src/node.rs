//! Carrier node
//!
//! Explicit composition of one node's negotiator, transfer engine and event
//! sink. There is no global instance: create as many nodes as needed, each
//! with its own transport.

use crate::channel::{PROTOCOL_VERSION, PeerMessage, PeerTransport, SessionDescription, TransportEvent};
use crate::config::CarrierConfig;
use crate::engine::FileTransferEngine;
use crate::error::{CarrierError, Result};
use crate::events::{ConnectionStatus, Event, EventSink};
use crate::ids::{FileId, PeerId};
use crate::memory::Inbox;
use crate::negotiator::SessionNegotiator;
use crate::session::Session;
use crate::transfer::TransferDescriptor;
use carrier_files::FileSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

/// Node inner state
struct NodeInner {
    config: CarrierConfig,
    events: Arc<EventSink>,
    sessions: Arc<SessionNegotiator>,
    engine: FileTransferEngine,
    running: AtomicBool,
}

/// Carrier node handle
///
/// Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct CarrierNode {
    inner: Arc<NodeInner>,
}

impl CarrierNode {
    /// Create a node on top of `transport`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is unusable.
    pub fn new(config: CarrierConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventSink::with_capacity(config.events.capacity));
        let local = SessionDescription {
            protocol_version: PROTOCOL_VERSION,
            chunk_size: u32::try_from(config.transfer.chunk_size).unwrap_or(u32::MAX),
            window_size: u32::try_from(config.transfer.window_size).unwrap_or(u32::MAX),
        };
        let sessions = Arc::new(SessionNegotiator::new(transport, Arc::clone(&events), local));
        let engine = FileTransferEngine::new(
            config.transfer.clone(),
            Arc::clone(&sessions),
            Arc::clone(&events),
        );

        tracing::debug!(
            "Carrier node created (chunk_size={}, window_size={})",
            config.transfer.chunk_size,
            config.transfer.window_size
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                events,
                sessions,
                engine,
                running: AtomicBool::new(true),
            }),
        })
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &CarrierConfig {
        &self.inner.config
    }

    /// Event sink of this node
    #[must_use]
    pub fn events(&self) -> &Arc<EventSink> {
        &self.inner.events
    }

    /// Transfer engine of this node
    #[must_use]
    pub fn engine(&self) -> &FileTransferEngine {
        &self.inner.engine
    }

    /// Check if the node has not been shut down
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CarrierError::ShutDown)
        }
    }

    // ============ Sessions ============

    /// Live session with `peer`, if any
    pub fn session(&self, peer: &PeerId) -> Option<Session> {
        self.inner.sessions.session(peer)
    }

    /// Offer a session to `peer`
    ///
    /// # Errors
    ///
    /// See [`SessionNegotiator::open_session`].
    pub async fn open_session(&self, peer: &PeerId) -> Result<Session> {
        self.ensure_running()?;
        self.inner.sessions.open_session(peer).await
    }

    /// Accept the pending offer from `peer`
    ///
    /// # Errors
    ///
    /// See [`SessionNegotiator::accept_session`].
    pub async fn accept_session(&self, peer: &PeerId) -> Result<Session> {
        self.ensure_running()?;
        self.inner.sessions.accept_session(peer).await
    }

    /// Decline the pending offer from `peer`
    ///
    /// # Errors
    ///
    /// See [`SessionNegotiator::reject_session`].
    pub async fn reject_session(&self, peer: &PeerId, reason: &str) -> Result<()> {
        self.ensure_running()?;
        self.inner.sessions.reject_session(peer, reason).await
    }

    /// Close the session with `peer` and cancel its transfers
    ///
    /// Idempotent: closing an absent or closed session does nothing.
    pub async fn close_session(&self, peer: &PeerId) {
        if self.inner.sessions.close_session(peer).await {
            let canceled = self.inner.engine.cancel_peer(peer).await;
            if canceled > 0 {
                tracing::info!("Canceled {} transfer(s) with {}", canceled, peer);
            }
        }
    }

    async fn fail_peer(&self, peer: &PeerId, reason: &str) {
        self.inner.engine.fail_peer(peer, reason).await;
    }

    // ============ Transfers ============

    /// See [`FileTransferEngine::query`]
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), else as the engine.
    pub async fn query(&self, peer: &PeerId, file_name: &str, message: &str) -> Result<FileId> {
        self.ensure_running()?;
        self.inner.engine.query(peer, file_name, message).await
    }

    /// See [`FileTransferEngine::request`]
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), else as the engine.
    pub async fn request(
        &self,
        peer: &PeerId,
        file_id: &FileId,
        file_name: &str,
        source: FileSource,
    ) -> Result<()> {
        self.ensure_running()?;
        self.inner
            .engine
            .request(peer, file_id, file_name, source)
            .await
    }

    /// See [`FileTransferEngine::send_file`]
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), else as the engine.
    pub async fn send_file(&self, peer: &PeerId, path: impl AsRef<Path>) -> Result<FileId> {
        self.ensure_running()?;
        self.inner.engine.send_file(peer, path).await
    }

    /// See [`FileTransferEngine::accept`]
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), else as the engine.
    pub async fn accept(&self, file_id: &FileId, destination: impl AsRef<Path>) -> Result<PathBuf> {
        self.ensure_running()?;
        self.inner.engine.accept(file_id, destination).await
    }

    /// See [`FileTransferEngine::reject`]
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), else as the engine.
    pub async fn reject(&self, file_id: &FileId, reason: &str) -> Result<()> {
        self.ensure_running()?;
        self.inner.engine.reject(file_id, reason).await
    }

    /// See [`FileTransferEngine::pause`]
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), else as the engine.
    pub async fn pause(&self, file_id: &FileId) -> Result<()> {
        self.ensure_running()?;
        self.inner.engine.pause(file_id).await
    }

    /// See [`FileTransferEngine::resume`]
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), else as the engine.
    pub async fn resume(&self, file_id: &FileId) -> Result<()> {
        self.ensure_running()?;
        self.inner.engine.resume(file_id).await
    }

    /// See [`FileTransferEngine::cancel`]
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), else as the engine.
    pub async fn cancel(&self, file_id: &FileId) -> Result<()> {
        self.ensure_running()?;
        self.inner.engine.cancel(file_id).await
    }

    /// Snapshot of a transfer, active or finished
    pub fn transfer(&self, file_id: &FileId) -> Option<TransferDescriptor> {
        self.inner.engine.descriptor(file_id)
    }

    // ============ Inbound ============

    /// Dispatch one inbound frame from `peer`
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` after [`shutdown`](Self::shutdown), or the error
    /// that made the frame unusable.
    pub async fn handle_message(&self, peer: &PeerId, message: PeerMessage) -> Result<()> {
        self.ensure_running()?;
        tracing::trace!("{} from {}", message.kind(), peer);

        let sessions = &self.inner.sessions;
        let result = match message {
            PeerMessage::SessionOffer { payload } => sessions.on_incoming_offer(peer, payload).await,
            PeerMessage::SessionAnswer { payload } => sessions.on_answer(peer, payload).await,
            PeerMessage::SessionReject { reason } => sessions.on_rejected(peer, reason),
            PeerMessage::SessionClose => {
                if sessions.on_remote_close(peer) {
                    self.inner.engine.cancel_peer(peer).await;
                }
                Ok(())
            }
            other => self.inner.engine.handle_frame(peer, other).await,
        };

        if let Err(CarrierError::ChannelFailure(reason)) = &result {
            if sessions.session(peer).is_some() {
                self.fail_peer(peer, reason).await;
            }
        }
        result
    }

    /// React to a connectivity notification
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        if !self.is_running() {
            return;
        }
        let events = &self.inner.events;
        match event {
            TransportEvent::Idle => events.emit(Event::IdleNotice),
            TransportEvent::NetworkConnected => events.emit(Event::ConnectionChanged {
                peer: None,
                status: ConnectionStatus::Connected,
            }),
            TransportEvent::NetworkDisconnected => events.emit(Event::ConnectionChanged {
                peer: None,
                status: ConnectionStatus::Disconnected,
            }),
            TransportEvent::PeerConnected(peer) => events.emit(Event::ConnectionChanged {
                peer: Some(peer),
                status: ConnectionStatus::Connected,
            }),
            TransportEvent::PeerDisconnected(peer) => {
                events.emit(Event::ConnectionChanged {
                    peer: Some(peer.clone()),
                    status: ConnectionStatus::Disconnected,
                });
                self.fail_peer(&peer, "peer disconnected").await;
            }
        }
    }

    /// Feed every frame arriving on `inbox` into [`handle_message`](Self::handle_message), in order
    pub fn spawn_inbox(&self, mut inbox: Inbox) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some((peer, message)) = inbox.recv().await {
                let kind = message.kind();
                match node.handle_message(&peer, message).await {
                    Ok(()) => {}
                    Err(CarrierError::ShutDown) => break,
                    Err(err) => tracing::warn!("Dropped {} from {}: {}", kind, peer, err),
                }
            }
            tracing::debug!("Inbox closed");
        })
    }

    /// Close every session and refuse further operations
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down Carrier node");
        for peer in self.inner.sessions.peers() {
            if self.inner.sessions.close_session(&peer).await {
                self.inner.engine.cancel_peer(&peer).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;

    fn node(transport: MemoryTransport) -> CarrierNode {
        CarrierNode::new(CarrierConfig::default(), Arc::new(transport)).unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = CarrierConfig::default();
        config.transfer.window_size = 0;
        let result = CarrierNode::new(config, Arc::new(MemoryTransport::new("A")));
        assert!(matches!(result, Err(CarrierError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_transport_events() {
        let node = node(MemoryTransport::new("A"));
        node.handle_transport_event(TransportEvent::Idle).await;
        node.handle_transport_event(TransportEvent::NetworkConnected).await;
        node.handle_transport_event(TransportEvent::PeerConnected(PeerId::from("B")))
            .await;
        assert_eq!(
            node.events().drain(),
            vec![
                Event::IdleNotice,
                Event::ConnectionChanged {
                    peer: None,
                    status: ConnectionStatus::Connected
                },
                Event::ConnectionChanged {
                    peer: Some(PeerId::from("B")),
                    status: ConnectionStatus::Connected
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_session() {
        let transport = MemoryTransport::new("A");
        let _inbox = transport.register("B");
        let node = node(transport);
        let peer = PeerId::from("B");

        node.open_session(&peer).await.unwrap();
        node.handle_message(&peer, PeerMessage::SessionAnswer { payload: vec![] })
            .await
            .unwrap();
        node.events().drain();

        node.handle_transport_event(TransportEvent::PeerDisconnected(peer.clone()))
            .await;
        assert_eq!(
            node.events().drain(),
            vec![
                Event::ConnectionChanged {
                    peer: Some(peer.clone()),
                    status: ConnectionStatus::Disconnected
                },
                Event::SessionClosed { peer_id: peer.clone() },
            ]
        );
        assert!(node.session(&peer).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let transport = MemoryTransport::new("A");
        let _inbox = transport.register("B");
        let node = node(transport);
        let peer = PeerId::from("B");
        node.open_session(&peer).await.unwrap();
        node.events().drain();

        node.shutdown().await;
        node.shutdown().await;
        assert!(!node.is_running());
        assert_eq!(
            node.events().drain(),
            vec![Event::SessionClosed { peer_id: peer.clone() }]
        );
        assert_eq!(
            node.open_session(&peer).await.unwrap_err(),
            CarrierError::ShutDown
        );
        assert_eq!(
            node.handle_message(&peer, PeerMessage::SessionClose)
                .await
                .unwrap_err(),
            CarrierError::ShutDown
        );
    }
}
