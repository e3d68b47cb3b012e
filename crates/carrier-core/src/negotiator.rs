//! Session negotiation for Carrier nodes
//!
//! Runs the offer/answer handshake with each friend and owns the peer
//! channel of every live session.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                        Responder
//!     |                                |
//!     |------ SessionOffer ----------->|  IncomingSessionRequest
//!     |                                |
//!     |<----- SessionAnswer -----------|  accept_session
//!     |                                |
//!  SessionReady                   SessionReady
//! ```
//!
//! If both sides offer at once, each treats the other's offer as the answer
//! to its own and both become `Active`.
//!
//! Offers and answers carrying a [`SessionDescription`] of another protocol
//! version are refused. Payloads that do not decode as a description are
//! kept as opaque offers.
//!
//! Sessions live in a `DashMap` keyed by peer. Only non-terminal sessions are
//! stored; map guards are never held across `.await`.

use crate::channel::{PROTOCOL_VERSION, PeerChannel, PeerMessage, PeerTransport, SessionDescription};
use crate::error::{CarrierError, Result};
use crate::events::{Event, EventSink};
use crate::ids::PeerId;
use crate::session::{Session, SessionState};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Decode the peer's description, refusing other protocol versions
fn remote_description(peer: &PeerId, payload: &[u8]) -> Result<Option<SessionDescription>> {
    match SessionDescription::from_payload(payload) {
        Some(remote) if remote.protocol_version != PROTOCOL_VERSION => {
            Err(CarrierError::UnsupportedProtocol {
                peer_id: peer.clone(),
                version: remote.protocol_version,
            })
        }
        remote => Ok(remote),
    }
}

struct SessionEntry {
    session: Session,
    channel: Option<Arc<dyn PeerChannel>>,
}

/// Per-node session negotiator
pub struct SessionNegotiator {
    sessions: DashMap<PeerId, SessionEntry>,
    transport: Arc<dyn PeerTransport>,
    events: Arc<EventSink>,
    local: SessionDescription,
    next_handle: AtomicU64,
}

impl SessionNegotiator {
    /// Create a negotiator offering `local` to every peer
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        events: Arc<EventSink>,
        local: SessionDescription,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            transport,
            events,
            local,
            next_handle: AtomicU64::new(1),
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    async fn channel_to(&self, peer: &PeerId) -> Result<Arc<dyn PeerChannel>> {
        self.transport.open_channel(peer).await.map_err(|err| {
            tracing::debug!("No channel to {}: {}", peer, err);
            CarrierError::PeerUnreachable(peer.clone())
        })
    }

    /// Snapshot of the live session with `peer`
    pub fn session(&self, peer: &PeerId) -> Option<Session> {
        self.sessions.get(peer).map(|entry| entry.session.clone())
    }

    /// Peers with a live session
    pub fn peers(&self) -> Vec<PeerId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Chunk size `peer` announced for the chunks it sends
    pub fn peer_chunk_size(&self, peer: &PeerId) -> Option<u32> {
        self.sessions
            .get(peer)
            .and_then(|entry| entry.session.remote)
            .map(|remote| remote.chunk_size)
    }

    /// Channel of the `Active` session with `peer`
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession` unless the session is `Active`.
    pub fn active_channel(&self, peer: &PeerId) -> Result<Arc<dyn PeerChannel>> {
        self.sessions
            .get(peer)
            .filter(|entry| entry.session.is_active())
            .and_then(|entry| entry.channel.clone())
            .ok_or_else(|| CarrierError::NoActiveSession(peer.clone()))
    }

    /// Offer a session to `peer`
    ///
    /// # Errors
    ///
    /// Returns `AlreadyOpen` if a live session exists, `PeerUnreachable` if
    /// the transport has no channel, or `ChannelFailure` if the offer cannot
    /// be sent.
    pub async fn open_session(&self, peer: &PeerId) -> Result<Session> {
        if self.sessions.contains_key(peer) {
            return Err(CarrierError::AlreadyOpen(peer.clone()));
        }

        let channel = self.channel_to(peer).await?;

        let session = match self.sessions.entry(peer.clone()) {
            Entry::Occupied(_) => return Err(CarrierError::AlreadyOpen(peer.clone())),
            Entry::Vacant(slot) => {
                let session =
                    Session::new(peer.clone(), self.handle(), SessionState::PendingOutgoing);
                slot.insert(SessionEntry {
                    session: session.clone(),
                    channel: Some(Arc::clone(&channel)),
                });
                session
            }
        };

        tracing::info!("Offering session to {}", peer);

        let offer = PeerMessage::SessionOffer {
            payload: self.local.to_payload(),
        };
        if let Err(err) = channel.send(offer).await {
            self.sessions.remove(peer);
            return Err(err.into());
        }
        Ok(session)
    }

    /// Handle a session offer from `peer`
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedProtocol` if the offer was refused, or
    /// `ChannelFailure` if an implicit answer could not be sent.
    pub async fn on_incoming_offer(&self, peer: &PeerId, payload: Vec<u8>) -> Result<()> {
        let remote = match remote_description(peer, &payload) {
            Ok(remote) => remote,
            Err(err) => {
                self.refuse_offer(peer, err.to_string()).await;
                return Err(err);
            }
        };

        let answer_on = match self.sessions.entry(peer.clone()) {
            Entry::Vacant(slot) => {
                let mut session =
                    Session::new(peer.clone(), self.handle(), SessionState::PendingIncoming);
                session.remote_offer = Some(payload.clone());
                session.remote = remote;
                slot.insert(SessionEntry {
                    session,
                    channel: None,
                });
                tracing::info!("Incoming session offer from {}", peer);
                self.events.emit(Event::IncomingSessionRequest {
                    peer_id: peer.clone(),
                    offer: payload,
                });
                None
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                match entry.session.state {
                    SessionState::PendingOutgoing => {
                        // Crossed offers: theirs answers ours
                        entry.session.state = SessionState::Active;
                        entry.session.remote_offer = Some(payload);
                        entry.session.remote = remote;
                        tracing::info!("Session with {} active (crossed offers)", peer);
                        self.events.emit(Event::SessionReady {
                            peer_id: peer.clone(),
                        });
                        entry.channel.clone()
                    }
                    SessionState::Active => entry.channel.clone(),
                    state => {
                        tracing::warn!("Ignoring repeated offer from {} in {:?}", peer, state);
                        None
                    }
                }
            }
        };

        if let Some(channel) = answer_on {
            let answer = PeerMessage::SessionAnswer {
                payload: self.local.to_payload(),
            };
            channel.send(answer).await?;
        }
        Ok(())
    }

    /// Refuse an unusable offer
    ///
    /// A pending outgoing offer to the same peer is given up. A live session
    /// is left alone.
    async fn refuse_offer(&self, peer: &PeerId, reason: String) {
        let crossed = self.sessions.remove_if(peer, |_, entry| {
            entry.session.state == SessionState::PendingOutgoing
        });
        if crossed.is_some() {
            self.events.emit(Event::SessionRejected {
                peer_id: peer.clone(),
                reason: reason.clone(),
            });
        } else if self.sessions.contains_key(peer) {
            tracing::warn!("Ignoring unusable offer from {} on a live session", peer);
            return;
        }
        tracing::warn!("Refused session offer from {}: {}", peer, reason);

        match self.channel_to(peer).await {
            Ok(channel) => {
                if let Err(err) = channel.send(PeerMessage::SessionReject { reason }).await {
                    tracing::debug!("Could not deliver session reject to {}: {}", peer, err);
                }
            }
            Err(err) => tracing::debug!("Could not deliver session reject to {}: {}", peer, err),
        }
    }

    /// Accept the pending offer from `peer`
    ///
    /// # Errors
    ///
    /// Returns `UnknownSession`, `InvalidSessionTransition` unless the session
    /// is `PendingIncoming`, `PeerUnreachable`, or `ChannelFailure`.
    pub async fn accept_session(&self, peer: &PeerId) -> Result<Session> {
        {
            let entry = self
                .sessions
                .get(peer)
                .ok_or_else(|| CarrierError::UnknownSession(peer.clone()))?;
            if entry.session.state != SessionState::PendingIncoming {
                return Err(CarrierError::InvalidSessionTransition {
                    peer_id: peer.clone(),
                    from: entry.session.state,
                    to: SessionState::Active,
                });
            }
        }

        let channel = self.channel_to(peer).await?;

        let session = {
            let mut entry = self
                .sessions
                .get_mut(peer)
                .ok_or_else(|| CarrierError::UnknownSession(peer.clone()))?;
            if entry.session.state != SessionState::PendingIncoming {
                return Err(CarrierError::InvalidSessionTransition {
                    peer_id: peer.clone(),
                    from: entry.session.state,
                    to: SessionState::Active,
                });
            }
            entry.session.state = SessionState::Active;
            entry.channel = Some(Arc::clone(&channel));
            tracing::info!("Session with {} active", peer);
            self.events.emit(Event::SessionReady {
                peer_id: peer.clone(),
            });
            entry.session.clone()
        };

        let answer = PeerMessage::SessionAnswer {
            payload: self.local.to_payload(),
        };
        if let Err(err) = channel.send(answer).await {
            // The peer never learns of the session
            self.on_channel_failure(peer);
            return Err(err.into());
        }
        Ok(session)
    }

    /// Decline the pending offer from `peer`
    ///
    /// # Errors
    ///
    /// Returns `UnknownSession` or `InvalidSessionTransition` unless the
    /// session is `PendingIncoming`. Send failures are logged, not returned.
    pub async fn reject_session(&self, peer: &PeerId, reason: &str) -> Result<()> {
        {
            let entry = self
                .sessions
                .get(peer)
                .ok_or_else(|| CarrierError::UnknownSession(peer.clone()))?;
            if entry.session.state != SessionState::PendingIncoming {
                return Err(CarrierError::InvalidSessionTransition {
                    peer_id: peer.clone(),
                    from: entry.session.state,
                    to: SessionState::Rejected,
                });
            }
        }
        self.sessions.remove(peer);
        tracing::info!("Rejected session offer from {}: {}", peer, reason);

        match self.channel_to(peer).await {
            Ok(channel) => {
                let frame = PeerMessage::SessionReject {
                    reason: reason.to_string(),
                };
                if let Err(err) = channel.send(frame).await {
                    tracing::warn!("Could not deliver session reject to {}: {}", peer, err);
                }
            }
            Err(err) => tracing::warn!("Could not deliver session reject to {}: {}", peer, err),
        }
        Ok(())
    }

    /// Handle the peer's answer to our offer
    ///
    /// # Errors
    ///
    /// Returns `UnknownSession`, `InvalidSessionTransition`, or
    /// `UnsupportedProtocol` after giving up the offer.
    pub async fn on_answer(&self, peer: &PeerId, payload: Vec<u8>) -> Result<()> {
        let remote = match remote_description(peer, &payload) {
            Ok(remote) => remote,
            Err(err) => {
                let pending = self.sessions.remove_if(peer, |_, entry| {
                    entry.session.state == SessionState::PendingOutgoing
                });
                if let Some((_, entry)) = pending {
                    tracing::warn!("Giving up session offer to {}: {}", peer, err);
                    self.events.emit(Event::SessionRejected {
                        peer_id: peer.clone(),
                        reason: err.to_string(),
                    });
                    if let Some(channel) = entry.channel {
                        if let Err(send_err) = channel.send(PeerMessage::SessionClose).await {
                            tracing::debug!("Could not deliver session close to {}: {}", peer, send_err);
                        }
                    }
                }
                return Err(err);
            }
        };

        let mut entry = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| CarrierError::UnknownSession(peer.clone()))?;

        match entry.session.state {
            // Answer to our offer after crossed offers already activated us
            SessionState::Active => Ok(()),
            SessionState::PendingOutgoing => {
                entry.session.state = SessionState::Active;
                entry.session.remote = remote;
                tracing::info!("Session with {} active", peer);
                self.events.emit(Event::SessionReady {
                    peer_id: peer.clone(),
                });
                Ok(())
            }
            from => Err(CarrierError::InvalidSessionTransition {
                peer_id: peer.clone(),
                from,
                to: SessionState::Active,
            }),
        }
    }

    /// Handle the peer declining our offer
    ///
    /// # Errors
    ///
    /// Returns `UnknownSession` or `InvalidSessionTransition`.
    pub fn on_rejected(&self, peer: &PeerId, reason: String) -> Result<()> {
        let removed = self.sessions.remove_if(peer, |_, entry| {
            entry.session.state == SessionState::PendingOutgoing
        });
        match removed {
            Some(_) => {
                tracing::info!("Session offer to {} rejected: {}", peer, reason);
                self.events.emit(Event::SessionRejected {
                    peer_id: peer.clone(),
                    reason,
                });
                Ok(())
            }
            None => match self.sessions.get(peer) {
                None => Err(CarrierError::UnknownSession(peer.clone())),
                Some(entry) => Err(CarrierError::InvalidSessionTransition {
                    peer_id: peer.clone(),
                    from: entry.session.state,
                    to: SessionState::Rejected,
                }),
            },
        }
    }

    /// Remove the live session with `peer`, emitting `SessionClosed` once
    fn teardown(&self, peer: &PeerId) -> Option<SessionEntry> {
        let (_, entry) = self.sessions.remove(peer)?;
        tracing::info!("Session with {} closed ({:?})", peer, entry.session.state);
        self.events.emit(Event::SessionClosed {
            peer_id: peer.clone(),
        });
        Some(entry)
    }

    /// Close the session with `peer`
    ///
    /// Idempotent: returns `false` without emitting anything when no live
    /// session exists.
    pub async fn close_session(&self, peer: &PeerId) -> bool {
        let Some(entry) = self.teardown(peer) else {
            return false;
        };
        if let Some(channel) = entry.channel {
            if let Err(err) = channel.send(PeerMessage::SessionClose).await {
                tracing::debug!("Could not deliver session close to {}: {}", peer, err);
            }
        }
        true
    }

    /// Handle the peer closing the session
    pub fn on_remote_close(&self, peer: &PeerId) -> bool {
        self.teardown(peer).is_some()
    }

    /// Drop the session after its channel failed
    pub fn on_channel_failure(&self, peer: &PeerId) -> bool {
        let closed = self.teardown(peer).is_some();
        if closed {
            tracing::warn!("Channel to {} failed, session dropped", peer);
        }
        closed
    }
}
