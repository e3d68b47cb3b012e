//! File transfer engine
//!
//! Drives every transfer of one node through its state machine:
//! query, request, accept or reject, windowed chunk flow with pause and
//! resume, receiver-side verification, then exactly one terminal state.
//!
//! # Transfer Flow
//!
//! ```text
//! Sender                               Receiver
//!     |-- FileQuery (optional) --------->|  FileQueried
//!     |-- FileRequest (size, digest) --->|  FileRequest
//!     |<------------------ FileAccept ---|  accept()
//!     |-- Chunk 0 ---------------------->|
//!     |<--------------------- ChunkAck --|
//!     |-- ...                            |
//!     |-- Chunk N (final) -------------->|  verify
//!     |<----------- Control(Complete) ---|  FileCompleted
//! ```
//!
//! Every transition and its event happen under the registry lock, and every
//! transition of a transfer with a runtime also holds that runtime's I/O gate,
//! so chunk I/O never interleaves with pause, resume or cancel.

mod receiver;
mod runtime;
mod sender;

use crate::channel::{ControlAction, PeerChannel, PeerMessage};
use crate::config::{PartialFilePolicy, TransferConfig};
use crate::error::{CarrierError, Result};
use crate::events::{Event, EventSink};
use crate::ids::{FileId, PeerId};
use crate::negotiator::SessionNegotiator;
use crate::progress::ProgressThrottle;
use crate::registry::TransferRegistry;
use crate::transfer::{AbortReason, Direction, TransferDescriptor, TransferState};
use dashmap::DashMap;
use runtime::{Flow, TransferIo, TransferRuntime};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::MutexGuard;

/// How a transfer stops before completing
#[derive(Debug, Clone)]
enum Stop {
    Rejected(String),
    Canceled,
    Aborted(AbortReason),
}

impl Stop {
    fn control(&self, file_id: &FileId) -> PeerMessage {
        match self {
            Stop::Rejected(reason) => PeerMessage::FileReject {
                file_id: file_id.clone(),
                reason: reason.clone(),
            },
            Stop::Canceled => PeerMessage::Control {
                file_id: file_id.clone(),
                action: ControlAction::Cancel,
            },
            Stop::Aborted(reason) => PeerMessage::Control {
                file_id: file_id.clone(),
                action: ControlAction::Abort(reason.clone()),
            },
        }
    }
}

/// Chunked, windowed, pausable transfer driver
#[derive(Clone)]
pub struct FileTransferEngine {
    registry: Arc<TransferRegistry>,
    events: Arc<EventSink>,
    sessions: Arc<SessionNegotiator>,
    runtimes: Arc<DashMap<FileId, Arc<TransferRuntime>>>,
    config: TransferConfig,
}

impl FileTransferEngine {
    /// Create an engine
    pub fn new(
        config: TransferConfig,
        sessions: Arc<SessionNegotiator>,
        events: Arc<EventSink>,
    ) -> Self {
        Self {
            registry: Arc::new(TransferRegistry::new(config.history_capacity)),
            events,
            sessions,
            runtimes: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Transfer registry
    #[must_use]
    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Snapshot of a transfer, active or finished
    pub fn descriptor(&self, file_id: &FileId) -> Option<TransferDescriptor> {
        self.registry.lookup(file_id)
    }

    fn runtime(&self, file_id: &FileId) -> Option<Arc<TransferRuntime>> {
        self.runtimes.get(file_id).map(|rt| Arc::clone(rt.value()))
    }

    fn new_runtime(
        &self,
        file_id: &FileId,
        peer_id: &PeerId,
        channel: Arc<dyn PeerChannel>,
        io: TransferIo,
    ) -> Arc<TransferRuntime> {
        let runtime = TransferRuntime::new(
            file_id.clone(),
            peer_id.clone(),
            channel,
            io,
            self.config.window_size,
            ProgressThrottle::new(self.config.progress_interval(), self.config.progress_stride),
        );
        self.runtimes.insert(file_id.clone(), Arc::clone(&runtime));
        runtime
    }

    /// Error for an operation that would move `file_id` to `to`
    fn state_error(&self, file_id: &FileId, to: TransferState) -> CarrierError {
        match self.registry.lookup(file_id) {
            Some(descriptor) => CarrierError::InvalidTransition {
                file_id: file_id.clone(),
                from: descriptor.state,
                to,
            },
            None => CarrierError::UnknownTransfer(file_id.clone()),
        }
    }

    /// Runtime of a transfer owned by `peer`
    fn runtime_from(
        &self,
        peer: &PeerId,
        file_id: &FileId,
        to: TransferState,
    ) -> Result<Arc<TransferRuntime>> {
        let runtime = self
            .runtime(file_id)
            .ok_or_else(|| self.state_error(file_id, to))?;
        if &runtime.peer_id != peer {
            return Err(CarrierError::invalid_request(
                "frame from a peer that does not own the transfer",
            ));
        }
        Ok(runtime)
    }

    fn check_owner(&self, peer: &PeerId, file_id: &FileId) -> Result<()> {
        match self.registry.lookup(file_id) {
            Some(descriptor) if &descriptor.peer_id == peer => Ok(()),
            Some(_) => Err(CarrierError::invalid_request(
                "frame from a peer that does not own the transfer",
            )),
            None => Err(CarrierError::UnknownTransfer(file_id.clone())),
        }
    }

    /// Send `message`, failing the whole peer if the channel fails
    ///
    /// Takes the I/O gate so it can be released before the other transfers
    /// with the peer are aborted.
    async fn send_or_abort(
        &self,
        runtime: &TransferRuntime,
        mut io: MutexGuard<'_, TransferIo>,
        message: PeerMessage,
    ) -> Result<()> {
        let Err(err) = runtime.channel.send(message).await else {
            return Ok(());
        };
        let reason = err.to_string();
        let stop = Stop::Aborted(AbortReason::ChannelFailure(reason.clone()));
        if let Err(stop_err) = self
            .stop_locked(Some(runtime), Some(&mut *io), &runtime.file_id, stop, false)
            .await
        {
            tracing::debug!("Transfer {} already finished: {}", runtime.file_id, stop_err);
        }
        drop(io);
        self.fail_peer(&runtime.peer_id, &reason).await;
        Err(err.into())
    }

    /// Drop the session with `peer` after its channel failed and abort its
    /// transfers
    ///
    /// Returns `false` if no live session was left to drop.
    pub async fn fail_peer(&self, peer: &PeerId, reason: &str) -> bool {
        if !self.sessions.on_channel_failure(peer) {
            return false;
        }
        let aborted = self
            .abort_peer(peer, AbortReason::ChannelFailure(reason.to_string()))
            .await;
        if aborted > 0 {
            tracing::warn!("Aborted {} transfer(s) with {}: {}", aborted, peer, reason);
        }
        true
    }

    /// Apply a terminal stop and emit its event in one critical section
    fn stop_in_registry(&self, file_id: &FileId, stop: &Stop) -> Result<TransferDescriptor> {
        let mut registry = self.registry.lock();
        let descriptor = match stop {
            Stop::Rejected(_) => registry.transition(file_id, TransferState::Rejected)?,
            Stop::Canceled => registry.transition(file_id, TransferState::Canceled)?,
            Stop::Aborted(reason) => {
                let bytes = match (reason, registry.get(file_id)) {
                    (AbortReason::IntegrityMismatch, Some(d)) => d.total(),
                    (_, Some(d)) => d.transferred_bytes,
                    (_, None) => 0,
                };
                registry.abort_at(file_id, bytes)?
            }
        };

        let peer_id = descriptor.peer_id.clone();
        let file_id = file_id.clone();
        let event = match stop {
            Stop::Rejected(reason) => Event::FileRejected {
                peer_id,
                file_id,
                reason: reason.clone(),
            },
            Stop::Canceled => Event::FileCanceled { peer_id, file_id },
            Stop::Aborted(reason) => Event::FileAborted {
                peer_id,
                file_id,
                reason: reason.clone(),
                transferred_bytes: descriptor.transferred_bytes,
            },
        };
        self.events.emit(event);
        Ok(descriptor)
    }

    /// Stop a transfer whose I/O gate (if any) the caller already holds
    async fn stop_locked(
        &self,
        runtime: Option<&TransferRuntime>,
        io: Option<&mut TransferIo>,
        file_id: &FileId,
        stop: Stop,
        notify: bool,
    ) -> Result<()> {
        let descriptor = self.stop_in_registry(file_id, &stop)?;

        match &stop {
            Stop::Aborted(reason) => tracing::warn!(
                "Transfer {} of '{}' aborted at {}/{} bytes: {}",
                file_id,
                descriptor.file_name,
                descriptor.transferred_bytes,
                descriptor.total(),
                reason
            ),
            other => tracing::info!("Transfer {} of '{}' stopped: {:?}", file_id, descriptor.file_name, other),
        }

        if let Some(runtime) = runtime {
            runtime.stop();
        }
        self.runtimes.remove(file_id);

        if notify {
            let channel = match runtime {
                Some(runtime) => Some(Arc::clone(&runtime.channel)),
                None => self.sessions.active_channel(&descriptor.peer_id).ok(),
            };
            if let Some(channel) = channel {
                if let Err(err) = channel.send(stop.control(file_id)).await {
                    tracing::debug!("Could not notify {} of stop: {}", descriptor.peer_id, err);
                }
            }
        }

        if descriptor.direction == Direction::Receive
            && self.config.partial_files == PartialFilePolicy::Delete
        {
            let destination = io
                .and_then(TransferIo::receive_mut)
                .and_then(|recv| recv.destination.take());
            if let Some(destination) = destination {
                if let Err(err) = destination.discard().await {
                    tracing::warn!("Could not delete partial file for {}: {}", file_id, err);
                }
            }
        }
        Ok(())
    }

    async fn stop_transfer(&self, file_id: &FileId, stop: Stop, notify: bool) -> Result<()> {
        match self.runtime(file_id) {
            Some(runtime) => {
                let mut io = runtime.io.lock().await;
                self.stop_locked(Some(&*runtime), Some(&mut *io), file_id, stop, notify)
                    .await
            }
            None => self.stop_locked(None, None, file_id, stop, notify).await,
        }
    }

    /// Suspend chunk flow of a `Transferring` transfer
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the transfer is `Transferring`,
    /// `UnknownTransfer`, or `ChannelFailure` if the peer cannot be told.
    pub async fn pause(&self, file_id: &FileId) -> Result<()> {
        let runtime = self
            .runtime(file_id)
            .ok_or_else(|| self.state_error(file_id, TransferState::Paused))?;
        let io = runtime.io.lock().await;
        {
            let mut registry = self.registry.lock();
            let descriptor = registry.transition(file_id, TransferState::Paused)?;
            self.events.emit(Event::FilePaused {
                peer_id: descriptor.peer_id,
                file_id: file_id.clone(),
            });
        }
        runtime.set_flow(Flow::Paused);
        tracing::info!("Paused transfer {}", file_id);

        let frame = PeerMessage::Control {
            file_id: file_id.clone(),
            action: ControlAction::Pause,
        };
        self.send_or_abort(&runtime, io, frame).await
    }

    /// Resume a `Paused` transfer
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the transfer is `Paused`,
    /// `UnknownTransfer`, or `ChannelFailure` if the peer cannot be told.
    pub async fn resume(&self, file_id: &FileId) -> Result<()> {
        let runtime = self
            .runtime(file_id)
            .ok_or_else(|| self.state_error(file_id, TransferState::Transferring))?;
        let io = runtime.io.lock().await;
        {
            let mut registry = self.registry.lock();
            if let Some(current) = registry.get(file_id).map(|d| d.state) {
                if current != TransferState::Paused {
                    return Err(CarrierError::InvalidTransition {
                        file_id: file_id.clone(),
                        from: current,
                        to: TransferState::Transferring,
                    });
                }
            }
            let descriptor = registry.transition(file_id, TransferState::Transferring)?;
            self.events.emit(Event::FileResumed {
                peer_id: descriptor.peer_id,
                file_id: file_id.clone(),
            });
        }
        runtime.set_flow(Flow::Running);
        tracing::info!("Resumed transfer {}", file_id);

        let frame = PeerMessage::Control {
            file_id: file_id.clone(),
            action: ControlAction::Resume,
        };
        self.send_or_abort(&runtime, io, frame).await
    }

    /// Cancel a non-terminal transfer
    ///
    /// Chunk flow stops at the next chunk boundary and the peer is told.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the transfer already finished, or
    /// `UnknownTransfer`.
    pub async fn cancel(&self, file_id: &FileId) -> Result<()> {
        self.stop_transfer(file_id, Stop::Canceled, true).await
    }

    /// Cancel every transfer with `peer` without notifying it
    pub async fn cancel_peer(&self, peer: &PeerId) -> usize {
        self.stop_peer(peer, Stop::Canceled).await
    }

    /// Abort every transfer with `peer` after its channel failed
    pub async fn abort_peer(&self, peer: &PeerId, reason: AbortReason) -> usize {
        self.stop_peer(peer, Stop::Aborted(reason)).await
    }

    async fn stop_peer(&self, peer: &PeerId, stop: Stop) -> usize {
        let ids = self.registry.lock().active_for_peer(peer);
        let mut stopped = 0;
        for file_id in ids {
            match self.stop_transfer(&file_id, stop.clone(), false).await {
                Ok(()) => stopped += 1,
                Err(err) => tracing::debug!("Transfer {} already finished: {}", file_id, err),
            }
        }
        stopped
    }

    async fn on_remote_pause(&self, peer: &PeerId, file_id: &FileId) -> Result<()> {
        let runtime = self.runtime_from(peer, file_id, TransferState::Paused)?;
        let _io = runtime.io.lock().await;
        {
            let mut registry = self.registry.lock();
            let state = registry.get(file_id).map(|d| d.state);
            match state {
                Some(TransferState::Paused) => return Ok(()),
                // Sender started before our first chunk arrived
                Some(TransferState::Accepted) => {
                    registry.transition(file_id, TransferState::Transferring)?;
                }
                _ => {}
            }
            let descriptor = registry.transition(file_id, TransferState::Paused)?;
            self.events.emit(Event::FilePaused {
                peer_id: descriptor.peer_id,
                file_id: file_id.clone(),
            });
        }
        runtime.set_flow(Flow::Paused);
        tracing::info!("Peer {} paused transfer {}", peer, file_id);
        Ok(())
    }

    async fn on_remote_resume(&self, peer: &PeerId, file_id: &FileId) -> Result<()> {
        let runtime = self.runtime_from(peer, file_id, TransferState::Transferring)?;
        let _io = runtime.io.lock().await;
        {
            let mut registry = self.registry.lock();
            match registry.get(file_id).map(|d| d.state) {
                Some(TransferState::Transferring) => return Ok(()),
                Some(TransferState::Paused) | None => {}
                Some(from) => {
                    return Err(CarrierError::InvalidTransition {
                        file_id: file_id.clone(),
                        from,
                        to: TransferState::Transferring,
                    });
                }
            }
            let descriptor = registry.transition(file_id, TransferState::Transferring)?;
            self.events.emit(Event::FileResumed {
                peer_id: descriptor.peer_id,
                file_id: file_id.clone(),
            });
        }
        runtime.set_flow(Flow::Running);
        tracing::info!("Peer {} resumed transfer {}", peer, file_id);
        Ok(())
    }

    async fn on_control(&self, peer: &PeerId, file_id: &FileId, action: ControlAction) -> Result<()> {
        match action {
            ControlAction::Pause => self.on_remote_pause(peer, file_id).await,
            ControlAction::Resume => self.on_remote_resume(peer, file_id).await,
            ControlAction::Complete => self.on_complete(peer, file_id).await,
            ControlAction::Cancel => {
                self.check_owner(peer, file_id)?;
                self.stop_transfer(file_id, Stop::Canceled, false).await
            }
            ControlAction::Abort(reason) => {
                self.check_owner(peer, file_id)?;
                self.stop_transfer(file_id, Stop::Aborted(reason), false).await
            }
        }
    }

    /// Dispatch an inbound transfer frame from `peer`
    ///
    /// # Errors
    ///
    /// Returns the error that made the frame unusable; the frame is dropped.
    pub async fn handle_frame(&self, peer: &PeerId, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::FileQuery {
                file_id,
                file_name,
                message,
            } => self.on_query(peer, file_id, file_name, message),
            PeerMessage::FileRequest {
                file_id,
                file_name,
                total_size,
                digest,
            } => self.on_request(peer, file_id, file_name, total_size, digest),
            PeerMessage::FileAccept {
                file_id,
                full_path,
                total_size,
            } => self.on_accept(peer, &file_id, full_path, total_size).await,
            PeerMessage::FileReject { file_id, reason } => {
                self.check_owner(peer, &file_id)?;
                self.stop_transfer(&file_id, Stop::Rejected(reason), false).await
            }
            PeerMessage::Chunk {
                file_id,
                offset,
                payload,
            } => self.on_chunk(peer, &file_id, offset, payload).await,
            PeerMessage::ChunkAck { file_id, received } => self.on_ack(peer, &file_id, received),
            PeerMessage::Control { file_id, action } => {
                self.on_control(peer, &file_id, action).await
            }
            other => Err(CarrierError::InvalidRequest(Cow::Owned(format!(
                "{} is not a transfer frame",
                other.kind()
            )))),
        }
    }
}
