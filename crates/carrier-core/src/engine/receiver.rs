//! Receive side: inbound queries and requests, accept/reject, chunk
//! reassembly and verification.

use super::runtime::{ReceiveIo, TransferIo};
use super::{FileTransferEngine, Stop};
use crate::channel::{ControlAction, PeerMessage};
use crate::error::{CarrierError, Result};
use crate::events::Event;
use crate::ids::{FileId, PeerId};
use crate::transfer::{AbortReason, Direction, TransferDescriptor, TransferState};
use carrier_files::{DestinationFile, Digest, StreamingHasher, resolve_destination};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

enum ChunkOutcome {
    Partial(u64),
    Final { verified: bool },
}

/// Validate, write and hash one chunk
async fn apply_chunk(
    recv: &mut ReceiveIo,
    total_size: u64,
    offset: u64,
    payload: &[u8],
) -> std::result::Result<ChunkOutcome, AbortReason> {
    if offset != recv.next_offset {
        return Err(AbortReason::Protocol(format!(
            "expected offset {}, got {}",
            recv.next_offset, offset
        )));
    }
    if payload.len() as u64 > recv.max_chunk {
        return Err(AbortReason::Protocol(format!(
            "chunk of {} bytes exceeds the negotiated {} bytes",
            payload.len(),
            recv.max_chunk
        )));
    }
    let end = offset + payload.len() as u64;
    if payload.is_empty() || end > total_size {
        return Err(AbortReason::Protocol(format!(
            "chunk [{offset}, {end}) outside file of {total_size} bytes"
        )));
    }
    let destination = recv
        .destination
        .as_mut()
        .ok_or_else(|| AbortReason::Protocol("chunk before accept".into()))?;

    destination
        .write_at(offset, payload)
        .await
        .map_err(|err| AbortReason::Io(err.to_string()))?;
    recv.hasher.update(payload);
    recv.next_offset = end;

    if end < total_size {
        return Ok(ChunkOutcome::Partial(end));
    }
    destination
        .finish()
        .await
        .map_err(|err| AbortReason::Io(err.to_string()))?;
    Ok(ChunkOutcome::Final {
        verified: recv.hasher.verify(&recv.expected),
    })
}

impl FileTransferEngine {
    pub(super) fn on_query(
        &self,
        peer: &PeerId,
        file_id: FileId,
        file_name: String,
        message: String,
    ) -> Result<()> {
        self.sessions.active_channel(peer)?;
        if file_name.is_empty() {
            return Err(CarrierError::invalid_request("file name must not be empty"));
        }

        let mut registry = self.registry.lock();
        registry.register(TransferDescriptor::queried(
            file_id.clone(),
            peer.clone(),
            file_name.clone(),
            Direction::Receive,
        ))?;
        tracing::info!("Peer {} queried '{}' ({})", peer, file_name, file_id);
        self.events.emit(Event::FileQueried {
            peer_id: peer.clone(),
            file_id,
            file_name,
            message,
        });
        Ok(())
    }

    pub(super) fn on_request(
        &self,
        peer: &PeerId,
        file_id: FileId,
        file_name: String,
        total_size: u64,
        digest: Digest,
    ) -> Result<()> {
        let channel = self.sessions.active_channel(peer)?;
        if total_size == 0 {
            return Err(CarrierError::invalid_request("request for an empty file"));
        }

        let mut registry = self.registry.lock();
        match registry.get(&file_id) {
            Some(queried)
                if queried.state == TransferState::Queried
                    && queried.direction == Direction::Receive
                    && &queried.peer_id == peer =>
            {
                if queried.file_name != file_name {
                    return Err(CarrierError::invalid_request(
                        "request does not match the earlier query",
                    ));
                }
                registry.offer(&file_id, total_size)?;
            }
            Some(_) => {
                return Err(CarrierError::DuplicateTransfer {
                    peer_id: peer.clone(),
                    file_name,
                });
            }
            None => {
                registry.register(TransferDescriptor::requested(
                    file_id.clone(),
                    peer.clone(),
                    file_name.clone(),
                    total_size,
                    Direction::Receive,
                ))?;
            }
        }

        // Peers without a description send with our chunk size
        let max_chunk = self
            .sessions
            .peer_chunk_size(peer)
            .map_or(self.config.chunk_size as u64, u64::from);
        let io = TransferIo::Receive(ReceiveIo {
            expected: digest,
            destination: None,
            hasher: StreamingHasher::new(),
            next_offset: 0,
            max_chunk,
        });
        self.new_runtime(&file_id, peer, channel, io);

        tracing::info!(
            "Peer {} requests transfer {} of '{}' ({} bytes)",
            peer,
            file_id,
            file_name,
            total_size
        );
        self.events.emit(Event::FileRequest {
            peer_id: peer.clone(),
            file_id,
            file_name,
            total_size,
        });
        Ok(())
    }

    /// Accept an inbound request, storing the file at `destination`
    ///
    /// An existing directory is joined with the announced file name. The file
    /// is created and preallocated before the sender is told to start.
    /// Returns the resolved path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the transfer is a `Requested`
    /// inbound one, `NoActiveSession`, `Io` if the file cannot be created
    /// (the request stays open), or `ChannelFailure`.
    pub async fn accept(&self, file_id: &FileId, destination: impl AsRef<Path>) -> Result<PathBuf> {
        let runtime = self
            .runtime(file_id)
            .ok_or_else(|| self.state_error(file_id, TransferState::Accepted))?;
        let descriptor = self
            .registry
            .lookup(file_id)
            .ok_or_else(|| CarrierError::UnknownTransfer(file_id.clone()))?;
        if descriptor.direction != Direction::Receive {
            return Err(CarrierError::invalid_request(
                "only the receiving side can accept",
            ));
        }
        self.sessions.active_channel(&descriptor.peer_id)?;

        let path = resolve_destination(destination, &descriptor.file_name).await;
        let total_size = descriptor.total();

        let mut io = runtime.io.lock().await;
        let current = self.registry.lock().get(file_id).map(|d| d.state);
        if current != Some(TransferState::Requested) {
            return Err(self.state_error(file_id, TransferState::Accepted));
        }

        let file = DestinationFile::create(&path, total_size).await?;

        let accepted = {
            let mut registry = self.registry.lock();
            registry
                .transition(file_id, TransferState::Accepted)
                .and_then(|_| registry.set_full_path(file_id, path.clone()))
                .map(|()| {
                    self.events.emit(Event::FileAccepted {
                        peer_id: descriptor.peer_id.clone(),
                        file_id: file_id.clone(),
                        full_path: path.clone(),
                        total_size,
                    });
                })
        };
        if let Err(err) = accepted {
            if let Err(io_err) = file.discard().await {
                tracing::debug!("Could not remove {}: {}", path.display(), io_err);
            }
            return Err(err);
        }
        if let Some(recv) = io.receive_mut() {
            recv.destination = Some(file);
        }
        tracing::info!("Accepted transfer {} into {}", file_id, path.display());

        let frame = PeerMessage::FileAccept {
            file_id: file_id.clone(),
            full_path: path.display().to_string(),
            total_size,
        };
        self.send_or_abort(&runtime, io, frame).await?;
        Ok(path)
    }

    /// Decline an inbound query or request
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the transfer is an inbound one in
    /// `Queried` or `Requested`, or `UnknownTransfer`.
    pub async fn reject(&self, file_id: &FileId, reason: &str) -> Result<()> {
        let descriptor = self
            .registry
            .lookup(file_id)
            .ok_or_else(|| CarrierError::UnknownTransfer(file_id.clone()))?;
        if descriptor.direction != Direction::Receive {
            return Err(CarrierError::invalid_request(
                "only the receiving side can reject",
            ));
        }
        if !matches!(
            descriptor.state,
            TransferState::Queried | TransferState::Requested
        ) {
            return Err(CarrierError::InvalidTransition {
                file_id: file_id.clone(),
                from: descriptor.state,
                to: TransferState::Rejected,
            });
        }
        self.stop_transfer(file_id, Stop::Rejected(reason.to_string()), true)
            .await
    }

    pub(super) async fn on_chunk(
        &self,
        peer: &PeerId,
        file_id: &FileId,
        offset: u64,
        payload: Vec<u8>,
    ) -> Result<()> {
        let runtime = self.runtime_from(peer, file_id, TransferState::Transferring)?;
        let mut io = runtime.io.lock().await;
        if runtime.is_stopped() {
            return Err(self.state_error(file_id, TransferState::Transferring));
        }

        let (state, total_size) = {
            let registry = self.registry.lock();
            let descriptor = registry
                .get(file_id)
                .ok_or_else(|| CarrierError::UnknownTransfer(file_id.clone()))?;
            if descriptor.direction != Direction::Receive || !descriptor.state.accepts_chunks() {
                return Err(CarrierError::InvalidTransition {
                    file_id: file_id.clone(),
                    from: descriptor.state,
                    to: TransferState::Transferring,
                });
            }
            (descriptor.state, descriptor.total())
        };

        tracing::trace!(
            "Chunk of {} at offset {} ({} bytes)",
            file_id,
            offset,
            payload.len()
        );

        let outcome = match io.receive_mut() {
            Some(recv) => apply_chunk(recv, total_size, offset, &payload).await,
            None => Err(AbortReason::Protocol("chunk for an outbound transfer".into())),
        };

        match outcome {
            Err(reason) => {
                let err = match &reason {
                    AbortReason::Io(msg) => CarrierError::Io(msg.clone()),
                    other => CarrierError::InvalidRequest(Cow::Owned(other.to_string())),
                };
                self.stop_locked(Some(&*runtime), Some(&mut *io), file_id, Stop::Aborted(reason), true)
                    .await?;
                Err(err)
            }
            Ok(ChunkOutcome::Partial(received)) => {
                {
                    let mut registry = self.registry.lock();
                    if state == TransferState::Accepted {
                        registry.transition(file_id, TransferState::Transferring)?;
                    }
                    let descriptor = registry.record_progress(file_id, received)?;
                    if runtime.progress_due() {
                        self.events.emit(Event::FileProgress {
                            peer_id: peer.clone(),
                            file_id: file_id.clone(),
                            transferred_bytes: descriptor.transferred_bytes,
                            total_size,
                        });
                    }
                }
                let frame = PeerMessage::ChunkAck {
                    file_id: file_id.clone(),
                    received,
                };
                self.send_or_abort(&runtime, io, frame).await
            }
            Ok(ChunkOutcome::Final { verified: false }) => {
                self.stop_locked(
                    Some(&*runtime),
                    Some(&mut *io),
                    file_id,
                    Stop::Aborted(AbortReason::IntegrityMismatch),
                    true,
                )
                .await?;
                Err(CarrierError::IntegrityMismatch(file_id.clone()))
            }
            Ok(ChunkOutcome::Final { verified: true }) => {
                {
                    let mut registry = self.registry.lock();
                    if state == TransferState::Accepted {
                        registry.transition(file_id, TransferState::Transferring)?;
                    }
                    let descriptor = registry.complete(file_id)?;
                    self.emit_completed(&descriptor);
                    tracing::info!(
                        "Transfer {} of '{}' from {} completed ({} bytes)",
                        file_id,
                        descriptor.file_name,
                        peer,
                        descriptor.transferred_bytes
                    );
                }
                runtime.stop();
                self.runtimes.remove(file_id);

                let frame = PeerMessage::Control {
                    file_id: file_id.clone(),
                    action: ControlAction::Complete,
                };
                drop(io);
                if let Err(err) = runtime.channel.send(frame).await {
                    tracing::warn!("Could not confirm transfer {} to {}: {}", file_id, peer, err);
                    self.fail_peer(peer, &err.to_string()).await;
                }
                Ok(())
            }
        }
    }
}
