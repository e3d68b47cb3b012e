//! Send side: request, chunk loop, acknowledgements and the verdict.

use super::runtime::{Flow, SendIo, TransferIo, TransferRuntime, wait_running};
use super::{FileTransferEngine, Stop};
use crate::channel::PeerMessage;
use crate::error::{CarrierError, Result};
use crate::events::Event;
use crate::ids::{FileId, PeerId};
use crate::transfer::{AbortReason, Direction, TransferDescriptor, TransferState};
use carrier_files::{FileChunker, FileSource};
use std::path::Path;
use std::sync::Arc;

impl FileTransferEngine {
    /// Ask `peer` whether it wants `file_name`
    ///
    /// Registers a `Queried` transfer; follow up with [`request`](Self::request)
    /// using the returned id.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession`, `InvalidRequest` for an empty name, or
    /// `ChannelFailure`.
    pub async fn query(&self, peer: &PeerId, file_name: &str, message: &str) -> Result<FileId> {
        if file_name.is_empty() {
            return Err(CarrierError::invalid_request("file name must not be empty"));
        }
        let channel = self.sessions.active_channel(peer)?;
        let file_id = FileId::generate()?;

        self.registry.register(TransferDescriptor::queried(
            file_id.clone(),
            peer.clone(),
            file_name,
            Direction::Send,
        ))?;
        tracing::info!("Querying {} about '{}' ({})", peer, file_name, file_id);

        let frame = PeerMessage::FileQuery {
            file_id: file_id.clone(),
            file_name: file_name.to_string(),
            message: message.to_string(),
        };
        if let Err(err) = channel.send(frame).await {
            let reason = err.to_string();
            let stop = Stop::Aborted(AbortReason::ChannelFailure(reason.clone()));
            self.stop_locked(None, None, &file_id, stop, false).await?;
            self.fail_peer(peer, &reason).await;
            return Err(err.into());
        }
        Ok(file_id)
    }

    /// Formally offer `source` to `peer` as `file_name`
    ///
    /// `file_id` is either the id of an earlier [`query`](Self::query) or a
    /// fresh id. The BLAKE3 digest of the content travels with the request.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession`, `InvalidRequest` for empty content or a
    /// mismatching query, `DuplicateTransfer`, `Io`, or `ChannelFailure`.
    pub async fn request(
        &self,
        peer: &PeerId,
        file_id: &FileId,
        file_name: &str,
        source: FileSource,
    ) -> Result<()> {
        if file_name.is_empty() {
            return Err(CarrierError::invalid_request("file name must not be empty"));
        }
        let channel = self.sessions.active_channel(peer)?;

        let total_size = source.len().await?;
        if total_size == 0 {
            return Err(CarrierError::invalid_request(
                "empty files cannot be transferred",
            ));
        }
        let digest = source.digest().await?;
        let reader = source.open().await?;

        let runtime = {
            let mut registry = self.registry.lock();
            match registry.get(file_id) {
                Some(queried) => {
                    if &queried.peer_id != peer
                        || queried.file_name != file_name
                        || queried.direction != Direction::Send
                    {
                        return Err(CarrierError::invalid_request(
                            "request does not match the earlier query",
                        ));
                    }
                    registry.offer(file_id, total_size)?;
                }
                None => {
                    registry.register(TransferDescriptor::requested(
                        file_id.clone(),
                        peer.clone(),
                        file_name,
                        total_size,
                        Direction::Send,
                    ))?;
                }
            }
            self.new_runtime(file_id, peer, channel, TransferIo::Send(SendIo { reader }))
        };

        tracing::info!(
            "Requesting transfer {} of '{}' ({} bytes) to {}",
            file_id,
            file_name,
            total_size,
            peer
        );

        let io = runtime.io.lock().await;
        let frame = PeerMessage::FileRequest {
            file_id: file_id.clone(),
            file_name: file_name.to_string(),
            total_size,
            digest,
        };
        self.send_or_abort(&runtime, io, frame).await
    }

    /// Offer a file on disk under its own name with a fresh id
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); `InvalidRequest` if the path has no
    /// file name.
    pub async fn send_file(&self, peer: &PeerId, path: impl AsRef<Path>) -> Result<FileId> {
        let source = FileSource::path(path);
        let file_name = source
            .file_name()
            .ok_or_else(|| CarrierError::invalid_request("path has no file name"))?;
        let file_id = FileId::generate()?;
        self.request(peer, &file_id, &file_name, source).await?;
        Ok(file_id)
    }

    pub(super) async fn on_accept(
        &self,
        peer: &PeerId,
        file_id: &FileId,
        full_path: String,
        total_size: u64,
    ) -> Result<()> {
        let runtime = self.runtime_from(peer, file_id, TransferState::Accepted)?;
        let mut io = runtime.io.lock().await;

        let size_matches = {
            let mut registry = self.registry.lock();
            let descriptor = registry
                .get(file_id)
                .cloned()
                .ok_or_else(|| CarrierError::UnknownTransfer(file_id.clone()))?;
            if descriptor.direction != Direction::Send {
                return Err(CarrierError::invalid_request(
                    "accept for an inbound transfer",
                ));
            }
            if descriptor.total() == total_size {
                registry.transition(file_id, TransferState::Accepted)?;
                registry.set_full_path(file_id, full_path.clone().into())?;
                self.events.emit(Event::FileAccepted {
                    peer_id: peer.clone(),
                    file_id: file_id.clone(),
                    full_path: full_path.into(),
                    total_size,
                });
                registry.transition(file_id, TransferState::Transferring)?;
                true
            } else {
                false
            }
        };

        if !size_matches {
            let reason = AbortReason::Protocol("accepted size differs from request".into());
            self.stop_locked(Some(&*runtime), Some(&mut *io), file_id, Stop::Aborted(reason), true)
                .await?;
            return Err(CarrierError::invalid_request("accepted size differs from request"));
        }
        drop(io);

        tracing::info!("Peer {} accepted transfer {}, sending", peer, file_id);
        tokio::spawn(self.clone().run_sender(runtime, total_size));
        Ok(())
    }

    /// Send every chunk, at most `window_size` unacknowledged at a time
    async fn run_sender(self, runtime: Arc<TransferRuntime>, total_size: u64) {
        let chunker = FileChunker::with_chunk_size(self.config.chunk_size);
        let mut flow = runtime.subscribe();

        for (offset, len) in chunker.ranges(total_size) {
            loop {
                if !wait_running(&mut flow).await {
                    return;
                }
                if !runtime.acquire_slot().await {
                    return;
                }

                let mut io = runtime.io.lock().await;
                if runtime.is_stopped() {
                    return;
                }
                if runtime.flow() == Flow::Paused {
                    runtime.release_slot();
                    continue;
                }

                let read = match io.send_mut() {
                    Some(send) => send.reader.read_at(offset, len).await,
                    None => return,
                };
                let payload = match read {
                    Ok(payload) => payload,
                    Err(err) => {
                        let reason = AbortReason::Io(err.to_string());
                        if let Err(err) = self
                            .stop_locked(Some(&*runtime), Some(&mut *io), &runtime.file_id, Stop::Aborted(reason), true)
                            .await
                        {
                            tracing::debug!("Transfer {} already finished: {}", runtime.file_id, err);
                        }
                        return;
                    }
                };

                tracing::trace!(
                    "Sending chunk of {} at offset {} ({} bytes)",
                    runtime.file_id,
                    offset,
                    len
                );
                let frame = PeerMessage::Chunk {
                    file_id: runtime.file_id.clone(),
                    offset,
                    payload,
                };
                if self.send_or_abort(&runtime, io, frame).await.is_err() {
                    return;
                }
                break;
            }
        }
        tracing::debug!("All chunks of {} sent, awaiting verdict", runtime.file_id);
    }

    pub(super) fn on_ack(&self, peer: &PeerId, file_id: &FileId, received: u64) -> Result<()> {
        let runtime = self.runtime_from(peer, file_id, TransferState::Transferring)?;
        {
            let mut registry = self.registry.lock();
            let descriptor = registry.record_progress(file_id, received)?;
            if runtime.progress_due() {
                self.events.emit(Event::FileProgress {
                    peer_id: peer.clone(),
                    file_id: file_id.clone(),
                    transferred_bytes: descriptor.transferred_bytes,
                    total_size: descriptor.total(),
                });
            }
        }
        runtime.release_slot();
        Ok(())
    }

    pub(super) async fn on_complete(&self, peer: &PeerId, file_id: &FileId) -> Result<()> {
        let runtime = self.runtime_from(peer, file_id, TransferState::Completed)?;
        let _io = runtime.io.lock().await;
        {
            let mut registry = self.registry.lock();
            if registry.get(file_id).map(|d| d.direction) != Some(Direction::Send) {
                return Err(CarrierError::invalid_request(
                    "completion for an inbound transfer",
                ));
            }
            let descriptor = registry.complete(file_id)?;
            self.emit_completed(&descriptor);
            tracing::info!(
                "Transfer {} of '{}' to {} completed ({} bytes)",
                file_id,
                descriptor.file_name,
                peer,
                descriptor.transferred_bytes
            );
        }
        runtime.stop();
        self.runtimes.remove(file_id);
        Ok(())
    }

    /// Final progress followed by the completion event
    pub(super) fn emit_completed(&self, descriptor: &TransferDescriptor) {
        self.events.emit(Event::FileProgress {
            peer_id: descriptor.peer_id.clone(),
            file_id: descriptor.file_id.clone(),
            transferred_bytes: descriptor.transferred_bytes,
            total_size: descriptor.total(),
        });
        self.events.emit(Event::FileCompleted {
            peer_id: descriptor.peer_id.clone(),
            file_id: descriptor.file_id.clone(),
            transferred_bytes: descriptor.transferred_bytes,
        });
    }
}
