//! One real node facing a scripted peer
//!
//! The test plays the remote side by calling
//! [`CarrierNode::handle_message`] directly and reads the node's outbound
//! frames from the peer's inbox, so the interleaving is exact.

use carrier_core::{
    CarrierConfig, CarrierNode, FileId, Inbox, MemoryTransport, PeerId, PeerMessage, Result,
};
use carrier_files::{Digest, hash_bytes};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Node "A" with an active session to the scripted peer "B"
pub struct ManualPeer {
    pub node: CarrierNode,
    pub peer: PeerId,
    pub transport: MemoryTransport,
    inbox: Inbox,
    dir: tempfile::TempDir,
}

impl ManualPeer {
    /// Node with an accepted inbound session from the peer
    pub async fn new(config: CarrierConfig) -> Self {
        crate::init_tracing();
        let transport = MemoryTransport::new("A");
        let inbox = transport.register("B");
        let node = CarrierNode::new(config, Arc::new(transport.clone())).expect("valid config");
        let peer = PeerId::from("B");

        node.handle_message(&peer, PeerMessage::SessionOffer { payload: Vec::new() })
            .await
            .expect("offer");
        node.accept_session(&peer).await.expect("accept session");
        node.events().drain();

        let mut manual = Self {
            node,
            peer,
            transport,
            inbox,
            dir: tempfile::tempdir().expect("temp dir"),
        };
        let answer = manual.frame().await;
        assert!(matches!(answer, PeerMessage::SessionAnswer { .. }));
        manual
    }

    /// Next frame the node sent to the peer
    pub async fn frame(&mut self) -> PeerMessage {
        let (_, frame) = tokio::time::timeout(crate::WAIT, self.inbox.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("inbox closed");
        frame
    }

    /// Frame already queued, if any
    pub fn try_frame(&mut self) -> Option<PeerMessage> {
        self.inbox.try_recv().ok().map(|(_, frame)| frame)
    }

    /// Deliver one frame as the peer
    pub async fn send(&self, frame: PeerMessage) -> Result<()> {
        self.node.handle_message(&self.peer, frame).await
    }

    /// Offer `data` as `file_name`, announcing `digest`
    pub async fn offer_with_digest(&self, file_name: &str, data: &[u8], digest: Digest) -> FileId {
        let file_id = FileId::generate().expect("random id");
        self.send(PeerMessage::FileRequest {
            file_id: file_id.clone(),
            file_name: file_name.to_string(),
            total_size: data.len() as u64,
            digest,
        })
        .await
        .expect("request");
        file_id
    }

    /// Offer `data` as `file_name` and have the node accept it
    pub async fn offer_accepted(&mut self, file_name: &str, data: &[u8]) -> (FileId, PathBuf) {
        self.offer_accepted_with_digest(file_name, data, hash_bytes(data))
            .await
    }

    /// As [`offer_accepted`](Self::offer_accepted) with an explicit digest
    pub async fn offer_accepted_with_digest(
        &mut self,
        file_name: &str,
        data: &[u8],
        digest: Digest,
    ) -> (FileId, PathBuf) {
        let file_id = self.offer_with_digest(file_name, data, digest).await;
        let path = self
            .node
            .accept(&file_id, self.dir.path())
            .await
            .expect("accept");
        let accept = self.frame().await;
        assert!(matches!(accept, PeerMessage::FileAccept { .. }));
        (file_id, path)
    }

    /// Chunk of `data` starting at `offset`
    pub async fn chunk(&self, file_id: &FileId, data: &[u8], offset: usize, len: usize) -> Result<()> {
        self.send(PeerMessage::Chunk {
            file_id: file_id.clone(),
            offset: offset as u64,
            payload: data[offset..offset + len].to_vec(),
        })
        .await
    }

    /// Scratch directory destinations are written to
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}
