//! Per-transfer runtime state
//!
//! The registry owns the descriptor; the runtime owns everything that moves
//! bytes: the I/O gate, the flow-control window, the pause signal and the
//! file handles. Lock order is I/O gate, then registry, then throttle.

use crate::channel::PeerChannel;
use crate::ids::{FileId, PeerId};
use crate::progress::ProgressThrottle;
use carrier_files::{ChunkReader, DestinationFile, Digest, StreamingHasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{Semaphore, watch};

/// Chunk flow signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Running,
    Paused,
    Stopped,
}

/// Send-side file state
pub(crate) struct SendIo {
    pub reader: ChunkReader,
}

/// Receive-side file state
pub(crate) struct ReceiveIo {
    pub expected: Digest,
    pub destination: Option<DestinationFile>,
    pub hasher: StreamingHasher,
    pub next_offset: u64,
    /// Largest chunk payload the peer may send
    pub max_chunk: u64,
}

/// State guarded by the I/O gate
pub(crate) enum TransferIo {
    Send(SendIo),
    Receive(ReceiveIo),
}

impl TransferIo {
    pub fn receive_mut(&mut self) -> Option<&mut ReceiveIo> {
        match self {
            TransferIo::Receive(io) => Some(io),
            TransferIo::Send(_) => None,
        }
    }

    pub fn send_mut(&mut self) -> Option<&mut SendIo> {
        match self {
            TransferIo::Send(io) => Some(io),
            TransferIo::Receive(_) => None,
        }
    }
}

pub(crate) struct TransferRuntime {
    pub file_id: FileId,
    pub peer_id: PeerId,
    pub channel: Arc<dyn PeerChannel>,
    /// I/O gate: chunk I/O and state transitions of this transfer take it
    pub io: tokio::sync::Mutex<TransferIo>,
    /// Unacknowledged chunk window
    window: Semaphore,
    in_flight: AtomicUsize,
    flow: watch::Sender<Flow>,
    stopped: AtomicBool,
    throttle: Mutex<ProgressThrottle>,
}

impl TransferRuntime {
    pub fn new(
        file_id: FileId,
        peer_id: PeerId,
        channel: Arc<dyn PeerChannel>,
        io: TransferIo,
        window_size: usize,
        throttle: ProgressThrottle,
    ) -> Arc<Self> {
        let (flow, _) = watch::channel(Flow::Running);
        Arc::new(Self {
            file_id,
            peer_id,
            channel,
            io: tokio::sync::Mutex::new(io),
            window: Semaphore::new(window_size),
            in_flight: AtomicUsize::new(0),
            flow,
            stopped: AtomicBool::new(false),
            throttle: Mutex::new(throttle),
        })
    }

    pub fn set_flow(&self, flow: Flow) {
        self.flow.send_replace(flow);
    }

    pub fn flow(&self) -> Flow {
        *self.flow.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Flow> {
        self.flow.subscribe()
    }

    /// Take a window slot for the next chunk; `false` once stopped
    pub async fn acquire_slot(&self) -> bool {
        match self.window.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Give a slot back
    ///
    /// Only slots actually taken are returned, so surplus acknowledgements
    /// never grow the window.
    pub fn release_slot(&self) {
        let taken = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            self.window.add_permits(1);
        }
    }

    /// Free window slots
    #[cfg(test)]
    pub fn available_slots(&self) -> usize {
        self.window.available_permits()
    }

    /// Stop chunk flow for good
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.window.close();
        self.set_flow(Flow::Stopped);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Count a chunk against the progress throttle
    pub fn progress_due(&self) -> bool {
        self.throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_chunk(Instant::now())
    }
}

/// Wait until the flow is running; `false` once stopped
pub(crate) async fn wait_running(flow: &mut watch::Receiver<Flow>) -> bool {
    loop {
        let state = *flow.borrow_and_update();
        match state {
            Flow::Running => return true,
            Flow::Stopped => return false,
            Flow::Paused => {}
        }
        if flow.changed().await.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PeerTransport;
    use crate::memory::MemoryTransport;
    use std::time::Duration;

    async fn runtime(window_size: usize) -> Arc<TransferRuntime> {
        let transport = MemoryTransport::new("A");
        let _inbox = transport.register("B");
        let channel = transport.open_channel(&PeerId::from("B")).await.unwrap();
        let io = TransferIo::Receive(ReceiveIo {
            expected: carrier_files::hash_bytes(b""),
            destination: None,
            hasher: StreamingHasher::new(),
            next_offset: 0,
            max_chunk: 16,
        });
        TransferRuntime::new(
            FileId::from("f"),
            PeerId::from("B"),
            channel,
            io,
            window_size,
            ProgressThrottle::new(Duration::ZERO, 0),
        )
    }

    #[tokio::test]
    async fn test_surplus_releases_do_not_grow_window() {
        let runtime = runtime(2).await;
        runtime.release_slot();
        assert_eq!(runtime.available_slots(), 2);

        assert!(runtime.acquire_slot().await);
        assert!(runtime.acquire_slot().await);
        assert_eq!(runtime.available_slots(), 0);

        for _ in 0..5 {
            runtime.release_slot();
        }
        assert_eq!(runtime.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_stop_fails_pending_acquire() {
        let runtime = runtime(1).await;
        assert!(runtime.acquire_slot().await);
        runtime.stop();
        assert!(!runtime.acquire_slot().await);
        assert!(runtime.is_stopped());
        assert_eq!(runtime.flow(), Flow::Stopped);
    }
}
