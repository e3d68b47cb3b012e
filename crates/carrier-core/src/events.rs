//! Node events delivered to the application.
//!
//! All events of one node go through a single [`EventSink`]. Events are
//! enqueued in the order the node observed them; for one transfer that is the
//! order of its state transitions, because the engine emits while holding the
//! registry lock.

use crate::ids::{FileId, PeerId};
use crate::transfer::AbortReason;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Network or friend connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Reachable
    Connected,
    /// Unreachable
    Disconnected,
}

/// Events raised by a Carrier node
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Event {
    /// Transport loop went idle
    IdleNotice,
    /// Connectivity changed; `peer` is `None` for the node's own network link
    ConnectionChanged {
        peer: Option<PeerId>,
        status: ConnectionStatus,
    },
    /// A peer offered a session
    IncomingSessionRequest { peer_id: PeerId, offer: Vec<u8> },
    /// Session became active
    SessionReady { peer_id: PeerId },
    /// Our offer was declined
    SessionRejected { peer_id: PeerId, reason: String },
    /// Session torn down
    SessionClosed { peer_id: PeerId },
    /// Peer asked whether we want a file
    FileQueried {
        peer_id: PeerId,
        file_id: FileId,
        file_name: String,
        message: String,
    },
    /// Peer formally offered a file
    FileRequest {
        peer_id: PeerId,
        file_id: FileId,
        file_name: String,
        total_size: u64,
    },
    /// Receiver accepted; `full_path` is the receiver-side path
    FileAccepted {
        peer_id: PeerId,
        file_id: FileId,
        full_path: PathBuf,
        total_size: u64,
    },
    FileRejected {
        peer_id: PeerId,
        file_id: FileId,
        reason: String,
    },
    FilePaused { peer_id: PeerId, file_id: FileId },
    FileResumed { peer_id: PeerId, file_id: FileId },
    FileCanceled { peer_id: PeerId, file_id: FileId },
    FileCompleted {
        peer_id: PeerId,
        file_id: FileId,
        transferred_bytes: u64,
    },
    FileProgress {
        peer_id: PeerId,
        file_id: FileId,
        transferred_bytes: u64,
        total_size: u64,
    },
    FileAborted {
        peer_id: PeerId,
        file_id: FileId,
        reason: AbortReason,
        transferred_bytes: u64,
    },
}

impl Event {
    /// Transfer the event refers to, if any
    #[must_use]
    pub fn file_id(&self) -> Option<&FileId> {
        match self {
            Event::FileQueried { file_id, .. }
            | Event::FileRequest { file_id, .. }
            | Event::FileAccepted { file_id, .. }
            | Event::FileRejected { file_id, .. }
            | Event::FilePaused { file_id, .. }
            | Event::FileResumed { file_id, .. }
            | Event::FileCanceled { file_id, .. }
            | Event::FileCompleted { file_id, .. }
            | Event::FileProgress { file_id, .. }
            | Event::FileAborted { file_id, .. } => Some(file_id),
            _ => None,
        }
    }

    /// Reports a terminal transfer state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::FileCompleted { .. }
                | Event::FileRejected { .. }
                | Event::FileCanceled { .. }
                | Event::FileAborted { .. }
        )
    }

    /// Is a `FileProgress` event
    #[must_use]
    pub fn is_progress(&self) -> bool {
        matches!(self, Event::FileProgress { .. })
    }
}

/// Ordered event queue drained by the application
pub struct EventSink {
    queue: Mutex<VecDeque<Event>>,
    capacity: Option<usize>,
    dropped: AtomicU64,
    notify: Notify,
}

impl EventSink {
    /// Unbounded sink
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Sink capped at `capacity` queued events
    ///
    /// When full, progress events are shed first; other events are always
    /// queued.
    #[must_use]
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event
    pub fn emit(&self, event: Event) {
        {
            let mut queue = self.queue();
            if let Some(cap) = self.capacity {
                if queue.len() >= cap {
                    if let Some(pos) = queue.iter().position(Event::is_progress) {
                        queue.remove(pos);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    } else if event.is_progress() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!("Event queue full, dropped progress event");
                        return;
                    }
                }
            }
            tracing::trace!("Event: {:?}", event);
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Pop the oldest event without waiting
    pub fn try_next(&self) -> Option<Event> {
        self.queue().pop_front()
    }

    /// Wait for the next event
    pub async fn next(&self) -> Event {
        loop {
            if let Some(event) = self.try_next() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<Event> {
        self.queue().drain(..).collect()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.queue().len()
    }

    /// Queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Progress events shed because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
