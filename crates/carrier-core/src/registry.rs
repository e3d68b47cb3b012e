//! Transfer registry
//!
//! Single source of truth for which transfers exist. The registry owns every
//! [`TransferDescriptor`]; callers mutate descriptors only through it, and
//! every mutation is validated against the transfer state machine.
//!
//! Callers that must emit an event atomically with a transition take the
//! registry lock once via [`TransferRegistry::lock`] and do both under it.
//! The lock is a plain `std::sync::Mutex` and is never held across `.await`.

use crate::error::{CarrierError, Result};
use crate::ids::{FileId, PeerId};
use crate::transfer::{Direction, TransferDescriptor, TransferState};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Registry of active and recently finished transfers
pub struct TransferRegistry {
    state: Mutex<RegistryState>,
}

/// Registry contents, reachable only through the registry lock
#[derive(Debug)]
pub struct RegistryState {
    /// Non-terminal descriptors
    active: HashMap<FileId, TransferDescriptor>,
    /// Terminal descriptors, oldest first
    history: VecDeque<TransferDescriptor>,
    /// Maximum history length
    history_capacity: usize,
}

impl TransferRegistry {
    /// Create a registry retaining `history_capacity` finished transfers
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                active: HashMap::new(),
                history: VecDeque::with_capacity(history_capacity),
                history_capacity: history_capacity.max(1),
            }),
        }
    }

    /// Take the registry lock
    pub fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new descriptor
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTransfer` if the id was used before or a non-terminal
    /// outbound transfer of the same file to the same peer exists.
    pub fn register(&self, descriptor: TransferDescriptor) -> Result<FileId> {
        self.lock().register(descriptor)
    }

    /// Look up a descriptor, active or historical
    pub fn lookup(&self, file_id: &FileId) -> Option<TransferDescriptor> {
        self.lock().lookup(file_id)
    }

    /// Validate and apply a state transition
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransfer` or `InvalidTransition`.
    pub fn transition(
        &self,
        file_id: &FileId,
        new_state: TransferState,
    ) -> Result<TransferDescriptor> {
        self.lock().transition(file_id, new_state)
    }

    /// Move a terminal descriptor into history
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransfer` if the id is not active, or `InvalidTransition`
    /// if the descriptor has not reached a terminal state.
    pub fn remove(&self, file_id: &FileId) -> Result<TransferDescriptor> {
        self.lock().remove(file_id)
    }

    /// Number of non-terminal transfers
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Number of retained finished transfers
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }
}

impl RegistryState {
    /// Register a new descriptor
    ///
    /// # Errors
    ///
    /// See [`TransferRegistry::register`].
    pub fn register(&mut self, descriptor: TransferDescriptor) -> Result<FileId> {
        if descriptor.is_terminal() {
            return Err(CarrierError::invalid_request(
                "cannot register a terminal transfer",
            ));
        }

        let reused = self.active.contains_key(&descriptor.file_id)
            || self
                .history
                .iter()
                .any(|old| old.file_id == descriptor.file_id);
        let clashes = descriptor.direction == Direction::Send
            && self.active.values().any(|existing| {
                existing.direction == Direction::Send
                    && existing.peer_id == descriptor.peer_id
                    && existing.file_name == descriptor.file_name
            });

        if reused || clashes {
            return Err(CarrierError::DuplicateTransfer {
                peer_id: descriptor.peer_id,
                file_name: descriptor.file_name,
            });
        }

        tracing::debug!(
            "Registered {:?} transfer {} of '{}' with {} ({:?})",
            descriptor.direction,
            descriptor.file_id,
            descriptor.file_name,
            descriptor.peer_id,
            descriptor.state
        );

        let file_id = descriptor.file_id.clone();
        self.active.insert(file_id.clone(), descriptor);
        Ok(file_id)
    }

    /// Look up a descriptor, active or historical
    pub fn lookup(&self, file_id: &FileId) -> Option<TransferDescriptor> {
        self.active.get(file_id).cloned().or_else(|| {
            self.history
                .iter()
                .rev()
                .find(|old| &old.file_id == file_id)
                .cloned()
        })
    }

    /// Borrow an active descriptor
    pub fn get(&self, file_id: &FileId) -> Option<&TransferDescriptor> {
        self.active.get(file_id)
    }

    fn active_mut(&mut self, file_id: &FileId) -> Result<&mut TransferDescriptor> {
        if self.active.contains_key(file_id) {
            return self
                .active
                .get_mut(file_id)
                .ok_or_else(|| CarrierError::UnknownTransfer(file_id.clone()));
        }

        // A historical id is known but terminal: report the transition error
        // against its final state rather than pretending it never existed.
        match self.history.iter().rev().find(|old| &old.file_id == file_id) {
            Some(old) => Err(CarrierError::InvalidTransition {
                file_id: file_id.clone(),
                from: old.state,
                to: old.state,
            }),
            None => Err(CarrierError::UnknownTransfer(file_id.clone())),
        }
    }

    /// Validate and apply a state transition
    ///
    /// Terminal transitions also move the descriptor into history.
    ///
    /// # Errors
    ///
    /// See [`TransferRegistry::transition`].
    pub fn transition(
        &mut self,
        file_id: &FileId,
        new_state: TransferState,
    ) -> Result<TransferDescriptor> {
        let descriptor = match self.active_mut(file_id) {
            Err(CarrierError::InvalidTransition { file_id, from, .. }) => {
                return Err(CarrierError::InvalidTransition {
                    file_id,
                    from,
                    to: new_state,
                });
            }
            other => other?,
        };

        if !descriptor.state.can_transition(new_state) {
            return Err(CarrierError::InvalidTransition {
                file_id: file_id.clone(),
                from: descriptor.state,
                to: new_state,
            });
        }

        tracing::debug!(
            "Transfer {} transition: {:?} -> {:?}",
            file_id,
            descriptor.state,
            new_state
        );
        descriptor.state = new_state;
        let snapshot = descriptor.clone();

        if new_state.is_terminal() {
            self.remove(file_id)?;
        }
        Ok(snapshot)
    }

    /// Move a terminal descriptor into history
    ///
    /// # Errors
    ///
    /// See [`TransferRegistry::remove`].
    pub fn remove(&mut self, file_id: &FileId) -> Result<TransferDescriptor> {
        let descriptor = self
            .active
            .get(file_id)
            .ok_or_else(|| CarrierError::UnknownTransfer(file_id.clone()))?;

        if !descriptor.is_terminal() {
            return Err(CarrierError::InvalidTransition {
                file_id: file_id.clone(),
                from: descriptor.state,
                to: descriptor.state,
            });
        }

        let descriptor = self
            .active
            .remove(file_id)
            .ok_or_else(|| CarrierError::UnknownTransfer(file_id.clone()))?;

        if self.history.len() == self.history_capacity {
            if let Some(evicted) = self.history.pop_front() {
                tracing::trace!("Evicted transfer {} from history", evicted.file_id);
            }
        }
        self.history.push_back(descriptor.clone());
        Ok(descriptor)
    }

    /// Announce the size of a queried transfer and move it to `Requested`
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the descriptor is `Queried`.
    pub fn offer(&mut self, file_id: &FileId, total_size: u64) -> Result<TransferDescriptor> {
        self.transition(file_id, TransferState::Requested)?;
        let descriptor = self.active_mut(file_id)?;
        descriptor.total_size = Some(total_size);
        Ok(descriptor.clone())
    }

    /// Record the resolved receiver-side path
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransfer` if the id is not active.
    pub fn set_full_path(&mut self, file_id: &FileId, path: PathBuf) -> Result<()> {
        self.active_mut(file_id)?.full_path = Some(path);
        Ok(())
    }

    /// Advance the delivered byte count
    ///
    /// The count may only grow and must stay strictly below the total; the
    /// final byte count is applied by [`complete`](Self::complete) or
    /// [`abort_at`](Self::abort_at) together with the terminal transition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if chunks are not accepted in the current
    /// state, or `InvalidRequest` if the count would shrink or reach the total.
    pub fn record_progress(
        &mut self,
        file_id: &FileId,
        transferred_bytes: u64,
    ) -> Result<TransferDescriptor> {
        let descriptor = self.active_mut(file_id)?;

        if !descriptor.state.accepts_chunks() {
            return Err(CarrierError::InvalidTransition {
                file_id: file_id.clone(),
                from: descriptor.state,
                to: TransferState::Transferring,
            });
        }
        if transferred_bytes < descriptor.transferred_bytes {
            return Err(CarrierError::invalid_request("transferred bytes went backwards"));
        }
        if transferred_bytes >= descriptor.total() {
            return Err(CarrierError::invalid_request(
                "final bytes must be recorded with the terminal transition",
            ));
        }

        descriptor.transferred_bytes = transferred_bytes;
        Ok(descriptor.clone())
    }

    /// Record the final byte and complete the transfer
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the descriptor is `Transferring` or `Paused`.
    pub fn complete(&mut self, file_id: &FileId) -> Result<TransferDescriptor> {
        let descriptor = self.active_mut(file_id)?;
        if !descriptor.state.can_transition(TransferState::Completed) {
            return Err(CarrierError::InvalidTransition {
                file_id: file_id.clone(),
                from: descriptor.state,
                to: TransferState::Completed,
            });
        }
        descriptor.transferred_bytes = descriptor.total();
        self.transition(file_id, TransferState::Completed)
    }

    /// Abort, recording `transferred_bytes` as the final count
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the descriptor is already terminal.
    pub fn abort_at(
        &mut self,
        file_id: &FileId,
        transferred_bytes: u64,
    ) -> Result<TransferDescriptor> {
        let descriptor = self.active_mut(file_id)?;
        if transferred_bytes > descriptor.transferred_bytes {
            descriptor.transferred_bytes = transferred_bytes.min(descriptor.total());
        }
        self.transition(file_id, TransferState::Aborted)
    }

    /// Non-terminal transfers with `peer_id`
    pub fn active_for_peer(&self, peer_id: &PeerId) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self
            .active
            .values()
            .filter(|d| &d.peer_id == peer_id)
            .map(|d| d.file_id.clone())
            .collect();
        ids.sort();
        ids
    }
}
