//! Peer and file identifiers.

use crate::error::{CarrierError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a remote Carrier node
///
/// Stable for the lifetime of a friendship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an address string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of one transfer instance, generated by the sender
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    /// Length of generated ids in random bytes
    const RANDOM_BYTES: usize = 16;

    /// Generate a fresh random id (hex of 16 random bytes)
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the OS random source is unavailable.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; Self::RANDOM_BYTES];
        getrandom::getrandom(&mut bytes)
            .map_err(|_| CarrierError::invalid_request("random source unavailable"))?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Wrap an existing id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for FileId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
