//! BLAKE3 digests for transfer integrity.
//!
//! The sender digests the whole content up front and ships the digest with
//! the file request. The receiver feeds each chunk into a [`StreamingHasher`]
//! in offset order and compares once the last byte has landed.

use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// 32-byte BLAKE3 digest
pub type Digest = [u8; 32];

/// Read buffer size for file digests
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Buffers at least this large are hashed on the rayon pool
#[cfg(feature = "rayon")]
const PARALLEL_THRESHOLD: usize = 128 * 1024;

/// Hash an in-memory buffer
#[must_use]
pub fn hash_bytes(data: &[u8]) -> Digest {
    #[cfg(feature = "rayon")]
    if data.len() >= PARALLEL_THRESHOLD {
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(data);
        return *hasher.finalize().as_bytes();
    }
    *blake3::hash(data).as_bytes()
}

/// Hash a file on disk
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn hash_file(path: impl AsRef<Path>) -> io::Result<Digest> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    tracing::trace!(
        "Hashed {} ({} bytes)",
        path.as_ref().display(),
        hasher.bytes_hashed()
    );

    Ok(hasher.finalize())
}

/// Incremental digest over an ordered byte stream
#[derive(Debug, Clone, Default)]
pub struct StreamingHasher {
    inner: blake3::Hasher,
    bytes_hashed: u64,
}

impl StreamingHasher {
    /// Create an empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next run of bytes
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes_hashed += data.len() as u64;
    }

    /// Number of bytes fed so far
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Digest of everything fed so far
    #[must_use]
    pub fn finalize(&self) -> Digest {
        *self.inner.finalize().as_bytes()
    }

    /// Compare the running digest with an expected one
    #[must_use]
    pub fn verify(&self, expected: &Digest) -> bool {
        self.inner.finalize() == blake3::Hash::from(*expected)
    }
}
