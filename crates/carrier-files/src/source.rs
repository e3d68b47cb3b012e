//! Chunk sources for outbound transfers.

use crate::hasher::{Digest, hash_bytes, hash_file};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Content offered to a peer
#[derive(Debug, Clone)]
pub enum FileSource {
    /// File on disk
    Path(PathBuf),
    /// In-memory buffer
    Memory(Arc<[u8]>),
}

impl FileSource {
    /// Source backed by a file on disk
    pub fn path(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    /// Source backed by an in-memory buffer
    pub fn memory(data: impl Into<Vec<u8>>) -> Self {
        Self::Memory(Arc::from(data.into().into_boxed_slice()))
    }

    /// Content length in bytes
    ///
    /// # Errors
    ///
    /// Returns an error if file metadata cannot be read.
    pub async fn len(&self) -> io::Result<u64> {
        match self {
            Self::Path(path) => Ok(tokio::fs::metadata(path).await?.len()),
            Self::Memory(data) => Ok(data.len() as u64),
        }
    }

    /// BLAKE3 digest of the full content
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn digest(&self) -> io::Result<Digest> {
        match self {
            Self::Path(path) => hash_file(path).await,
            Self::Memory(data) => Ok(hash_bytes(data)),
        }
    }

    /// Default file name announced to the receiver
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Path(path) => path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string),
            Self::Memory(_) => None,
        }
    }

    /// Open a positional reader over the content
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(&self) -> io::Result<ChunkReader> {
        match self {
            Self::Path(path) => Ok(ChunkReader::File(tokio::fs::File::open(path).await?)),
            Self::Memory(data) => Ok(ChunkReader::Memory(Arc::clone(data))),
        }
    }
}

/// Positional reader handing out owned chunk payloads
#[derive(Debug)]
pub enum ChunkReader {
    /// Open file handle
    File(tokio::fs::File),
    /// Shared in-memory buffer
    Memory(Arc<[u8]>),
}

impl ChunkReader {
    /// Read exactly `len` bytes starting at `offset`
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` if the range runs past the content.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        match self {
            Self::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer).await?;
                Ok(buffer)
            }
            Self::Memory(data) => {
                let start = usize::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= data.len())
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::UnexpectedEof, "chunk past end of source")
                    })?;
                Ok(data[start..end].to_vec())
            }
        }
    }
}
