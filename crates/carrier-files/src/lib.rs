//! # Carrier Files
//!
//! File side of Carrier transfers.
//!
//! This crate provides:
//! - Fixed-size chunk planning
//! - BLAKE3 digests over the concatenated chunk stream
//! - Chunk sources (files on disk or in-memory buffers)
//! - Destination storage with preallocation and partial-file cleanup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod hasher;
pub mod source;
pub mod storage;

pub use chunker::FileChunker;
pub use hasher::{Digest, StreamingHasher, hash_bytes};
pub use source::{ChunkReader, FileSource};
pub use storage::{DestinationFile, resolve_destination};

/// Default chunk size (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
