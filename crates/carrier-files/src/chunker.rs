//! Fixed-size chunk planning.

use crate::DEFAULT_CHUNK_SIZE;

/// Splits a byte range into fixed-size chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunker {
    chunk_size: usize,
}

impl FileChunker {
    /// Create a new chunker with default chunk size
    #[must_use]
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Create a new chunker with custom chunk size
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn with_chunk_size(size: usize) -> Self {
        assert!(size > 0, "chunk size must be greater than 0");
        Self { chunk_size: size }
    }

    /// Get chunk size
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Calculate number of chunks for a file
    #[must_use]
    pub fn chunk_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size as u64)
    }

    /// Iterate `(offset, len)` pairs covering `file_size` bytes
    pub fn ranges(&self, file_size: u64) -> impl Iterator<Item = (u64, usize)> + '_ {
        let step = self.chunk_size as u64;
        (0..self.chunk_count(file_size)).map(move |index| {
            let offset = index * step;
            let len = (file_size - offset).min(step) as usize;
            (offset, len)
        })
    }
}

impl Default for FileChunker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        let chunker = FileChunker::with_chunk_size(16);
        assert_eq!(chunker.chunk_count(0), 0);
        assert_eq!(chunker.chunk_count(1), 1);
        assert_eq!(chunker.chunk_count(16), 1);
        assert_eq!(chunker.chunk_count(17), 2);
        assert_eq!(chunker.chunk_count(1024), 64);
    }

    #[test]
    fn test_ranges_cover_file() {
        let chunker = FileChunker::with_chunk_size(10);
        let ranges: Vec<_> = chunker.ranges(25).collect();
        assert_eq!(ranges, vec![(0, 10), (10, 10), (20, 5)]);
        let total: usize = ranges.iter().map(|(_, len)| len).sum();
        assert_eq!(total, 25);
    }

    #[test]
    fn test_default_chunk_size() {
        assert_eq!(FileChunker::default().chunk_size(), DEFAULT_CHUNK_SIZE);
    }
}
