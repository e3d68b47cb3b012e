//! Destination storage for inbound transfers.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Resolve the on-disk path for an accepted file
///
/// An existing directory resolves to `dir/file_name`; anything else is used
/// as the full file path.
pub async fn resolve_destination(destination: impl AsRef<Path>, file_name: &str) -> PathBuf {
    let destination = destination.as_ref();
    match tokio::fs::metadata(destination).await {
        Ok(meta) if meta.is_dir() => destination.join(sanitize_file_name(file_name)),
        _ => destination.to_path_buf(),
    }
}

/// Strip directory components from a peer-supplied file name
fn sanitize_file_name(file_name: &str) -> String {
    let name = Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("received.bin");
    name.to_string()
}

/// Preallocated file receiving chunks at explicit offsets
#[derive(Debug)]
pub struct DestinationFile {
    path: PathBuf,
    file: tokio::fs::File,
    total_size: u64,
}

impl DestinationFile {
    /// Create (or truncate) the file and preallocate `total_size` bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or resized.
    pub async fn create(path: impl AsRef<Path>, total_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::File::create(&path).await?;
        file.set_len(total_size).await?;

        tracing::debug!(
            "Allocated destination {} ({} bytes)",
            path.display(),
            total_size
        );

        Ok(Self {
            path,
            file,
            total_size,
        })
    }

    /// Destination path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocated size
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Write a chunk payload at `offset`
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the write would run past the allocated size.
    pub async fn write_at(&mut self, offset: u64, payload: &[u8]) -> io::Result<()> {
        let end = offset.checked_add(payload.len() as u64);
        if end.is_none_or(|end| end > self.total_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk past end of destination",
            ));
        }

        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(payload).await
    }

    /// Flush and sync contents to disk
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub async fn finish(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }

    /// Close and delete the file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    pub async fn discard(self) -> io::Result<()> {
        let Self { path, file, .. } = self;
        drop(file);
        tokio::fs::remove_file(&path).await?;
        tracing::debug!("Discarded partial file {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preallocates_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");

        let mut dest = DestinationFile::create(&path, 8).await.unwrap();
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 8);

        dest.write_at(4, b"5678").await.unwrap();
        dest.write_at(0, b"1234").await.unwrap();
        dest.finish().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"12345678");
    }

    #[tokio::test]
    async fn test_rejects_write_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut dest = DestinationFile::create(dir.path().join("b.bin"), 4)
            .await
            .unwrap();
        assert!(dest.write_at(2, b"xyz").await.is_err());
    }

    #[tokio::test]
    async fn test_discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bin");
        let dest = DestinationFile::create(&path, 4).await.unwrap();
        dest.discard().await.unwrap();
        assert!(tokio::fs::metadata(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_destination() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_destination(dir.path(), "../../etc/a.bin").await;
        assert_eq!(resolved, dir.path().join("a.bin"));

        let explicit = dir.path().join("named.bin");
        assert_eq!(resolve_destination(&explicit, "a.bin").await, explicit);
    }
}
