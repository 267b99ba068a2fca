//! Content store abstraction and the in-memory backend.

use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FileError;
use crate::range::{ByteRange, RangeSpec};
use crate::record::{compute_hash, ContentHash};

/// A readable window over one stored object.
pub struct ContentSlice {
    /// Length of the whole object.
    pub total_len: u64,
    /// The resolved range, when one was requested.
    pub range: Option<ByteRange>,
    /// Reader yielding exactly [`ContentSlice::len`] bytes.
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl ContentSlice {
    /// Number of bytes the reader yields.
    pub fn len(&self) -> u64 {
        match self.range {
            Some(range) => range.len(),
            None => self.total_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the reader into memory.
    pub async fn read_to_vec(mut self) -> Result<Vec<u8>, FileError> {
        let mut buf = Vec::with_capacity(self.len() as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl std::fmt::Debug for ContentSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentSlice")
            .field("total_len", &self.total_len)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

/// Durable, content-addressed byte storage.
///
/// Implementations must never expose a partially written object, and must
/// refuse to replace an object with different bytes under the same hash.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Persist `bytes` under `hash`. Idempotent for identical bytes.
    async fn store(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), FileError>;

    /// Read a whole object. Fails with `ContentNotFound` when absent.
    async fn retrieve(&self, hash: &ContentHash) -> Result<Vec<u8>, FileError>;

    /// Existence check without side effects.
    async fn exists(&self, hash: &ContentHash) -> bool;

    /// Size of a stored object, if present.
    async fn size_of(&self, hash: &ContentHash) -> Result<Option<u64>, FileError>;

    /// Open an object, optionally restricted to a byte range, for streaming.
    async fn open_range(
        &self,
        hash: &ContentHash,
        range: Option<RangeSpec>,
    ) -> Result<ContentSlice, FileError>;

    /// Every hash currently held.
    async fn hashes(&self) -> Result<Vec<ContentHash>, FileError>;
}

/// Reject bytes whose digest differs from the hash they are filed under.
pub(crate) fn check_digest(hash: &ContentHash, bytes: &[u8]) -> Result<(), FileError> {
    let actual = compute_hash(bytes);
    if &actual != hash {
        return Err(FileError::ContentMismatch {
            expected: *hash,
            actual,
        });
    }
    Ok(())
}

/// In-memory content store (for tests and ephemeral nodes).
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    objects: Arc<RwLock<HashMap<ContentHash, Arc<Vec<u8>>>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn store(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), FileError> {
        check_digest(hash, bytes)?;
        let mut objects = self.objects.write();
        if let Some(existing) = objects.get(hash) {
            if existing.as_slice() != bytes {
                return Err(FileError::precondition(format!(
                    "object {hash} already stored with different bytes"
                )));
            }
            return Ok(());
        }
        objects.insert(*hash, Arc::new(bytes.to_vec()));
        Ok(())
    }

    async fn retrieve(&self, hash: &ContentHash) -> Result<Vec<u8>, FileError> {
        self.objects
            .read()
            .get(hash)
            .map(|bytes| bytes.as_ref().clone())
            .ok_or(FileError::ContentNotFound(*hash))
    }

    async fn exists(&self, hash: &ContentHash) -> bool {
        self.objects.read().contains_key(hash)
    }

    async fn size_of(&self, hash: &ContentHash) -> Result<Option<u64>, FileError> {
        Ok(self.objects.read().get(hash).map(|b| b.len() as u64))
    }

    async fn open_range(
        &self,
        hash: &ContentHash,
        range: Option<RangeSpec>,
    ) -> Result<ContentSlice, FileError> {
        let bytes = self
            .objects
            .read()
            .get(hash)
            .cloned()
            .ok_or(FileError::ContentNotFound(*hash))?;
        let total_len = bytes.len() as u64;

        let (range, window) = match range {
            Some(spec) => {
                let resolved = spec.resolve(total_len)?;
                let window = bytes[resolved.start as usize..=resolved.end as usize].to_vec();
                (Some(resolved), window)
            }
            None => (None, bytes.as_ref().clone()),
        };

        Ok(ContentSlice {
            total_len,
            range,
            reader: Box::pin(Cursor::new(window)),
        })
    }

    async fn hashes(&self) -> Result<Vec<ContentHash>, FileError> {
        Ok(self.objects.read().keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_retrieve() {
        let store = MemoryContentStore::new();
        let bytes = b"abc".to_vec();
        let hash = compute_hash(&bytes);

        assert!(!store.exists(&hash).await);
        store.store(&hash, &bytes).await.unwrap();
        assert!(store.exists(&hash).await);
        assert_eq!(store.retrieve(&hash).await.unwrap(), bytes);

        store.store(&hash, &bytes).await.unwrap();
        assert_eq!(store.retrieve(&hash).await.unwrap(), bytes);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn rejects_bytes_that_do_not_match_hash() {
        let store = MemoryContentStore::new();
        let hash = compute_hash(b"original");

        let err = store.store(&hash, b"forged").await.unwrap_err();
        assert!(matches!(err, FileError::ContentMismatch { .. }));
        assert!(!store.exists(&hash).await);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryContentStore::new();
        let hash = compute_hash(b"never stored");

        assert!(matches!(
            store.retrieve(&hash).await,
            Err(FileError::ContentNotFound(h)) if h == hash
        ));
        assert_eq!(store.size_of(&hash).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ranged_reads() {
        let store = MemoryContentStore::new();
        let bytes = b"0123456789".to_vec();
        let hash = compute_hash(&bytes);
        store.store(&hash, &bytes).await.unwrap();

        let slice = store
            .open_range(&hash, Some(RangeSpec::parse("bytes=0-3").unwrap()))
            .await
            .unwrap();
        assert_eq!(slice.total_len, 10);
        assert_eq!(slice.len(), 4);
        assert_eq!(slice.read_to_vec().await.unwrap(), b"0123");

        let full = store.open_range(&hash, None).await.unwrap();
        assert_eq!(full.range, None);
        assert_eq!(full.read_to_vec().await.unwrap(), bytes);

        let err = store
            .open_range(&hash, Some(RangeSpec::parse("bytes=20-").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::InvalidRange(_)));
    }
}
