//! Hash-sharded content store on the local filesystem.
//!
//! Objects live at `<root>/<first two hex chars>/<full hex>`. Writes land in
//! `<root>/tmp` first, are fsynced, then renamed into their shard, so readers
//! only ever see complete objects.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::FileError;
use crate::range::RangeSpec;
use crate::record::ContentHash;
use crate::storage::{check_digest, ContentSlice, ContentStore};

const TMP_DIR: &str = "tmp";
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Leftover partial writes from a previous process are discarded.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, FileError> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR)).await?;
        let store = Self { root };
        store.sweep_partials().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of the object for `hash`.
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.shard()).join(hash.to_hex())
    }

    fn partial_path(&self, hash: &ContentHash) -> PathBuf {
        self.root
            .join(TMP_DIR)
            .join(format!("{}.{}{}", hash.to_hex(), Uuid::new_v4(), PARTIAL_SUFFIX))
    }

    async fn sweep_partials(&self) -> Result<(), FileError> {
        let mut entries = fs::read_dir(self.root.join(TMP_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                debug!("Removing stale partial write {:?}", entry.path());
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!("Failed to remove stale partial {:?}: {}", entry.path(), e);
                }
            }
        }
        Ok(())
    }

    async fn open_object(&self, hash: &ContentHash) -> Result<File, FileError> {
        match File::open(self.object_path(hash)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FileError::ContentNotFound(*hash)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomically(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), FileError> {
        let target = self.object_path(hash);
        if let Some(shard) = target.parent() {
            fs::create_dir_all(shard).await?;
        }

        let partial = self.partial_path(hash);
        let written = async {
            let mut file = File::create(&partial).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&partial, &target).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn store(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), FileError> {
        check_digest(hash, bytes)?;

        match fs::read(self.object_path(hash)).await {
            Ok(existing) if existing == bytes => {
                debug!("Content {} already stored", hash);
                return Ok(());
            }
            Ok(_) => {
                return Err(FileError::precondition(format!(
                    "object {hash} already stored with different bytes"
                )));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.write_atomically(hash, bytes).await?;
        debug!("Stored content {} ({} bytes)", hash, bytes.len());
        Ok(())
    }

    async fn retrieve(&self, hash: &ContentHash) -> Result<Vec<u8>, FileError> {
        match fs::read(self.object_path(hash)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FileError::ContentNotFound(*hash)),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.object_path(hash)).await.unwrap_or(false)
    }

    async fn size_of(&self, hash: &ContentHash) -> Result<Option<u64>, FileError> {
        match fs::metadata(self.object_path(hash)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_range(
        &self,
        hash: &ContentHash,
        range: Option<RangeSpec>,
    ) -> Result<ContentSlice, FileError> {
        let mut file = self.open_object(hash).await?;
        let total_len = file.metadata().await?.len();

        let Some(spec) = range else {
            return Ok(ContentSlice {
                total_len,
                range: None,
                reader: Box::pin(file.take(total_len)),
            });
        };

        let resolved = spec.resolve(total_len)?;
        file.seek(SeekFrom::Start(resolved.start)).await?;
        Ok(ContentSlice {
            total_len,
            range: Some(resolved),
            reader: Box::pin(file.take(resolved.len())),
        })
    }

    async fn hashes(&self) -> Result<Vec<ContentHash>, FileError> {
        let mut found = Vec::new();
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            if shard_name == TMP_DIR || !shard.file_type().await?.is_dir() {
                continue;
            }

            let mut objects = fs::read_dir(shard.path()).await?;
            while let Some(object) = objects.next_entry().await? {
                let name = object.file_name().to_string_lossy().into_owned();
                match ContentHash::from_hex(&name) {
                    Ok(hash) if hash.shard() == shard_name => found.push(hash),
                    _ => debug!("Ignoring stray file {:?} in content store", object.path()),
                }
            }
        }
        found.sort();
        Ok(found)
    }
}
