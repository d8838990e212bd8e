//! Directory-backed [`BlobStore`].
//!
//! Each entry is two files named by the SHA-256 of its key: `<hash>.bin`
//! holds the data, `<hash>.json` holds the [`BlobMeta`] record. Both are
//! written to a uniquely named temporary file and renamed into place, and the metadata is
//! written last so a listing never reports a half-written entry.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::persistent::{BlobMeta, BlobStore, StoredBlob};
use crate::{Result, TesseraError};

const DATA_EXT: &str = "bin";
const META_EXT: &str = "json";

/// Stores blobs as files in a single directory.
pub struct DiskBlobStore {
    dir: PathBuf,
}

impl DiskBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the default location (`<cache dir>/tessera/blobs`).
    pub fn with_default_dir() -> Result<Self> {
        let dir = default_dir().ok_or_else(|| {
            TesseraError::Configuration("could not determine cache directory".into())
        })?;
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", Self::stem(key)))
    }

    async fn write_atomic(&self, path: PathBuf, contents: Bytes) -> Result<()> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            // Unique name in the target directory, so concurrent writers never
            // share a temporary and the rename stays on one filesystem.
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&contents)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn read_meta(path: &Path) -> Result<Option<BlobMeta>> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Default blob directory: `<platform cache dir>/tessera/blobs`.
pub fn default_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("tessera").join("blobs"))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    fn name(&self) -> &str {
        "disk"
    }

    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredBlob>> {
        let Some(meta) = Self::read_meta(&self.path(key, META_EXT)).await? else {
            return Ok(None);
        };
        if meta.key != key {
            warn!(key = %key, stored = %meta.key, "blob key mismatch, ignoring entry");
            return Ok(None);
        }

        let data = match tokio::fs::read(self.path(key, DATA_EXT)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.len() != meta.size_bytes {
            warn!(key = %key, expected = meta.size_bytes, actual = data.len(), "truncated blob");
            return Ok(None);
        }

        Ok(Some(StoredBlob {
            data: Bytes::from(data),
            inserted_at: meta.inserted_at(),
            quality_level: meta.quality_level,
        }))
    }

    async fn put(&self, key: &str, blob: &StoredBlob) -> Result<()> {
        let meta = serde_json::to_vec(&blob.meta(key))?;
        self.write_atomic(self.path(key, DATA_EXT), blob.data.clone()).await?;
        self.write_atomic(self.path(key, META_EXT), Bytes::from(meta)).await?;
        debug!(key = %key, size = blob.data.len(), "wrote blob");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        remove_if_exists(&self.path(key, META_EXT)).await?;
        remove_if_exists(&self.path(key, DATA_EXT)).await
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BlobMeta>> {
        let mut metas = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(metas),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            match Self::read_meta(&path).await {
                Ok(Some(meta)) => metas.push(meta),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt blob metadata"),
            }
        }

        Ok(metas)
    }
}
