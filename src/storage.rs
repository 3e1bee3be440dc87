//! Object storage facade.
//!
//! Wraps the `object_store` crate behind a small trait so the ingestion
//! pipeline can run against local disk in tests and against S3/GCS/Azure in
//! production without touching call sites, mirroring the predecessor
//! codebase's checkpointer abstraction (`Checkpointer` trait, sqlite/postgres
//! backends behind one interface).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use miette::Diagnostic;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore as _, PutPayload};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("object store backend error: {0}")]
    #[diagnostic(code(ragweave::storage::backend))]
    Backend(#[from] object_store::Error),

    #[error("invalid object key: {0}")]
    #[diagnostic(code(ragweave::storage::invalid_key))]
    InvalidKey(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The object-store layout (spec §4.1): `{tenant}/landing/{ingest_id}/{suffix}`.
/// The only area any stage ever writes to — nothing in this pipeline moves
/// an ingest's objects to a separate processed/quarantine/failed prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectArea {
    Landing,
}

impl ObjectArea {
    fn as_str(self) -> &'static str {
        match self {
            Self::Landing => "landing",
        }
    }
}

pub fn object_key(tenant_id: &str, area: ObjectArea, ingest_id: Uuid, suffix: &str) -> String {
    format!("{tenant_id}/{}/{ingest_id}/{suffix}", area.as_str())
}

/// Minimal async blob store surface this system needs: put/get/copy/delete.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> StorageResult<()>;
    async fn get(&self, key: &str) -> StorageResult<Bytes>;
    /// Move an object between areas by copying then deleting the source.
    async fn relocate(&self, from: &str, to: &str) -> StorageResult<()>;
    async fn delete(&self, key: &str) -> StorageResult<()>;
    async fn exists(&self, key: &str) -> StorageResult<bool>;
    /// Time-boxed download URL for `key`. The signing scheme itself is
    /// backend-specific (S3/GCS); this trait only names the contract.
    async fn presign(&self, key: &str, expires_in: Duration) -> StorageResult<String>;
}

/// `object_store`-backed implementation, usable with any of its registered
/// backends (local filesystem here; swap in `AmazonS3Builder` etc. in
/// deployment without changing this type's shape).
pub struct StorageFacade {
    inner: Arc<dyn object_store::ObjectStore>,
}

impl StorageFacade {
    pub fn local(root: impl AsRef<std::path::Path>) -> StorageResult<Self> {
        let fs = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self {
            inner: Arc::new(fs),
        })
    }

    pub fn from_dyn(inner: Arc<dyn object_store::ObjectStore>) -> Self {
        Self { inner }
    }

    fn path(key: &str) -> StorageResult<ObjectPath> {
        ObjectPath::parse(key).map_err(|e| StorageError::InvalidKey(e.to_string()))
    }
}

#[async_trait]
impl ObjectStore for StorageFacade {
    async fn put(&self, key: &str, bytes: Bytes) -> StorageResult<()> {
        let path = Self::path(key)?;
        self.inner.put(&path, PutPayload::from_bytes(bytes)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = Self::path(key)?;
        let result = self.inner.get(&path).await?;
        Ok(result.bytes().await?)
    }

    async fn relocate(&self, from: &str, to: &str) -> StorageResult<()> {
        let src = Self::path(from)?;
        let dst = Self::path(to)?;
        self.inner.copy(&src, &dst).await?;
        self.inner.delete(&src).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = Self::path(key)?;
        self.inner.delete(&path).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = Self::path(key)?;
        match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let _ = Self::path(key)?;
        Ok(format!("object-store://{key}?expires_in={}", expires_in.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_follows_layout() {
        let id = Uuid::nil();
        let key = object_key("acme", ObjectArea::Landing, id, "raw/report.pdf");
        assert_eq!(key, format!("acme/landing/{id}/raw/report.pdf"));
    }

    #[tokio::test]
    async fn put_get_roundtrip_on_local_fs() {
        let dir = tempfile::tempdir().unwrap();
        let facade = StorageFacade::local(dir.path()).unwrap();
        facade.put("a/b.txt", Bytes::from_static(b"hello")).await.unwrap();
        let data = facade.get("a/b.txt").await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(facade.exists("a/b.txt").await.unwrap());
    }
}
