//! Blob storage for analysis inputs and results.
//!
//! Backends:
//! - S3-compatible storage (MinIO in container deployments)
//! - On-disk storage for standalone deployments
//! - In-memory storage for tests
//!
//! This is a small wrapper around `object_store`, which already provides
//! all three backends. [`stores`] adapts it to the artifact and dataset
//! store capabilities.

use std::path::Path as FsPath;
use std::sync::Arc;

use bytes::Bytes;
use dispatch_core::OrchestratorError;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutMode};

mod config;
mod stores;

pub use config::{S3Config, StorageBackendConfig, StorageConfig};
use config::non_empty;
pub use stores::{ArtifactStorage, DatasetStorage};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object {0} already exists with different content")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => OrchestratorError::NotFound(key),
            StorageError::Conflict(key) => {
                OrchestratorError::Conflict(format!("object {key} already exists"))
            }
            StorageError::InvalidConfig(msg) => OrchestratorError::Fatal(msg),
            other => OrchestratorError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    S3,
    Filesystem,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::S3 => "s3",
            StorageKind::Filesystem => "filesystem",
            StorageKind::Memory => "memory",
        }
    }
}

/// Outcome of a write that must not replace existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    /// The object already held exactly these bytes.
    Unchanged,
}

#[derive(Clone)]
pub struct Storage {
    kind: StorageKind,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl Storage {
    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub async fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let (kind, store) = match cfg.backend {
            StorageBackendConfig::S3(s3) => (StorageKind::S3, Arc::new(build_s3(s3).await?) as _),
            StorageBackendConfig::Filesystem { root } => {
                ensure_dir(&root)?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
                (StorageKind::Filesystem, Arc::new(fs) as _)
            }
            StorageBackendConfig::Memory => {
                let mem = object_store::memory::InMemory::new();
                (StorageKind::Memory, Arc::new(mem) as _)
            }
        };

        tracing::info!("Opened {} storage", kind.as_str());

        Ok(Self {
            kind,
            store,
            prefix: cfg.prefix.and_then(non_empty),
        })
    }

    fn to_path(&self, key: &str) -> Result<Path, StorageError> {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(StorageError::InvalidConfig(
                "object key must not be empty".to_string(),
            ));
        }

        let joined = match self.prefix.as_deref() {
            Some(prefix) => {
                let prefix = prefix.trim_matches('/');
                if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}/{key}")
                }
            }
            None => key.to_string(),
        };

        Ok(Path::from(joined))
    }

    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.to_path(key)?;
        self.store
            .put(&path, object_store::PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    /// Write `bytes` unless the key already exists.
    ///
    /// Repeating a write with identical bytes succeeds; different bytes are
    /// a conflict. Backends without conditional writes fall back to an
    /// existence check first.
    pub async fn put_new(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, StorageError> {
        let path = self.to_path(key)?;
        let payload = object_store::PutPayload::from(bytes.clone());

        match self.store.put_opts(&path, payload, PutMode::Create.into()).await {
            Ok(_) => Ok(PutOutcome::Created),
            Err(object_store::Error::AlreadyExists { .. }) => {
                self.compare_existing(key, &bytes).await
            }
            Err(object_store::Error::NotImplemented { .. }) => {
                if self.exists(key).await? {
                    self.compare_existing(key, &bytes).await
                } else {
                    self.put_bytes(key, bytes).await?;
                    Ok(PutOutcome::Created)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn compare_existing(&self, key: &str, bytes: &Bytes) -> Result<PutOutcome, StorageError> {
        let existing = self.get_bytes(key).await?;
        if &existing == bytes {
            Ok(PutOutcome::Unchanged)
        } else {
            Err(StorageError::Conflict(key.to_string()))
        }
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.to_path(key)?;
        let res = self.store.get(&path).await.map_err(|e| not_found(key, e))?;
        res.bytes().await.map_err(|e| not_found(key, e))
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.to_path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_found(key: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => StorageError::ObjectStore(other),
    }
}

fn ensure_dir(root: &FsPath) -> Result<(), StorageError> {
    std::fs::create_dir_all(root)?;
    Ok(())
}

async fn build_s3(cfg: S3Config) -> Result<object_store::aws::AmazonS3, StorageError> {
    let mut builder = object_store::aws::AmazonS3Builder::new()
        .with_bucket_name(cfg.bucket)
        .with_region(cfg.region)
        .with_virtual_hosted_style_request(cfg.virtual_hosted_style);

    if let Some(endpoint) = cfg.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if cfg.allow_http {
        builder = builder.with_allow_http(true);
    }
    if let Some(access_key_id) = cfg.access_key_id {
        builder = builder.with_access_key_id(access_key_id);
    }
    if let Some(secret_access_key) = cfg.secret_access_key {
        builder = builder.with_secret_access_key(secret_access_key);
    }
    if let Some(session_token) = cfg.session_token {
        builder = builder.with_token(session_token);
    }

    Ok(builder.build()?)
}
