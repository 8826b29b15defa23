//! Artifact and dataset stores over [`Storage`].

use bytes::Bytes;
use dispatch_core::{
    ArtifactKey, ArtifactStore, BoxFuture, DatasetRef, DatasetStore, OrchestratorResult,
};

use crate::{PutOutcome, Storage};

/// Write-once result storage.
///
/// A key written once keeps its bytes; a second write of the same bytes is
/// accepted, different bytes are a `Conflict`.
#[derive(Clone)]
pub struct ArtifactStorage {
    storage: Storage,
}

impl ArtifactStorage {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl ArtifactStore for ArtifactStorage {
    fn put<'a>(
        &'a self,
        key: &'a ArtifactKey,
        bytes: Bytes,
    ) -> BoxFuture<'a, OrchestratorResult<()>> {
        Box::pin(async move {
            let size = bytes.len();
            match self.storage.put_new(key.as_str(), bytes).await? {
                PutOutcome::Created => tracing::debug!("Stored artifact {} ({} bytes)", key, size),
                PutOutcome::Unchanged => tracing::debug!("Artifact {} already stored", key),
            }
            Ok(())
        })
    }

    fn supersede<'a>(
        &'a self,
        key: &'a ArtifactKey,
        bytes: Bytes,
    ) -> BoxFuture<'a, OrchestratorResult<()>> {
        Box::pin(async move {
            tracing::info!("Superseding artifact {}", key);
            self.storage.put_bytes(key.as_str(), bytes).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a ArtifactKey) -> BoxFuture<'a, OrchestratorResult<Bytes>> {
        Box::pin(async move { Ok(self.storage.get_bytes(key.as_str()).await?) })
    }

    fn exists<'a>(&'a self, key: &'a ArtifactKey) -> BoxFuture<'a, OrchestratorResult<bool>> {
        Box::pin(async move { Ok(self.storage.exists(key.as_str()).await?) })
    }
}

/// Read-only view of the datasets an ingestion process has published.
///
/// A dataset reference is the object key of its archive.
#[derive(Clone)]
pub struct DatasetStorage {
    storage: Storage,
}

impl DatasetStorage {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl DatasetStore for DatasetStorage {
    fn get<'a>(&'a self, dataset: &'a DatasetRef) -> BoxFuture<'a, OrchestratorResult<Bytes>> {
        Box::pin(async move { Ok(self.storage.get_bytes(dataset.as_str()).await?) })
    }

    fn exists<'a>(&'a self, dataset: &'a DatasetRef) -> BoxFuture<'a, OrchestratorResult<bool>> {
        Box::pin(async move { Ok(self.storage.exists(dataset.as_str()).await?) })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use dispatch_core::{JobId, OrchestratorError, WorkItemId};

    use super::*;
    use crate::StorageConfig;

    #[tokio::test]
    async fn artifacts_are_write_once() -> Result<(), OrchestratorError> {
        let storage = Storage::new(StorageConfig::memory()).await?;
        let artifacts = ArtifactStorage::new(storage);
        let key = ArtifactKey::for_attempt(JobId(1), WorkItemId(2), 1);

        assert!(!artifacts.exists(&key).await?);
        artifacts.put(&key, Bytes::from("result")).await?;
        artifacts.put(&key, Bytes::from("result")).await?;
        let conflict = artifacts.put(&key, Bytes::from("other")).await;
        assert!(matches!(conflict, Err(OrchestratorError::Conflict(_))));
        assert_eq!(artifacts.get(&key).await?, Bytes::from("result"));

        artifacts.supersede(&key, Bytes::from("corrected")).await?;
        assert_eq!(artifacts.get(&key).await?, Bytes::from("corrected"));
        Ok(())
    }

    #[tokio::test]
    async fn datasets_resolve_by_key() -> Result<(), OrchestratorError> {
        let dir = tempfile::tempdir().map_err(|e| OrchestratorError::Fatal(e.to_string()))?;
        std::fs::write(dir.path().join("repo-a.zip"), b"archive")
            .map_err(|e| OrchestratorError::Fatal(e.to_string()))?;

        let storage = Storage::new(StorageConfig::filesystem(dir.path())).await?;
        let datasets = DatasetStorage::new(storage);

        let present = DatasetRef::new("repo-a.zip");
        assert!(datasets.exists(&present).await?);
        assert_eq!(datasets.get(&present).await?, Bytes::from("archive"));

        let missing = DatasetRef::new("repo-b.zip");
        assert!(!datasets.exists(&missing).await?);
        assert!(matches!(
            datasets.get(&missing).await,
            Err(OrchestratorError::NotFound(_))
        ));
        Ok(())
    }
}
