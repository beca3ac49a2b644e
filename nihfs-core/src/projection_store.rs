//! `ProjectionStore` is the opaque external collaborator `spec.md §1`
//! carves out of scope: "the projection engine itself (batch compaction,
//! columnar storage, block iteration) is treated as an opaque
//! `ProjectionStore` with open/append/close/quiesce". This module defines
//! that trait plus a development/test default implementation that is
//! explicitly not a columnar store — it persists batches as
//! newline-delimited JSON, which is enough to satisfy the ordering and
//! durability properties this crate is responsible for (`spec.md §8`
//! items 4 and 6) without attempting compaction or block iteration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::ResourceError;
use crate::resource::Batch;

/// The marker file whose presence in a version directory distinguishes a
/// projection from a blob (`spec.md §4.2`'s `isProjection`).
pub const PROJECTION_MARKER: &str = "projection_marker";
const DATA_FILE: &str = "data.ndjson";

#[async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn append(&self, batch: Batch) -> Result<(), ResourceError>;

    async fn record_count(&self) -> Result<u64, ResourceError>;

    /// Every appended value, in offset order. Exists so callers can read
    /// back ingested content; the real columnar engine this stands in
    /// for would instead expose block iteration.
    async fn read_all(&self) -> Result<Vec<serde_json::Value>, ResourceError>;

    async fn quiesce(&self) -> Result<(), ResourceError>;

    async fn close(&self) -> Result<(), ResourceError>;
}

/// Opens or creates a [`ProjectionStore`] rooted at a version directory.
/// Pluggable so a real columnar engine can be substituted without
/// touching [`crate::resource_builder::ResourceBuilder`].
///
/// Returns `Arc` rather than `Box` so a [`crate::path_manager::PathManager`]
/// can keep its own cached reference to the current head's store while
/// handing out independent [`crate::resource::ProjectionResource`] clones
/// to readers, without the store itself needing to be `Clone`.
#[async_trait]
pub trait ProjectionStoreFactory: Send + Sync {
    async fn create(&self, version_dir: &Path) -> Result<Arc<dyn ProjectionStore>, ResourceError>;

    async fn open(&self, version_dir: &Path) -> Result<Arc<dyn ProjectionStore>, ResourceError>;

    fn is_projection(&self, version_dir: &Path) -> bool {
        version_dir.join(PROJECTION_MARKER).is_file()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlatFileProjectionStoreFactory;

#[async_trait]
impl ProjectionStoreFactory for FlatFileProjectionStoreFactory {
    async fn create(&self, version_dir: &Path) -> Result<Arc<dyn ProjectionStore>, ResourceError> {
        tokio::fs::create_dir_all(version_dir).await?;
        tokio::fs::write(version_dir.join(PROJECTION_MARKER), b"").await?;
        tokio::fs::write(version_dir.join(DATA_FILE), b"").await?;
        Ok(Arc::new(FlatFileProjectionStore {
            data_path: version_dir.join(DATA_FILE),
        }))
    }

    async fn open(&self, version_dir: &Path) -> Result<Arc<dyn ProjectionStore>, ResourceError> {
        let data_path = version_dir.join(DATA_FILE);
        if !data_path.is_file() {
            return Err(ResourceError::NotFound);
        }
        Ok(Arc::new(FlatFileProjectionStore { data_path }))
    }
}

struct FlatFileProjectionStore {
    data_path: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Record {
    offset: u64,
    values: Vec<serde_json::Value>,
}

#[async_trait]
impl ProjectionStore for FlatFileProjectionStore {
    async fn append(&self, batch: Batch) -> Result<(), ResourceError> {
        let line = serde_json::to_string(&Record {
            offset: batch.offset,
            values: batch.values,
        })?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.data_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn record_count(&self) -> Result<u64, ResourceError> {
        Ok(self.read_all().await?.len() as u64)
    }

    async fn read_all(&self) -> Result<Vec<serde_json::Value>, ResourceError> {
        let contents = match tokio::fs::read_to_string(&self.data_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(line)?;
            out.extend(record.values);
        }
        Ok(out)
    }

    async fn quiesce(&self) -> Result<(), ResourceError> {
        // Nothing is buffered in memory beyond the OS page cache; every
        // append already flushed its writer.
        Ok(())
    }

    async fn close(&self) -> Result<(), ResourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_and_read_preserves_offset_order() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("v1");
        let factory = FlatFileProjectionStoreFactory;
        let store = factory.create(&version_dir).await.unwrap();

        store
            .append(Batch {
                offset: 10,
                values: vec![json!({"x": 1})],
            })
            .await
            .unwrap();
        store
            .append(Batch {
                offset: 11,
                values: vec![json!({"x": 2})],
            })
            .await
            .unwrap();

        let values = store.read_all().await.unwrap();
        assert_eq!(values, vec![json!({"x": 1}), json!({"x": 2})]);
        assert_eq!(store.record_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn open_missing_store_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FlatFileProjectionStoreFactory;
        let err = factory.open(&dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, ResourceError::NotFound));
    }
}
