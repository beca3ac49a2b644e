//! The two resource kinds a version directory may hold, and the small
//! value types shared between the version log, the resource builder, and
//! the ingest state machine.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ResourceError;
use crate::projection_store::ProjectionStore;

/// The quirrel-data mimetype used for every [`ProjectionResource`],
/// per `spec.md §3`.
pub const PROJECTION_MIME_TYPE: &str = "application/x-quirrel-data";

/// The source mimetype that triggers `spec.md §4.3`'s `maybeInvalidateCache`
/// side effect when a blob carrying it is created.
pub const QUIRREL_SCRIPT_MIME_TYPE: &str = "text/x-quirrel-script";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Projection,
    Blob,
}

/// A non-empty set of account identifiers credited with a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeSet<String>", into = "BTreeSet<String>")]
pub struct Authorities(BTreeSet<String>);

impl Authorities {
    pub fn new(accounts: impl IntoIterator<Item = String>) -> Result<Authorities, ResourceError> {
        let set: BTreeSet<String> = accounts.into_iter().collect();
        if set.is_empty() {
            return Err(ResourceError::IllegalWriteRequest(
                "authorities must be non-empty".into(),
            ));
        }
        Ok(Authorities(set))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl TryFrom<BTreeSet<String>> for Authorities {
    type Error = ResourceError;
    fn try_from(value: BTreeSet<String>) -> Result<Self, Self::Error> {
        Authorities::new(value)
    }
}

impl From<Authorities> for BTreeSet<String> {
    fn from(value: Authorities) -> Self {
        value.0
    }
}

/// One entry in a [`crate::version_log::VersionLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub id: uuid::Uuid,
    pub resource_type: ResourceType,
    pub timestamp: DateTime<Utc>,
}

/// A single ingest write: the message offset it arrived at, and the
/// opaque JSON values to append to the projection.
#[derive(Debug, Clone)]
pub struct Batch {
    pub offset: u64,
    pub values: Vec<serde_json::Value>,
}

/// On-disk blob metadata, persisted as `blob_metadata` JSON
/// (`spec.md §6`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMetadata {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    pub authorities: Authorities,
}

/// A handle to a projection version directory. Reading the projection's
/// actual content is delegated to the opaque [`ProjectionStore`]
/// collaborator; this type only adds the identity (authorities, mimetype)
/// `spec.md §3` attaches to it.
#[derive(Clone)]
pub struct ProjectionResource {
    pub(crate) store: Arc<dyn ProjectionStore>,
    pub authorities: Authorities,
}

impl ProjectionResource {
    pub fn new(store: Arc<dyn ProjectionStore>, authorities: Authorities) -> Self {
        Self { store, authorities }
    }

    pub fn mime_type(&self) -> &'static str {
        PROJECTION_MIME_TYPE
    }

    pub async fn append(&self, batch: Batch) -> Result<(), ResourceError> {
        self.store.append(batch).await
    }

    pub async fn record_count(&self) -> Result<u64, ResourceError> {
        self.store.record_count().await
    }

    /// All values appended so far, in offset order. Not part of the
    /// distilled spec's opaque `ProjectionStore` contract, but required
    /// by the default `FlatFileProjectionStore` so tests can observe
    /// ingested content (`spec.md §8`, S3/S6).
    pub async fn values(&self) -> Result<Vec<serde_json::Value>, ResourceError> {
        self.store.read_all().await
    }

    pub async fn quiesce(&self) -> Result<(), ResourceError> {
        self.store.quiesce().await
    }

    pub async fn close(self) -> Result<(), ResourceError> {
        self.store.close().await
    }
}

/// A handle to a blob version directory. `data` is reopened lazily on
/// read rather than held open for the handle's lifetime, so that a
/// `Resource` handed to a reader is a cheap, immutable view.
#[derive(Clone)]
pub struct BlobResource {
    pub data_path: PathBuf,
    pub metadata: BlobMetadata,
}

impl BlobResource {
    /// Reads the entire blob and decodes it as UTF-8. Only valid for
    /// text mimetypes (`spec.md §3`).
    pub async fn as_string(&self) -> Result<String, ResourceError> {
        if !self.metadata.mime_type.starts_with("text/")
            && self.metadata.mime_type != "application/json"
        {
            return Err(ResourceError::ExtractorError(format!(
                "mimetype {} is not text",
                self.metadata.mime_type
            )));
        }
        let bytes = tokio::fs::read(&self.data_path).await?;
        String::from_utf8(bytes)
            .map_err(|e| ResourceError::ExtractorError(format!("blob is not valid utf-8: {e}")))
    }

    pub async fn byte_stream(&self) -> Result<tokio::fs::File, ResourceError> {
        Ok(tokio::fs::File::open(&self.data_path).await?)
    }

    /// No-op: the handle holds no open file descriptor to release.
    pub async fn close(self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// A tagged union of the two resource kinds a reader can receive.
#[derive(Clone)]
pub enum Resource {
    Projection(ProjectionResource),
    Blob(BlobResource),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Projection(_) => ResourceType::Projection,
            Resource::Blob(_) => ResourceType::Blob,
        }
    }
}
