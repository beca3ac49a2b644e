//! Ingest event messages, stream-ref semantics, and the pluggable
//! external collaborators (`spec.md §3`, §1's "out of scope" list):
//! permission lookup, job tracking, and the clock.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::ResourceError;
use crate::path::Path;
use crate::resource::Authorities;

/// How an ingest message's data relates to the path's version history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRef {
    /// Establish a new version, optionally closing it in this message.
    Create { stream_id: uuid::Uuid, terminal: bool },
    /// Supersede any current head with this new version.
    Replace { stream_id: uuid::Uuid, terminal: bool },
    /// Append to the current head version, or start one if none exists.
    Append,
}

/// Raw byte content attached to a `StoreFile` message.
#[derive(Debug, Clone)]
pub struct BlobContent {
    pub mime_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub enum EventMessage {
    Ingest {
        api_key: String,
        path: Path,
        write_as: Authorities,
        data: Vec<serde_json::Value>,
        job_id: Option<String>,
        stream_ref: StreamRef,
    },
    StoreFile {
        api_key: String,
        path: Path,
        write_as: Authorities,
        content: BlobContent,
        job_id: Option<String>,
        stream_ref: StreamRef,
    },
    Archive {
        api_key: String,
        path: Path,
        job_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl EventMessage {
    pub fn path(&self) -> &Path {
        match self {
            EventMessage::Ingest { path, .. } => path,
            EventMessage::StoreFile { path, .. } => path,
            EventMessage::Archive { path, .. } => path,
        }
    }

    pub fn api_key(&self) -> &str {
        match self {
            EventMessage::Ingest { api_key, .. } => api_key,
            EventMessage::StoreFile { api_key, .. } => api_key,
            EventMessage::Archive { api_key, .. } => api_key,
        }
    }
}

/// A grant to write under any path equal-to-or-below `path`, producing
/// under `authorities`.
#[derive(Debug, Clone)]
pub struct WritePermission {
    pub path: Path,
    pub authorities: Authorities,
}

/// Returns true if some permission in `perms` covers writing to `path` as
/// every account in `write_as`.
///
/// Resolves `spec.md §9`'s open question on Create/Replace permission
/// enforcement by defining the check once here; `spec.md §4.3`'s state
/// machine only actually calls this on `Append`, per the source behavior
/// that section explicitly preserves (see `DESIGN.md`).
pub fn can_create(path: &Path, perms: &[WritePermission], write_as: &Authorities) -> bool {
    perms.iter().any(|perm| {
        perm.path.is_prefix_of(path) && write_as.iter().all(|acct| perm.authorities.iter().any(|a| a == acct))
    })
}

/// Resolves an `apiKey` to the set of [`WritePermission`]s it carries.
/// Results are cached by the caller (`spec.md §4.4`: "single call per key
/// per batch; cached by `PermissionsFinder`").
#[async_trait]
pub trait PermissionsFinder: Send + Sync {
    async fn find_permissions(&self, api_key: &str) -> Result<Vec<WritePermission>, ResourceError>;
}

/// Grants every api key unrestricted write access everywhere. Useful for
/// tests and for embedding systems that enforce permissions upstream of
/// this crate.
#[derive(Debug, Clone, Default)]
pub struct AllowAllPermissionsFinder;

#[async_trait]
impl PermissionsFinder for AllowAllPermissionsFinder {
    async fn find_permissions(&self, _api_key: &str) -> Result<Vec<WritePermission>, ResourceError> {
        Ok(vec![WritePermission {
            path: Path::root(),
            authorities: Authorities::new(["*".to_string()]).expect("non-empty"),
        }])
    }
}

/// Best-effort job-progress tracking keyed by `EventMessage::job_id`.
/// Errors from this collaborator are logged and swallowed, never surfaced
/// to the ingest caller (`spec.md §7`).
#[async_trait]
pub trait JobTracker: Send + Sync {
    async fn report(&self, job_id: &str, path: &Path) -> Result<(), ResourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopJobTracker;

#[async_trait]
impl JobTracker for NoopJobTracker {
    async fn report(&self, _job_id: &str, _path: &Path) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Supplies the wall-clock timestamp stamped onto new [`crate::resource::VersionEntry`]s.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Which version a read resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Current,
    Archived(uuid::Uuid),
}
