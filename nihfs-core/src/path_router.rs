//! Maintains the bounded set of live [`PathManager`](crate::path_manager)s
//! and demultiplexes incoming requests onto them (`spec.md §4.4`).

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::VfsConfig;
use crate::error::ResourceError;
use crate::message::{Clock, EventMessage, JobTracker, PermissionsFinder, VersionSelector};
use crate::path::{Path, PathMetadata, PathUtils};
use crate::path_manager::{self, PathManagerHandle, PermissionTable, RouterSink};
use crate::resource::{Resource, ResourceType};
use crate::resource_builder::ResourceBuilder;
use crate::version_log::VersionLog;

/// Routes client operations to per-path managers, creating them on first
/// use and evicting the least-recently-used one once `max_open_paths` is
/// exceeded. Always held behind an `Arc`, since managers it spawns hold a
/// back-reference to it (as a [`RouterSink`]) for cache-invalidation
/// sends (`spec.md §9`'s "cyclic references... model as a message-send
/// capability").
pub struct PathRouter {
    config: VfsConfig,
    resource_builder: Arc<ResourceBuilder>,
    clock: Arc<dyn Clock>,
    job_tracker: Arc<dyn JobTracker>,
    permissions_finder: Arc<dyn PermissionsFinder>,
    managers: Mutex<LruCache<Path, PathManagerHandle>>,
    self_ref: Weak<PathRouter>,
}

impl PathRouter {
    pub fn new(
        config: VfsConfig,
        resource_builder: Arc<ResourceBuilder>,
        clock: Arc<dyn Clock>,
        job_tracker: Arc<dyn JobTracker>,
        permissions_finder: Arc<dyn PermissionsFinder>,
    ) -> Arc<PathRouter> {
        let cap = NonZeroUsize::new(config.max_open_paths).unwrap_or(NonZeroUsize::new(1).unwrap());
        Arc::new_cyclic(|self_ref| PathRouter {
            config,
            resource_builder,
            clock,
            job_tracker,
            permissions_finder,
            managers: Mutex::new(LruCache::new(cap)),
            self_ref: self_ref.clone(),
        })
    }

    /// The `Arc<Self>` a manager spawned by this router needs to hold a
    /// back-reference for cache-invalidation sends. Always resolves,
    /// since a router is only ever reachable through the `Arc` that owns
    /// this `Weak`.
    fn arc_self(&self) -> Arc<PathRouter> {
        self.self_ref
            .upgrade()
            .expect("PathRouter methods are only called through an owning Arc")
    }

    /// Resolves the live manager for `path`, spawning one (and creating
    /// its on-disk directory) on first use. The LRU touch and any
    /// resulting eviction happen while holding the manager-map lock only
    /// briefly; the actual request against the resolved handle runs
    /// outside it, so paths never serialize against one another here.
    pub async fn resolve(&self, path: &Path) -> Result<PathManagerHandle, ResourceError> {
        let mut managers = self.managers.lock().await;
        if let Some(handle) = managers.get(path) {
            return Ok(handle.clone());
        }

        let handle = path_manager::spawn(
            path.clone(),
            Arc::clone(&self.resource_builder),
            Arc::clone(&self.clock),
            Arc::clone(&self.job_tracker),
            self.arc_self() as Arc<dyn RouterSink>,
            &self.config,
        )?;

        if let Some((evicted_path, evicted_handle)) = managers.push(path.clone(), handle.clone()) {
            if evicted_path != *path {
                evicted_handle.quiesce();
            }
        }
        Ok(handle)
    }

    /// One-level child listing, relative to `path`. Does not materialize
    /// managers (`spec.md §4.4`).
    pub fn find_children(&self, path: &Path) -> Result<Vec<PathMetadata>, ResourceError> {
        let names = PathUtils::find_children(&self.config.base_dir, path)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let absolute = path.join(name.clone());
            let child_dir = PathUtils::path_dir(&self.config.base_dir, &absolute);
            let resource_type = self.resource_type_at(&child_dir);
            out.push(PathMetadata {
                path: Path::from_segments([name]),
                resource_type,
            });
        }
        Ok(out)
    }

    /// Metadata for exactly one node. Does not materialize a manager:
    /// existence is checked directly against the filesystem, and the
    /// resource type (if any) is derived from the current version
    /// directory's blob/projection marker.
    pub fn find_path_metadata(&self, path: &Path) -> Result<PathMetadata, ResourceError> {
        let path_dir = PathUtils::path_dir(&self.config.base_dir, path);
        if !path_dir.is_dir() {
            return Err(ResourceError::NotFound);
        }
        let resource_type = self.resource_type_at(&path_dir);
        Ok(PathMetadata {
            path: path.clone(),
            resource_type,
        })
    }

    /// Derives a path's current resource type for discovery, without ever
    /// opening its version log for writing: a live `PathManager` may
    /// already own that log, and `VersionLog::open` creates, appends to,
    /// and can truncate it (`spec.md §5`'s "The router reads baseDir for
    /// discovery (read-only, crash-safe...)"). Instead, the current
    /// version id is read via [`VersionLog::peek_current_head`] (strictly
    /// read-only), and the type is derived by inspecting that version's
    /// directory for a blob or projection marker (`spec.md §4.6`).
    fn resource_type_at(&self, path_dir: &std::path::Path) -> Option<ResourceType> {
        let head_id = VersionLog::peek_current_head(path_dir)?;
        let version_dir = PathUtils::version_dir(path_dir, &head_id);
        if self.resource_builder.is_blob(&version_dir) {
            Some(ResourceType::Blob)
        } else if self.resource_builder.is_projection(&version_dir) {
            Some(ResourceType::Projection)
        } else {
            None
        }
    }

    pub async fn read(self: &Arc<Self>, path: &Path, version: VersionSelector, deadline: Duration) -> Result<Resource, ResourceError> {
        let handle = self.resolve(path).await?;
        tokio::time::timeout(deadline, handle.read(version))
            .await
            .map_err(|_| ResourceError::Timeout)?
    }

    pub async fn current_version(
        self: &Arc<Self>,
        path: &Path,
        deadline: Duration,
    ) -> Option<crate::resource::VersionEntry> {
        let handle = self.resolve(path).await.ok()?;
        tokio::time::timeout(deadline, handle.current_version()).await.ok().flatten()
    }

    /// Groups `messages` by path, resolves write permissions for each
    /// distinct `apiKey` exactly once (`spec.md §4.4`), and dispatches one
    /// ingest batch per path concurrently.
    pub async fn ingest_data(
        self: &Arc<Self>,
        messages: Vec<(u64, EventMessage)>,
        deadline: Duration,
    ) -> Result<(), ResourceError> {
        let mut by_path: HashMap<Path, Vec<(u64, EventMessage)>> = HashMap::new();
        for (offset, message) in messages {
            by_path.entry(message.path().clone()).or_default().push((offset, message));
        }

        let mut api_keys = BTreeSet::new();
        for batch in by_path.values() {
            for (_, message) in batch {
                api_keys.insert(message.api_key().to_string());
            }
        }

        let mut permissions = PermissionTable::new();
        for api_key in api_keys {
            let perms = self.permissions_finder.find_permissions(&api_key).await?;
            permissions.insert(api_key, perms);
        }
        let permissions = Arc::new(permissions);

        let pending = by_path.into_iter().map(|(path, batch)| {
            let permissions = Arc::clone(&permissions);
            let this = Arc::clone(self);
            async move {
                let handle = this.resolve(&path).await?;
                tokio::time::timeout(deadline, handle.ingest(batch, permissions))
                    .await
                    .map_err(|_| ResourceError::Timeout)?
            }
        });

        let results = futures::future::join_all(pending).await;
        let errors: Vec<ResourceError> = results.into_iter().filter_map(Result::err).collect();
        match ResourceError::compound(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl RouterSink for PathRouter {
    /// Enqueues an `Archive` message for `path`, fire-and-forget
    /// (`spec.md §4.3`'s `maybeInvalidateCache`). Errors are logged and
    /// swallowed (`spec.md §7`).
    fn archive(&self, path: Path) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let message = EventMessage::Archive {
                api_key: "cache-invalidation".to_string(),
                path: path.clone(),
                job_id: None,
                timestamp: this.clock.now(),
            };
            let deadline = this.config.slice_ingest_timeout;
            if let Err(e) = this.ingest_data(vec![(0, message)], deadline).await {
                warn!(%path, error = %e, "cache-invalidation archive failed");
            }
        });
    }
}
