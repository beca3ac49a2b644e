//! Client-facing facade over a [`PathRouter`] (`spec.md §4.5`).

use std::sync::Arc;

use tracing::warn;

use crate::config::VfsConfig;
use crate::error::ResourceError;
use crate::message::{Clock, EventMessage, JobTracker, PermissionsFinder, VersionSelector};
use crate::path::{Path, PathMetadata};
use crate::path_router::PathRouter;
use crate::projection_store::ProjectionStoreFactory;
use crate::resource::{Resource, VersionEntry};
use crate::resource_builder::ResourceBuilder;

pub struct Vfs {
    router: Arc<PathRouter>,
    config: VfsConfig,
}

impl Vfs {
    pub fn new(
        config: VfsConfig,
        projection_store_factory: Arc<dyn ProjectionStoreFactory>,
        clock: Arc<dyn Clock>,
        job_tracker: Arc<dyn JobTracker>,
        permissions_finder: Arc<dyn PermissionsFinder>,
    ) -> Vfs {
        let resource_builder = Arc::new(ResourceBuilder::new(projection_store_factory));
        let router = PathRouter::new(config.clone(), resource_builder, clock, job_tracker, permissions_finder);
        Vfs { router, config }
    }

    /// Fire-and-forget ingest: enqueues the batch and returns once it has
    /// been handed to the router, without waiting for any manager's
    /// response (`spec.md §4.5`).
    pub fn write_all(&self, data: Vec<(u64, EventMessage)>) {
        let router = Arc::clone(&self.router);
        let deadline = self.config.slice_ingest_timeout;
        tokio::spawn(async move {
            if let Err(e) = router.ingest_data(data, deadline).await {
                warn!(error = %e, "fire-and-forget writeAll failed");
            }
        });
    }

    /// Awaits every per-path `WriteResult`, consolidating all errors
    /// rather than short-circuiting on the first (`spec.md §4.5`, §7).
    pub async fn write_all_sync(&self, data: Vec<(u64, EventMessage)>) -> Result<(), ResourceError> {
        self.router.ingest_data(data, self.config.slice_ingest_timeout).await
    }

    pub async fn read_resource(&self, path: &Path, version: VersionSelector) -> Result<Resource, ResourceError> {
        self.router.read(path, version, self.config.projection_read_timeout).await
    }

    pub fn find_direct_children(&self, path: &Path) -> Result<Vec<PathMetadata>, ResourceError> {
        self.router.find_children(path)
    }

    pub fn find_path_metadata(&self, path: &Path) -> Result<PathMetadata, ResourceError> {
        self.router.find_path_metadata(path)
    }

    pub async fn current_version(&self, path: &Path) -> Option<VersionEntry> {
        self.router.current_version(path, self.config.projection_read_timeout).await
    }
}
