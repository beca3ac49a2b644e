//! `nihfs-core`: a versioned, path-addressed virtual file system core.
//!
//! Mediates ingest, storage, and retrieval of two resource kinds — a
//! columnar append-only projection and an opaque binary blob — behind a
//! single logical path identity, maintaining a durable per-path version
//! log and enforcing per-path write exclusivity. The projection engine,
//! permission lookup, job tracking, and clock are pluggable via traits;
//! this crate owns routing, versioning, per-path lifecycle, and the
//! ingest-event state machine.

pub mod config;
pub mod error;
pub mod message;
pub mod path;
pub mod path_manager;
pub mod path_router;
pub mod projection_store;
pub mod resource;
pub mod resource_builder;
pub mod version_log;
pub mod vfs;

pub use config::VfsConfig;
pub use error::ResourceError;
pub use message::{
    AllowAllPermissionsFinder, BlobContent, Clock, EventMessage, JobTracker, NoopJobTracker,
    PermissionsFinder, StreamRef, SystemClock, VersionSelector, WritePermission,
};
pub use path::{Path, PathMetadata};
pub use path_router::PathRouter;
pub use projection_store::{FlatFileProjectionStoreFactory, ProjectionStore, ProjectionStoreFactory};
pub use resource::{
    Authorities, Batch, BlobMetadata, BlobResource, ProjectionResource, Resource, ResourceType,
    VersionEntry, PROJECTION_MIME_TYPE, QUIRREL_SCRIPT_MIME_TYPE,
};
pub use resource_builder::ResourceBuilder;
pub use vfs::Vfs;
