use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for a [`crate::vfs::Vfs`] instance.
///
/// There is no config-file or CLI-flag parsing layer here by design: this
/// crate is a library core, and an embedding binary owns turning its own
/// configuration surface (env vars, flags, files) into a `VfsConfig`.
#[derive(Debug, Clone)]
pub struct VfsConfig {
    /// Root directory under which every path's subtree is rooted.
    pub base_dir: PathBuf,

    /// Maximum number of live [`crate::path_manager::PathManager`]s kept
    /// resident at once; the router evicts the least-recently-used one
    /// past this bound.
    pub max_open_paths: usize,

    /// Inactivity duration after which a manager quiesces its open
    /// projections.
    pub quiescence_timeout: Duration,

    /// Upper bound on how long a manager is given to close cleanly.
    pub shutdown_timeout: Duration,

    /// Deadline applied to router-to-manager reads and metadata queries.
    pub projection_read_timeout: Duration,

    /// Deadline applied to router-to-manager ingest batches.
    pub slice_ingest_timeout: Duration,
}

impl VfsConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_open_paths: 1024,
            quiescence_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(10),
            projection_read_timeout: Duration::from_secs(10),
            slice_ingest_timeout: Duration::from_secs(30),
        }
    }
}
