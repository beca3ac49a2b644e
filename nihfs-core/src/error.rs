/// Errors produced anywhere in the VFS: version log mutation, resource
/// open/create, routing, and permission checks.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("not found")]
    NotFound,

    /// A version is referenced (by the log, or by a caller) but its
    /// on-disk state is missing or inconsistent.
    #[error("corrupt version state: {0}")]
    Corrupt(String),

    /// A stream-ref policy violation: appending to a blob, or creating
    /// over an existing, non-replaceable version.
    #[error("illegal write request: {0}")]
    IllegalWriteRequest(String),

    #[error("permission denied")]
    PermissionDenied,

    /// A router-to-manager request exceeded its deadline. The manager's
    /// in-flight operation is not cancelled; only the reply to this
    /// caller is discarded (`spec.md §5`).
    #[error("request timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    IoError(String),

    /// On-disk metadata (e.g. `blob_metadata`) could not be parsed, or a
    /// caller requested a representation the resource can't produce (e.g.
    /// `asString()` on a non-text blob).
    #[error("extractor error: {0}")]
    ExtractorError(String),

    /// A version id is known but was added under a different resource
    /// type than the one now requested.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Aggregates the errors produced by a multi-path batch.
    #[error("{} error(s) occurred", .0.len())]
    Compound(Vec<ResourceError>),
}

impl ResourceError {
    /// Folds a non-empty list of per-path errors into a single error,
    /// collapsing a singleton list to its one element.
    pub fn compound(mut errors: Vec<ResourceError>) -> Option<ResourceError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(ResourceError::Compound(errors)),
        }
    }
}

impl From<std::io::Error> for ResourceError {
    fn from(value: std::io::Error) -> Self {
        ResourceError::IoError(value.to_string())
    }
}

impl From<serde_json::Error> for ResourceError {
    fn from(value: serde_json::Error) -> Self {
        ResourceError::ExtractorError(value.to_string())
    }
}

impl From<tokio::task::JoinError> for ResourceError {
    fn from(value: tokio::task::JoinError) -> Self {
        ResourceError::IoError(value.to_string())
    }
}
