//! Single-writer authority for one path: owns its [`VersionLog`] and open
//! [`Resource`]s, and runs the ingest state machine (`spec.md §4.3`).
//!
//! Each `PathManager` runs as its own `tokio::task`, fed over a bounded
//! `mpsc` mailbox (`spec.md §5`, §9's actor-per-path model) — the loop
//! processes one [`ManagerCmd`] at a time, so awaiting I/O inside a
//! handler never lets a second command jump the queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::VfsConfig;
use crate::error::ResourceError;
use crate::message::{can_create, BlobContent, Clock, EventMessage, JobTracker, StreamRef, VersionSelector, WritePermission};
use crate::path::{Path, PathUtils};
use crate::resource::{Authorities, Batch, Resource, ResourceType, VersionEntry, QUIRREL_SCRIPT_MIME_TYPE};
use crate::resource_builder::ResourceBuilder;
use crate::version_log::VersionLog;

/// Capability a [`PathManager`] uses to enqueue a fire-and-forget
/// cache-invalidation `Archive` message back through the router
/// (`spec.md §4.3`'s `maybeInvalidateCache`; `§9`'s "model the router
/// back-reference as a message-send capability, not shared mutable
/// state"). [`crate::path_router::PathRouter`] is the sole implementor.
pub trait RouterSink: Send + Sync {
    fn archive(&self, path: Path);
}

/// Per-`apiKey` write grants resolved once per ingest batch by the router
/// and handed down with the batch (`spec.md §4.4`).
pub type PermissionTable = HashMap<String, Vec<WritePermission>>;

enum ManagerCmd {
    Ingest {
        messages: Vec<(u64, EventMessage)>,
        permissions: Arc<PermissionTable>,
        reply: oneshot::Sender<Result<(), ResourceError>>,
    },
    Read {
        version: VersionSelector,
        reply: oneshot::Sender<Result<Resource, ResourceError>>,
    },
    CurrentVersion {
        reply: oneshot::Sender<Option<VersionEntry>>,
    },
    Quiesce,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A cheap, cloneable handle to a live [`PathManager`] task's mailbox.
#[derive(Clone)]
pub struct PathManagerHandle {
    tx: mpsc::Sender<ManagerCmd>,
}

impl PathManagerHandle {
    /// Delivers one ingest batch. Messages are applied in the given
    /// order; a failure on one message does not stop the rest from being
    /// attempted (`spec.md §8` invariant 4).
    pub async fn ingest(
        &self,
        messages: Vec<(u64, EventMessage)>,
        permissions: Arc<PermissionTable>,
    ) -> Result<(), ResourceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCmd::Ingest {
                messages,
                permissions,
                reply,
            })
            .await
            .map_err(|_| ResourceError::Corrupt("path manager task is gone".into()))?;
        rx.await
            .map_err(|_| ResourceError::Corrupt("path manager task is gone".into()))?
    }

    pub async fn read(&self, version: VersionSelector) -> Result<Resource, ResourceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCmd::Read { version, reply })
            .await
            .map_err(|_| ResourceError::Corrupt("path manager task is gone".into()))?;
        rx.await
            .map_err(|_| ResourceError::Corrupt("path manager task is gone".into()))?
    }

    pub async fn current_version(&self) -> Option<VersionEntry> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ManagerCmd::CurrentVersion { reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Fire-and-forget quiesce signal, used by the router's LRU eviction
    /// (`spec.md §9`: eviction does not destroy data, only nudges the
    /// manager to flush).
    pub fn quiesce(&self) {
        let _ = self.tx.try_send(ManagerCmd::Quiesce);
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCmd::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct PathManager {
    path: Path,
    path_dir: PathBuf,
    version_log: VersionLog,
    open_resources: HashMap<Uuid, Resource>,
    resource_builder: Arc<ResourceBuilder>,
    clock: Arc<dyn Clock>,
    job_tracker: Arc<dyn JobTracker>,
    router_sink: Arc<dyn RouterSink>,
    quiescence_timeout: std::time::Duration,
    shutdown_timeout: std::time::Duration,
}

/// Spawns a manager task for `path`, opening (or creating) its on-disk
/// state. Returns a handle the router can route requests through.
#[instrument(skip_all, fields(path = %path))]
pub fn spawn(
    path: Path,
    resource_builder: Arc<ResourceBuilder>,
    clock: Arc<dyn Clock>,
    job_tracker: Arc<dyn JobTracker>,
    router_sink: Arc<dyn RouterSink>,
    config: &VfsConfig,
) -> Result<PathManagerHandle, ResourceError> {
    let path_dir = PathUtils::path_dir(&config.base_dir, &path);
    let version_log = VersionLog::open(&path_dir)?;
    if version_log.truncated_on_open > 0 {
        warn!(
            path = %path,
            bytes = version_log.truncated_on_open,
            "recovered path with a truncated version log tail"
        );
    }

    let manager = PathManager {
        path,
        path_dir,
        version_log,
        open_resources: HashMap::new(),
        resource_builder,
        clock,
        job_tracker,
        router_sink,
        quiescence_timeout: config.quiescence_timeout,
        shutdown_timeout: config.shutdown_timeout,
    };

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(manager.run(rx));
    Ok(PathManagerHandle { tx })
}

impl PathManager {
    async fn run(mut self, mut rx: mpsc::Receiver<ManagerCmd>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(ManagerCmd::Shutdown { reply }) => {
                            self.close().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(cmd) => self.handle(cmd).await,
                        None => {
                            self.close().await;
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(self.quiescence_timeout) => {
                    self.quiesce_open_resources().await;
                }
            }
        }
    }

    async fn handle(&mut self, cmd: ManagerCmd) {
        match cmd {
            ManagerCmd::Ingest {
                messages,
                permissions,
                reply,
            } => {
                let result = self.ingest(messages, &permissions).await;
                let _ = reply.send(result);
            }
            ManagerCmd::Read { version, reply } => {
                let result = self.read(version).await;
                let _ = reply.send(result);
            }
            ManagerCmd::CurrentVersion { reply } => {
                let _ = reply.send(self.version_log.current().cloned());
            }
            ManagerCmd::Quiesce => self.quiesce_open_resources().await,
            ManagerCmd::Shutdown { .. } => unreachable!("handled in the run loop"),
        }
    }

    async fn ingest(
        &mut self,
        messages: Vec<(u64, EventMessage)>,
        permissions: &PermissionTable,
    ) -> Result<(), ResourceError> {
        let mut errors = Vec::new();
        for (offset, message) in messages {
            if let Err(e) = self.apply_message(offset, message, permissions).await {
                errors.push(e);
            }
        }
        match ResourceError::compound(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply_message(
        &mut self,
        offset: u64,
        message: EventMessage,
        permissions: &PermissionTable,
    ) -> Result<(), ResourceError> {
        let job_id = match &message {
            EventMessage::Ingest { job_id, .. } => job_id.clone(),
            EventMessage::StoreFile { job_id, .. } => job_id.clone(),
            EventMessage::Archive { job_id, .. } => job_id.clone(),
        };
        let path = message.path().clone();

        let result = self.apply_message_inner(offset, message, permissions).await;

        // Best-effort; errors are logged and swallowed, never surfaced
        // to the ingest caller (`spec.md §7`).
        if result.is_ok() {
            if let Some(job_id) = job_id {
                if let Err(e) = self.job_tracker.report(&job_id, &path).await {
                    warn!(%path, job_id, error = %e, "job tracker report failed");
                }
            }
        }
        result
    }

    async fn apply_message_inner(
        &mut self,
        offset: u64,
        message: EventMessage,
        permissions: &PermissionTable,
    ) -> Result<(), ResourceError> {
        match message {
            EventMessage::Ingest {
                api_key,
                write_as,
                data,
                stream_ref,
                ..
            } => match stream_ref {
                StreamRef::Create { stream_id, terminal } => {
                    let create_if_absent =
                        self.version_log.current().is_none() && !self.version_log.is_completed(&stream_id);
                    self.persist_projection(create_if_absent, offset, write_as, data, stream_id, terminal)
                        .await
                }
                StreamRef::Replace { stream_id, terminal } => {
                    let create_if_absent = !self.version_log.is_completed(&stream_id);
                    self.persist_projection(create_if_absent, offset, write_as, data, stream_id, terminal)
                        .await
                }
                StreamRef::Append => {
                    let stream_id = self
                        .version_log
                        .current()
                        .map(|e| e.id)
                        .unwrap_or_else(Uuid::new_v4);
                    let perms = permissions.get(&api_key).map(Vec::as_slice).unwrap_or(&[]);
                    let create_if_absent = can_create(&self.path, perms, &write_as);
                    self.persist_projection(create_if_absent, offset, write_as, data, stream_id, false)
                        .await?;
                    self.version_log.complete_version(stream_id)?;
                    self.version_log.set_head(stream_id)?;
                    Ok(())
                }
            },
            EventMessage::StoreFile {
                write_as,
                content,
                stream_ref,
                ..
            } => match stream_ref {
                StreamRef::Create { stream_id, terminal } => {
                    let create_if_absent =
                        self.version_log.current().is_none() && !self.version_log.is_completed(&stream_id);
                    self.persist_blob(create_if_absent, write_as, content, stream_id, terminal)
                        .await
                }
                StreamRef::Replace { stream_id, terminal } => {
                    let create_if_absent = !self.version_log.is_completed(&stream_id);
                    self.persist_blob(create_if_absent, write_as, content, stream_id, terminal)
                        .await
                }
                StreamRef::Append => Err(ResourceError::IllegalWriteRequest(
                    "blobs do not support append".into(),
                )),
            },
            EventMessage::Archive { .. } => {
                self.version_log.clear_head()?;
                Ok(())
            }
        }
    }

    async fn persist_projection(
        &mut self,
        create_if_absent: bool,
        offset: u64,
        authorities: Authorities,
        data: Vec<serde_json::Value>,
        stream_id: Uuid,
        terminal: bool,
    ) -> Result<(), ResourceError> {
        if self.version_log.find(&stream_id).is_some() {
            let resource = self.open_resource(stream_id).await?;
            let projection = match resource {
                Resource::Projection(p) => p,
                Resource::Blob(_) => {
                    return Err(ResourceError::IllegalWriteRequest(format!(
                        "version {stream_id} is a blob, not a projection"
                    )))
                }
            };
            projection.append(Batch { offset, values: data }).await?;
            if terminal {
                self.version_log.complete_version(stream_id)?;
                self.version_log.set_head(stream_id)?;
            }
            Ok(())
        } else if create_if_absent {
            self.perform_create_projection(stream_id, authorities, terminal, Batch { offset, values: data })
                .await
        } else {
            Err(ResourceError::IllegalWriteRequest(format!(
                "version {stream_id} does not exist and create is not permitted"
            )))
        }
    }

    async fn persist_blob(
        &mut self,
        create_if_absent: bool,
        authorities: Authorities,
        content: BlobContent,
        stream_id: Uuid,
        terminal: bool,
    ) -> Result<(), ResourceError> {
        if !create_if_absent {
            return Err(ResourceError::IllegalWriteRequest(format!(
                "version {stream_id} already exists and blob replace was not requested"
            )));
        }
        self.perform_create_blob(stream_id, authorities, content, terminal).await
    }

    async fn perform_create_projection(
        &mut self,
        stream_id: Uuid,
        authorities: Authorities,
        terminal: bool,
        seed: Batch,
    ) -> Result<(), ResourceError> {
        self.version_log.add_version(VersionEntry {
            id: stream_id,
            resource_type: ResourceType::Projection,
            timestamp: self.clock.now(),
        })?;
        let version_dir = PathUtils::version_dir(&self.path_dir, &stream_id);
        let resource = self.resource_builder.create_projection(&version_dir, authorities).await?;
        resource.append(seed).await?;
        self.open_resources.insert(stream_id, Resource::Projection(resource));
        if terminal {
            self.version_log.complete_version(stream_id)?;
            self.version_log.set_head(stream_id)?;
        }
        Ok(())
    }

    async fn perform_create_blob(
        &mut self,
        stream_id: Uuid,
        authorities: Authorities,
        content: BlobContent,
        terminal: bool,
    ) -> Result<(), ResourceError> {
        self.version_log.add_version(VersionEntry {
            id: stream_id,
            resource_type: ResourceType::Blob,
            timestamp: self.clock.now(),
        })?;
        let version_dir = PathUtils::version_dir(&self.path_dir, &stream_id);
        let mime_type = content.mime_type;
        let reader = BytesReader::new(content.bytes);
        let resource = self
            .resource_builder
            .create_blob(&version_dir, mime_type.clone(), authorities, reader)
            .await?;
        self.open_resources.insert(stream_id, Resource::Blob(resource));

        if terminal {
            self.version_log.complete_version(stream_id)?;
            self.version_log.set_head(stream_id)?;
            self.maybe_invalidate_cache(&mime_type);
        } else {
            // Open question in `spec.md §9`: no continuation protocol
            // exists for a non-terminal blob create. Accepted and
            // logged, per the spec's explicit instruction not to extend
            // semantics unilaterally.
            warn!(
                path = %self.path,
                version = %stream_id,
                "accepted non-terminal blob create; it will never be completed"
            );
        }
        Ok(())
    }

    fn maybe_invalidate_cache(&self, mime_type: &str) {
        if mime_type != QUIRREL_SCRIPT_MIME_TYPE {
            return;
        }
        self.router_sink.archive(self.path.cached_child());
    }

    async fn read(&mut self, version: VersionSelector) -> Result<Resource, ResourceError> {
        let id = match version {
            VersionSelector::Current => self.version_log.current().map(|e| e.id).ok_or(ResourceError::NotFound)?,
            VersionSelector::Archived(id) => id,
        };
        self.open_resource(id).await
    }

    async fn open_resource(&mut self, id: Uuid) -> Result<Resource, ResourceError> {
        if let Some(resource) = self.open_resources.get(&id) {
            return Ok(resource.clone());
        }
        let entry = self
            .version_log
            .find(&id)
            .cloned()
            .ok_or_else(|| ResourceError::Corrupt(format!("version {id} not present in log")))?;
        let version_dir = PathUtils::version_dir(&self.path_dir, &id);
        let resource = match entry.resource_type {
            ResourceType::Projection => Resource::Projection(self.resource_builder.open_projection(&version_dir).await?),
            ResourceType::Blob => Resource::Blob(self.resource_builder.open_blob(&version_dir).await?),
        };
        self.open_resources.insert(id, resource.clone());
        Ok(resource)
    }

    async fn quiesce_open_resources(&self) {
        for resource in self.open_resources.values() {
            if let Resource::Projection(p) = resource {
                if let Err(e) = p.quiesce().await {
                    warn!(path = %self.path, error = %e, "failed to quiesce projection");
                }
            }
        }
    }

    async fn close(self) {
        let PathManager {
            path,
            open_resources,
            version_log,
            shutdown_timeout,
            ..
        } = self;

        let work = async {
            for (_, resource) in open_resources {
                let result = match resource {
                    Resource::Projection(p) => p.close().await,
                    Resource::Blob(b) => b.close().await,
                };
                if let Err(e) = result {
                    warn!(%path, error = %e, "error closing resource during shutdown");
                }
            }
            if let Err(e) = version_log.close() {
                warn!(%path, error = %e, "error closing version log during shutdown");
            }
        };

        if tokio::time::timeout(shutdown_timeout, work).await.is_err() {
            warn!(%path, "shutdown timed out");
        }
    }
}

/// Adapts an in-memory [`Bytes`] buffer to [`AsyncRead`] so a
/// `StoreFile` message's already-fully-buffered content can be handed to
/// [`ResourceBuilder::create_blob`]'s chunked streaming API without a
/// dependency on a general-purpose byte-stream-to-reader bridge.
struct BytesReader {
    bytes: Bytes,
    pos: usize,
}

impl BytesReader {
    fn new(bytes: Bytes) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl AsyncRead for BytesReader {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let remaining = &this.bytes[this.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}
