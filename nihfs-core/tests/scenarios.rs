//! End-to-end scenarios S1-S6 from `spec.md §8`, driven through the
//! `Vfs` facade rather than any one component in isolation.

use std::sync::Arc;
use std::time::Duration;

use nihfs_core::{
    AllowAllPermissionsFinder, Authorities, EventMessage, FlatFileProjectionStoreFactory,
    NoopJobTracker, Path, Resource, ResourceError, StreamRef, SystemClock, Vfs, VfsConfig,
    VersionSelector,
};
use serde_json::json;
use uuid::Uuid;

fn vfs(base: &std::path::Path) -> Vfs {
    Vfs::new(
        VfsConfig::new(base),
        Arc::new(FlatFileProjectionStoreFactory),
        Arc::new(SystemClock),
        Arc::new(NoopJobTracker),
        Arc::new(AllowAllPermissionsFinder),
    )
}

fn ingest(path: &Path, stream_ref: StreamRef, offset: u64, data: Vec<serde_json::Value>) -> (u64, EventMessage) {
    (
        offset,
        EventMessage::Ingest {
            api_key: "k".to_string(),
            path: path.clone(),
            write_as: Authorities::new(["acct".to_string()]).unwrap(),
            data,
            job_id: None,
            stream_ref,
        },
    )
}

async fn projection_values(resource: Resource) -> Vec<serde_json::Value> {
    match resource {
        Resource::Projection(p) => p.values().await.unwrap(),
        Resource::Blob(_) => panic!("expected a projection"),
    }
}

/// S1 - Create + terminal.
#[tokio::test]
async fn s1_create_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = vfs(dir.path());
    let path = Path::parse("/a/b");
    let v1 = Uuid::new_v4();

    vfs.write_all_sync(vec![ingest(
        &path,
        StreamRef::Create {
            stream_id: v1,
            terminal: true,
        },
        0,
        vec![json!({"x": 1})],
    )])
    .await
    .unwrap();

    let current = vfs.current_version(&path).await.unwrap();
    assert_eq!(current.id, v1);

    let resource = vfs.read_resource(&path, VersionSelector::Current).await.unwrap();
    assert_eq!(projection_values(resource).await, vec![json!({"x": 1})]);
}

/// S2 - Replace existing: the old head stays readable as an archived
/// version, the new head supersedes it for `Current` reads.
#[tokio::test]
async fn s2_replace_existing() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = vfs(dir.path());
    let path = Path::parse("/a/b");
    let v1 = Uuid::new_v4();
    let v2 = Uuid::new_v4();

    vfs.write_all_sync(vec![ingest(
        &path,
        StreamRef::Create {
            stream_id: v1,
            terminal: true,
        },
        0,
        vec![json!({"x": 1})],
    )])
    .await
    .unwrap();

    vfs.write_all_sync(vec![ingest(
        &path,
        StreamRef::Replace {
            stream_id: v2,
            terminal: true,
        },
        1,
        vec![json!({"x": 2})],
    )])
    .await
    .unwrap();

    let current = vfs.current_version(&path).await.unwrap();
    assert_eq!(current.id, v2);

    let head = vfs.read_resource(&path, VersionSelector::Current).await.unwrap();
    assert_eq!(projection_values(head).await, vec![json!({"x": 2})]);

    let archived = vfs.read_resource(&path, VersionSelector::Archived(v1)).await.unwrap();
    assert_eq!(projection_values(archived).await, vec![json!({"x": 1})]);
}

/// S3 - Append chain: three Append ingests concatenate in offset order
/// into one freshly-created, completed, head version.
#[tokio::test]
async fn s3_append_chain() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = vfs(dir.path());
    let path = Path::parse("/c");

    for (offset, n) in [(10u64, 1), (11, 2), (12, 3)] {
        vfs.write_all_sync(vec![ingest(&path, StreamRef::Append, offset, vec![json!({"n": n})])])
            .await
            .unwrap();
    }

    let current = vfs.current_version(&path).await.unwrap();
    let resource = vfs.read_resource(&path, VersionSelector::Current).await.unwrap();
    assert_eq!(
        projection_values(resource).await,
        vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
    );

    // The version created by the append chain is completed and headed.
    assert_eq!(vfs.current_version(&path).await.unwrap().id, current.id);
}

/// S4 - Illegal blob append: rejected, and no version is ever created for
/// the path (resolving the path's manager does create its empty on-disk
/// directory and version log, same as any other first touch of a path -
/// `spec.md §4.4`'s `PathOp` resolution step - but no version directory
/// under `versions/` comes into existence, and the path never gets a
/// current version).
#[tokio::test]
async fn s4_illegal_blob_append() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = vfs(dir.path());
    let path = Path::parse("/blobs/x");

    let err = vfs
        .write_all_sync(vec![(
            0,
            EventMessage::StoreFile {
                api_key: "k".to_string(),
                path: path.clone(),
                write_as: Authorities::new(["acct".to_string()]).unwrap(),
                content: nihfs_core::BlobContent {
                    mime_type: "text/plain".to_string(),
                    bytes: bytes::Bytes::from_static(b"hi"),
                },
                job_id: None,
                stream_ref: StreamRef::Append,
            },
        )])
        .await
        .unwrap_err();

    assert!(matches!(err, ResourceError::IllegalWriteRequest(_)));
    assert!(vfs.current_version(&path).await.is_none());

    let metadata = vfs.find_path_metadata(&path).unwrap();
    assert_eq!(metadata.resource_type, None);
}

/// S5 - Archive: clears `currentVersion`, `Read(Current)` becomes
/// `NotFound`, but the prior head remains openable as an archived version.
#[tokio::test]
async fn s5_archive() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = vfs(dir.path());
    let path = Path::parse("/a/b");
    let v1 = Uuid::new_v4();
    let v2 = Uuid::new_v4();

    vfs.write_all_sync(vec![ingest(
        &path,
        StreamRef::Create {
            stream_id: v1,
            terminal: true,
        },
        0,
        vec![json!({"x": 1})],
    )])
    .await
    .unwrap();
    vfs.write_all_sync(vec![ingest(
        &path,
        StreamRef::Replace {
            stream_id: v2,
            terminal: true,
        },
        1,
        vec![json!({"x": 2})],
    )])
    .await
    .unwrap();

    vfs.write_all_sync(vec![(
        2,
        EventMessage::Archive {
            api_key: "k".to_string(),
            path: path.clone(),
            job_id: None,
            timestamp: chrono::Utc::now(),
        },
    )])
    .await
    .unwrap();

    assert!(vfs.current_version(&path).await.is_none());
    assert!(matches!(
        vfs.read_resource(&path, VersionSelector::Current).await,
        Err(ResourceError::NotFound)
    ));
    assert!(vfs.read_resource(&path, VersionSelector::Archived(v2)).await.is_ok());
}

/// S6 - Crash recovery: a version added but never completed is invisible
/// to `currentVersion`, yet a subsequent `Replace` against the same
/// stream id is accepted because it was never completed.
///
/// The crashed-mid-write message must itself be a `Replace`, not a
/// `Create`: per `spec.md §4.3`'s state machine, `Create`'s
/// `createIfAbsent` additionally requires `versionLog.current is None`,
/// which is false once `v1` is already head - so a `Create(v3)` against
/// this path would be rejected outright rather than ever reaching disk.
/// `Replace`'s guard is `NOT isCompleted(sid)` alone, matching the
/// "addVersion(v3) then crash before completeVersion(v3)" scenario
/// `spec.md §8` S6 describes.
#[tokio::test]
async fn s6_crash_recovery_then_replace_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let path = Path::parse("/a/b");
    let v1 = Uuid::new_v4();
    let v3 = Uuid::new_v4();

    {
        let vfs = vfs(dir.path());
        vfs.write_all_sync(vec![ingest(
            &path,
            StreamRef::Create {
                stream_id: v1,
                terminal: true,
            },
            0,
            vec![json!({"x": 1})],
        )])
        .await
        .unwrap();

        // Non-terminal: adds v3 and writes its data, but never completes
        // or heads it - simulates a crash before `completeVersion(v3)`.
        vfs.write_all_sync(vec![ingest(
            &path,
            StreamRef::Replace {
                stream_id: v3,
                terminal: false,
            },
            1,
            vec![json!({"x": 3})],
        )])
        .await
        .unwrap();
    }
    // `vfs` (and its router/managers) dropped here, simulating restart.

    let vfs = vfs(dir.path());
    let current = vfs.current_version(&path).await.unwrap();
    assert_eq!(current.id, v1, "pre-crash head must survive restart");

    // v3 exists on disk but is not completed, so Replace(v3, terminal) is
    // accepted: `versionLog.find(v3)` is already present, so this appends
    // to (rather than recreates) v3's projection before completing it.
    vfs.write_all_sync(vec![ingest(
        &path,
        StreamRef::Replace {
            stream_id: v3,
            terminal: true,
        },
        2,
        vec![json!({"x": 4})],
    )])
    .await
    .unwrap();

    let current = vfs.current_version(&path).await.unwrap();
    assert_eq!(current.id, v3);
    let resource = vfs.read_resource(&path, VersionSelector::Current).await.unwrap();
    assert_eq!(
        projection_values(resource).await,
        vec![json!({"x": 3}), json!({"x": 4})],
        "v3's pre-crash seed data survives restart and is followed by the post-restart append"
    );
}

/// Disjoint-path writers are independent of each other regardless of
/// interleaving (`spec.md §8` invariant 3).
#[tokio::test]
async fn concurrent_writers_on_disjoint_paths_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = Arc::new(vfs(dir.path()));

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let vfs = Arc::clone(&vfs);
        handles.push(tokio::spawn(async move {
            let path = Path::from_segments([format!("writer-{i}")]);
            vfs.write_all_sync(vec![ingest(
                &path,
                StreamRef::Create {
                    stream_id: Uuid::new_v4(),
                    terminal: true,
                },
                0,
                vec![json!({"i": i})],
            )])
            .await
            .unwrap();
            path
        }));
    }

    for handle in handles {
        let path = handle.await.unwrap();
        let resource = vfs.read_resource(&path, VersionSelector::Current).await.unwrap();
        let values = projection_values(resource).await;
        assert_eq!(values.len(), 1);
    }
}

/// Blob round-trip (`spec.md §8` item 5): the exact byte sequence comes
/// back out through `readResource`.
#[tokio::test]
async fn blob_round_trip_through_vfs() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = vfs(dir.path());
    let path = Path::parse("/blobs/readme");
    let payload = b"hello, nihfs".to_vec();

    vfs.write_all_sync(vec![(
        0,
        EventMessage::StoreFile {
            api_key: "k".to_string(),
            path: path.clone(),
            write_as: Authorities::new(["acct".to_string()]).unwrap(),
            content: nihfs_core::BlobContent {
                mime_type: "text/plain".to_string(),
                bytes: bytes::Bytes::from(payload.clone()),
            },
            job_id: None,
            stream_ref: StreamRef::Create {
                stream_id: Uuid::new_v4(),
                terminal: true,
            },
        },
    )])
    .await
    .unwrap();

    let resource = vfs.read_resource(&path, VersionSelector::Current).await.unwrap();
    let Resource::Blob(blob) = resource else {
        panic!("expected a blob")
    };
    assert_eq!(blob.as_string().await.unwrap(), "hello, nihfs");
}

/// A slow external collaborator inside the manager's own processing makes
/// the *caller's* deadline expire, but the manager is never preempted: its
/// write still lands durably, and the late reply is simply discarded
/// (`spec.md §5`: "deadline exceeded surfaces a timeout error to the
/// client; the underlying manager operation continues to completion").
struct SlowJobTracker {
    delay: Duration,
}

#[async_trait::async_trait]
impl nihfs_core::JobTracker for SlowJobTracker {
    async fn report(&self, _job_id: &str, _path: &Path) -> Result<(), ResourceError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[tokio::test]
async fn write_timeout_does_not_prevent_the_write_from_landing() {
    let dir = tempfile::tempdir().unwrap();
    let config = {
        let mut c = VfsConfig::new(dir.path());
        c.slice_ingest_timeout = Duration::from_millis(20);
        c
    };
    let vfs = Vfs::new(
        config,
        Arc::new(FlatFileProjectionStoreFactory),
        Arc::new(SystemClock),
        Arc::new(SlowJobTracker {
            delay: Duration::from_millis(200),
        }),
        Arc::new(AllowAllPermissionsFinder),
    );
    let path = Path::parse("/a/b");

    let err = vfs
        .write_all_sync(vec![(
            0,
            EventMessage::Ingest {
                api_key: "k".to_string(),
                path: path.clone(),
                write_as: Authorities::new(["acct".to_string()]).unwrap(),
                data: vec![json!({"x": 1})],
                job_id: Some("job-1".to_string()),
                stream_ref: StreamRef::Create {
                    stream_id: Uuid::new_v4(),
                    terminal: true,
                },
            },
        )])
        .await
        .unwrap_err();
    assert!(matches!(err, ResourceError::Timeout));

    // Give the manager task time to finish the slow job-tracker call in
    // the background, then confirm the write actually landed.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(vfs.current_version(&path).await.is_some());
}
