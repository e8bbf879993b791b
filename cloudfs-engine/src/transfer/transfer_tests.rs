use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cloudfs_core::memory::ROOT_ID;
use cloudfs_core::{ApiErrorClass, EntryKind, MemoryRemote, RemoteCall, RemoteEntry};
use tempfile::{TempDir, tempdir};
use tokio::sync::{Notify, Semaphore};

use super::*;
use crate::meta::NodeKind;

const CONTENT: &[u8] = b"0123456789abcdef!";

struct Fixture {
    _dir: TempDir,
    remote: Arc<MemoryRemote>,
    meta: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    manager: Arc<TransferManager>,
    shutdown: CancellationToken,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.retry_attempts = 3;
        config.backoff_base = Duration::from_millis(1);
        config.backoff_max = Duration::from_millis(4);
        config.transfer_workers = 2;
        let remote = Arc::new(MemoryRemote::new());
        let meta = Arc::new(MetadataStore::new(ROOT_ID, Journal::disabled()));
        let cache = Arc::new(ContentCache::new(
            config.objects_dir(),
            1 << 20,
            4,
            meta.clone(),
            Journal::disabled(),
        ));
        let manager = Arc::new(TransferManager::new(
            remote.clone(),
            cache.clone(),
            meta.clone(),
            Journal::disabled(),
            &config,
        ));
        Self {
            _dir: dir,
            remote,
            meta,
            cache,
            manager,
            shutdown: CancellationToken::new(),
        }
    }

    fn start(&self) {
        self.manager.start(self.shutdown.clone());
    }

    /// Mirrors a remote file into the metadata store.
    async fn remote_file(&self, name: &str, data: &'static [u8]) -> (NodeId, String) {
        let id = self.remote.insert_file(ROOT_ID, name, Bytes::from_static(data));
        let entry = self
            .remote
            .list_children(ROOT_ID)
            .await
            .unwrap()
            .into_iter()
            .find(|entry| entry.id == id)
            .unwrap();
        let node = self.meta.insert_remote(NodeId::ROOT, &entry).unwrap();
        (node.id, id)
    }

    async fn read_all(&self, node: NodeId) -> Vec<u8> {
        match self.cache.read(node, 0, 1 << 20).await.unwrap() {
            CacheRead::Hit(bytes) => bytes.to_vec(),
            CacheRead::Miss => panic!("{node} is not resident"),
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Holds each range read, after its bytes were fetched, until released.
struct GatedRemote {
    inner: Arc<MemoryRemote>,
    fetched: Notify,
    release: Semaphore,
}

impl GatedRemote {
    fn new(inner: Arc<MemoryRemote>) -> Self {
        Self {
            inner,
            fetched: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn list_children(&self, dir_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.inner.list_children(dir_id).await
    }

    async fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Bytes, RemoteError> {
        let data = self.inner.get_range(id, offset, length).await?;
        self.fetched.notify_one();
        self.release.acquire().await.unwrap().forget();
        Ok(data)
    }

    async fn begin_upload(&self, target: &UploadTarget, size: u64) -> Result<String, RemoteError> {
        self.inner.begin_upload(target, size).await
    }

    async fn upload_chunk(&self, session: &str, offset: u64, data: Bytes) -> Result<(), RemoteError> {
        self.inner.upload_chunk(session, offset, data).await
    }

    async fn finish_upload(&self, session: &str) -> Result<RemoteEntry, RemoteError> {
        self.inner.finish_upload(session).await
    }

    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<RemoteEntry, RemoteError> {
        self.inner.create_dir(parent_id, name).await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.inner.delete(id).await
    }

    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        new_parent: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError> {
        self.inner.rename(id, new_name, new_parent).await
    }
}

fn range_offsets(remote: &MemoryRemote) -> Vec<u64> {
    remote
        .range_log()
        .into_iter()
        .map(|(_, offset, _)| offset)
        .collect()
}

#[tokio::test]
async fn download_fills_cache_chunk_by_chunk() {
    let fx = Fixture::new();
    let mut events = fx.manager.take_events().unwrap();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;
    fx.start();

    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();
    let status = handle.wait().await;

    assert_eq!(status.state, JobState::Done);
    assert_eq!(status.fraction(), 1.0);
    assert_eq!(fx.read_all(node).await, CONTENT);
    assert_eq!(range_offsets(&fx.remote), vec![0, 4, 8, 12, 16]);
    assert!(matches!(
        events.recv().await,
        Some(TransferEvent::Downloaded { node: done }) if done == node
    ));
    assert!(fx.manager.jobs().is_empty());
}

#[tokio::test]
async fn duplicate_submit_returns_the_active_job() {
    let fx = Fixture::new();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;

    fx.manager.submit(JobRequest::Download { node }).unwrap();
    fx.manager.submit(JobRequest::Download { node }).unwrap();
    assert_eq!(fx.manager.active(), 1);

    fx.start();
    let mut handle = fx.manager.handle(node, Direction::Download).unwrap();
    assert_eq!(handle.wait().await.state, JobState::Done);
    assert_eq!(fx.remote.calls(RemoteCall::GetRange), 5);
}

#[tokio::test]
async fn resident_chunks_are_not_fetched_again() {
    let fx = Fixture::new();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;
    fx.cache
        .store_chunk(node, 0, Bytes::from_static(&CONTENT[..4]))
        .await
        .unwrap();
    fx.cache
        .store_chunk(node, 4, Bytes::from_static(&CONTENT[4..8]))
        .await
        .unwrap();
    fx.start();

    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();

    assert_eq!(handle.wait().await.state, JobState::Done);
    assert_eq!(range_offsets(&fx.remote), vec![8, 12, 16]);
    assert_eq!(fx.read_all(node).await, CONTENT);
}

#[tokio::test]
async fn interrupted_download_resumes_with_remaining_chunks() {
    let fx = Fixture::new();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;
    fx.remote
        .fail_after(RemoteCall::GetRange, 2, ApiErrorClass::Permanent);
    fx.start();

    let mut first = fx.manager.submit(JobRequest::Download { node }).unwrap();
    let status = first.wait().await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failure.unwrap().kind, ErrorKind::Permanent);
    assert_eq!(fx.manager.jobs()[0].done_chunks, vec![0, 1]);

    let mut second = fx.manager.submit(JobRequest::Download { node }).unwrap();
    assert_eq!(second.wait().await.state, JobState::Done);

    assert_eq!(range_offsets(&fx.remote), vec![0, 4, 8, 12, 16]);
    assert_eq!(fx.read_all(node).await, CONTENT);
}

#[tokio::test]
async fn transient_chunk_failures_are_retried() {
    let fx = Fixture::new();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;
    fx.remote
        .fail_next(RemoteCall::GetRange, 2, ApiErrorClass::Transient);
    fx.start();

    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();

    assert_eq!(handle.wait().await.state, JobState::Done);
    assert_eq!(fx.remote.calls(RemoteCall::GetRange), 7);
    assert_eq!(fx.read_all(node).await, CONTENT);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_and_report_it() {
    let fx = Fixture::new();
    let mut events = fx.manager.take_events().unwrap();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;
    fx.remote
        .fail_next(RemoteCall::GetRange, 10, ApiErrorClass::Transient);
    fx.start();

    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();
    let status = handle.wait().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(fx.remote.calls(RemoteCall::GetRange), 3);
    match events.recv().await {
        Some(TransferEvent::Failed {
            node: failed,
            direction,
            failure,
            ..
        }) => {
            assert_eq!(failed, node);
            assert_eq!(direction, Direction::Download);
            assert_eq!(failure.kind, ErrorKind::Transient);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let record = &fx.manager.jobs()[0];
    assert_eq!(record.retries, 2);
    assert!(record.last_error.is_some());
}

#[tokio::test]
async fn checksum_mismatch_discards_downloaded_chunks() {
    let fx = Fixture::new();
    let id = fx
        .remote
        .insert_file(ROOT_ID, "bad.bin", Bytes::from_static(CONTENT));
    let entry = RemoteEntry {
        id,
        name: "bad.bin".into(),
        kind: EntryKind::File,
        size: CONTENT.len() as u64,
        mtime: 1,
        checksum: Some("00000000000000000000000000000000".into()),
    };
    let node = fx.meta.insert_remote(NodeId::ROOT, &entry).unwrap().id;
    fx.start();

    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();
    let status = handle.wait().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failure.unwrap().kind, ErrorKind::Transient);
    assert_eq!(
        fx.cache.read(node, 0, 4).await.unwrap(),
        CacheRead::Miss
    );
    assert!(fx.manager.jobs()[0].done_chunks.is_empty());
}

#[tokio::test]
async fn download_requires_a_remote_copy() {
    let fx = Fixture::new();
    let node = fx.meta.create("/", "local.txt", NodeKind::File).await.unwrap();

    let err = fx
        .manager
        .submit(JobRequest::Download { node: node.id })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn cancelled_queued_job_pauses_and_resumes() {
    let fx = Fixture::new();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;
    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();

    assert!(fx.manager.cancel(node, Direction::Download));
    assert_eq!(handle.wait().await.state, JobState::Paused);
    assert_eq!(fx.manager.active(), 0);

    fx.start();
    let mut resumed = fx.manager.submit(JobRequest::Download { node }).unwrap();
    assert_eq!(resumed.wait().await.state, JobState::Done);
    assert_eq!(fx.read_all(node).await, CONTENT);
}

#[tokio::test]
async fn cancel_all_stops_running_transfers() {
    let fx = Fixture::new();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;
    fx.remote.set_range_delay(Some(Duration::from_millis(50)));
    fx.start();

    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();
    while handle.status().state != JobState::Running {
        assert!(handle.changed().await);
    }
    fx.manager.cancel_all();

    let status = handle.wait().await;
    assert_eq!(status.state, JobState::Paused);
    assert!(status.done < status.total);
    let record = &fx.manager.jobs()[0];
    assert_eq!(record.state, JobState::Paused);
}

#[tokio::test]
async fn upload_streams_cached_content_through_a_session() {
    let fx = Fixture::new();
    let mut events = fx.manager.take_events().unwrap();
    let node = fx.meta.create("/", "up.txt", NodeKind::File).await.unwrap();
    fx.cache.write(node.id, 0, b"payload-data").await.unwrap();
    fx.start();

    let mut handle = fx
        .manager
        .submit(JobRequest::Upload {
            node: node.id,
            target: UploadTarget::Create {
                parent_id: ROOT_ID.into(),
                name: "up.txt".into(),
            },
        })
        .unwrap();

    assert_eq!(handle.wait().await.state, JobState::Done);
    let Some(TransferEvent::Uploaded {
        node: uploaded,
        entry,
        generation,
    }) = events.recv().await
    else {
        panic!("expected an upload event");
    };
    assert_eq!(uploaded, node.id);
    assert_eq!(generation, 1);
    assert_eq!(entry.size, 12);
    assert_eq!(
        fx.remote.content(&entry.id).unwrap(),
        Bytes::from_static(b"payload-data")
    );
    let offsets: Vec<u64> = fx.remote.chunk_log().into_iter().map(|(_, at)| at).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
}

#[tokio::test]
async fn failed_upload_resumes_its_session() {
    let fx = Fixture::new();
    let node = fx.meta.create("/", "up.txt", NodeKind::File).await.unwrap();
    fx.cache.write(node.id, 0, b"payload-data").await.unwrap();
    let target = UploadTarget::Create {
        parent_id: ROOT_ID.into(),
        name: "up.txt".into(),
    };
    fx.start();

    fx.remote
        .fail_after(RemoteCall::UploadChunk, 1, ApiErrorClass::Permanent);
    let mut first = fx
        .manager
        .submit(JobRequest::Upload {
            node: node.id,
            target: target.clone(),
        })
        .unwrap();
    assert_eq!(first.wait().await.state, JobState::Failed);
    assert_eq!(fx.manager.jobs()[0].done_chunks, vec![0]);

    let mut second = fx
        .manager
        .submit(JobRequest::Upload {
            node: node.id,
            target,
        })
        .unwrap();
    assert_eq!(second.wait().await.state, JobState::Done);
    assert_eq!(fx.remote.calls(RemoteCall::BeginUpload), 1);
    let offsets: Vec<u64> = fx.remote.chunk_log().into_iter().map(|(_, at)| at).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
}

#[tokio::test]
async fn discard_forgets_jobs_of_removed_nodes() {
    let fx = Fixture::new();
    let (node, _) = fx.remote_file("a.bin", CONTENT).await;
    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();

    fx.manager.discard(node);

    assert!(fx.manager.jobs().is_empty());
    assert!(fx.manager.handle(node, Direction::Download).is_none());
    assert_eq!(handle.wait().await.state, JobState::Paused);
    fx.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.remote.calls(RemoteCall::GetRange), 0);
}

#[tokio::test]
async fn restored_jobs_come_back_paused() {
    let fx = Fixture::new();
    let (node, remote_id) = fx.remote_file("a.bin", CONTENT).await;
    let current = fx.meta.require(node).unwrap();
    fx.cache
        .store_chunk(node, 0, Bytes::from_static(&CONTENT[..4]))
        .await
        .unwrap();
    fx.manager.restore(vec![JobRecord {
        node,
        direction: Direction::Download,
        state: JobState::Running,
        remote_id: Some(remote_id),
        target: None,
        session: None,
        fingerprint: format!(
            "md5:{}:size:{}",
            current.checksum.unwrap(),
            CONTENT.len()
        ),
        total: CONTENT.len() as u64,
        chunk_size: 4,
        done_chunks: vec![0],
        retries: 1,
        generation: 0,
        last_error: None,
    }]);

    assert_eq!(fx.manager.jobs()[0].state, JobState::Paused);
    assert_eq!(fx.manager.active(), 0);

    fx.start();
    let mut handle = fx.manager.submit(JobRequest::Download { node }).unwrap();
    assert_eq!(handle.wait().await.state, JobState::Done);
    assert_eq!(range_offsets(&fx.remote), vec![4, 8, 12, 16]);
}

#[tokio::test]
async fn bytes_fetched_before_a_content_change_are_not_kept() {
    let fx = Fixture::new();
    let (node, remote_id) = fx.remote_file("f.bin", b"OLD0OLD1").await;
    let gated = Arc::new(GatedRemote::new(fx.remote.clone()));
    let mut config = EngineConfig::new(fx._dir.path());
    config.transfer_workers = 1;
    let manager = Arc::new(TransferManager::new(
        gated.clone(),
        fx.cache.clone(),
        fx.meta.clone(),
        Journal::disabled(),
        &config,
    ));
    manager.start(fx.shutdown.clone());

    let mut first = manager.submit(JobRequest::Download { node }).unwrap();
    gated.fetched.notified().await;

    // The remote content changes while the first chunk is in hand.
    fx.remote.update_file(&remote_id, Bytes::from_static(b"NEW0NEW1"));
    let entry = fx
        .remote
        .list_children(ROOT_ID)
        .await
        .unwrap()
        .into_iter()
        .find(|entry| entry.id == remote_id)
        .unwrap();
    fx.meta.apply_remote_snapshot_to(node, &entry).unwrap();
    fx.cache.invalidate(node);
    gated.release.add_permits(64);

    assert_eq!(first.wait().await.state, JobState::Paused);
    assert_eq!(fx.cache.read(node, 0, 4).await.unwrap(), CacheRead::Miss);

    let mut second = manager.submit(JobRequest::Download { node }).unwrap();
    assert_eq!(second.wait().await.state, JobState::Done);
    assert_eq!(fx.read_all(node).await, b"NEW0NEW1");
}
