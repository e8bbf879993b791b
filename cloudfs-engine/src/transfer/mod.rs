//! Chunked, resumable transfers between the remote store and the cache.
//!
//! A fixed pool of workers pulls jobs from one queue. Each chunk is retried
//! on its own; committed chunks are recorded in the job so a paused or failed
//! job picks up where it stopped when it is submitted again.

mod backoff;
mod job;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cloudfs_core::{RemoteEntry, RemoteError, RemoteStore, UploadTarget};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheRead, ContentCache};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, remote_kind};
use crate::meta::{MetaError, MetadataStore, Node, NodeId};
use crate::persist::{Journal, JournalEntry};

pub use backoff::Backoff;
pub use job::{
    Direction, JobFailure, JobHandle, JobRecord, JobRequest, JobState, JobStatus, TransferEvent,
};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),
    #[error("{0} has no remote copy")]
    NotRemote(NodeId),
    #[error("upload of {0} has no target")]
    MissingTarget(NodeId),
    #[error("short read for {node} at {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        node: NodeId,
        offset: u64,
        expected: u64,
        actual: u64,
    },
    #[error("checksum mismatch for {node}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        node: NodeId,
        expected: String,
        actual: String,
    },
    #[error("local content of {node} is missing at offset {offset}")]
    SourceMissing { node: NodeId, offset: u64 },
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Remote(err) => remote_kind(err),
            TransferError::Cache(err) => err.kind(),
            TransferError::Meta(err) => err.kind(),
            TransferError::NotRemote(_) => ErrorKind::NotFound,
            TransferError::MissingTarget(_) => ErrorKind::Permanent,
            TransferError::ShortRead { .. } | TransferError::ChecksumMismatch { .. } => {
                ErrorKind::Transient
            }
            TransferError::SourceMissing { .. } => ErrorKind::Io,
            TransferError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

type JobKey = (NodeId, Direction);

struct JobSlot {
    record: Mutex<JobRecord>,
    cancel: Mutex<CancellationToken>,
    status: watch::Sender<JobStatus>,
    /// Set once the slot no longer owns the persisted row.
    retired: AtomicBool,
}

impl JobSlot {
    fn new(record: JobRecord) -> Arc<Self> {
        let (status, _) = watch::channel(status_of(&record, None));
        Arc::new(Self {
            record: Mutex::new(record),
            cancel: Mutex::new(CancellationToken::new()),
            status,
            retired: AtomicBool::new(false),
        })
    }

    fn record(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> JobRecord {
        self.record().clone()
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn renew_token(&self) {
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
    }

    fn handle(&self, key: JobKey) -> JobHandle {
        JobHandle::new(key.0, key.1, self.status.subscribe())
    }

    fn publish(&self, failure: Option<JobFailure>) {
        let status = status_of(&self.record(), failure);
        self.status.send_replace(status);
    }
}

fn status_of(record: &JobRecord, failure: Option<JobFailure>) -> JobStatus {
    JobStatus {
        state: record.state,
        done: record.done_bytes(),
        total: record.total,
        failure,
    }
}

enum Finished {
    Downloaded,
    Uploaded(RemoteEntry),
}

pub struct TransferManager {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<ContentCache>,
    meta: Arc<MetadataStore>,
    journal: Journal,
    backoff: Backoff,
    retry_attempts: u32,
    workers: usize,
    jobs: Mutex<HashMap<JobKey, Arc<JobSlot>>>,
    queue_tx: mpsc::UnboundedSender<Arc<JobSlot>>,
    queue_rx: AsyncMutex<mpsc::UnboundedReceiver<Arc<JobSlot>>>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
}

impl TransferManager {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<ContentCache>,
        meta: Arc<MetadataStore>,
        journal: Journal,
        config: &EngineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            remote,
            cache,
            meta,
            journal,
            backoff: Backoff::from_config(config),
            retry_attempts: config.retry_attempts.max(1),
            workers: config.transfer_workers.max(1),
            jobs: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn jobs_lock(&self) -> MutexGuard<'_, HashMap<JobKey, Arc<JobSlot>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver for job outcomes. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Reloads persisted jobs. Nothing runs until a job is submitted again.
    pub fn restore(&self, records: Vec<JobRecord>) {
        let mut jobs = self.jobs_lock();
        for mut record in records {
            let key = (record.node, record.direction);
            if record.state == JobState::Done || self.meta.get(record.node).is_none() {
                self.journal.record(JournalEntry::JobRemoved {
                    node: key.0,
                    direction: key.1,
                });
                continue;
            }
            if matches!(record.state, JobState::Queued | JobState::Running) {
                record.state = JobState::Paused;
                self.journal.record(JournalEntry::Job(record.clone()));
            }
            jobs.insert(key, JobSlot::new(record));
        }
        debug!(jobs = jobs.len(), "transfer jobs restored");
    }

    /// Queues a job unless one is already active for the node and direction.
    /// A paused or failed job with the same fingerprint is resumed instead
    /// of being started over.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, TransferError> {
        let node = self.meta.require(request.node())?;
        let fresh = self.prepare(&request, &node)?;
        let key = (fresh.node, fresh.direction);
        let mut jobs = self.jobs_lock();

        if let Some(slot) = jobs.get(&key).cloned() {
            let mut record = slot.record();
            let resumable = record.fingerprint == fresh.fingerprint
                && record.chunk_size == fresh.chunk_size;
            let state = record.state;
            match state {
                JobState::Queued | JobState::Running => {
                    drop(record);
                    return Ok(slot.handle(key));
                }
                JobState::Paused | JobState::Failed if resumable => {
                    record.state = JobState::Queued;
                    record.last_error = None;
                    for index in fresh.done_chunks {
                        record.mark_done(index);
                    }
                    if record.session.is_none() {
                        record.target = fresh.target;
                    }
                    let resumed = record.done_chunks.len();
                    drop(record);
                    slot.renew_token();
                    self.persist(&slot);
                    slot.publish(None);
                    self.enqueue(slot.clone());
                    info!(
                        node = %key.0,
                        direction = key.1.as_str(),
                        done_chunks = resumed,
                        "resuming transfer"
                    );
                    return Ok(slot.handle(key));
                }
                _ => {
                    slot.retired.store(true, Ordering::SeqCst);
                }
            }
        }

        let slot = JobSlot::new(fresh);
        jobs.insert(key, slot.clone());
        drop(jobs);
        self.persist(&slot);
        self.enqueue(slot.clone());
        debug!(node = %key.0, direction = key.1.as_str(), "transfer queued");
        Ok(slot.handle(key))
    }

    fn prepare(&self, request: &JobRequest, node: &Node) -> Result<JobRecord, TransferError> {
        let chunk_size = self.cache.chunk_size();
        let mut record = JobRecord {
            node: node.id,
            direction: request.direction(),
            state: JobState::Queued,
            remote_id: node.remote_id.clone(),
            target: None,
            session: None,
            fingerprint: String::new(),
            total: node.size,
            chunk_size,
            done_chunks: Vec::new(),
            retries: 0,
            generation: node.generation,
            last_error: None,
        };
        match request {
            JobRequest::Download { .. } => {
                if node.remote_id.is_none() {
                    return Err(TransferError::NotRemote(node.id));
                }
                record.total = node.remote_size.unwrap_or(node.size);
                record.fingerprint = match &node.checksum {
                    Some(sum) => format!("md5:{sum}:size:{}", record.total),
                    None => format!(
                        "mtime:{}:size:{}",
                        node.remote_mtime.unwrap_or_default(),
                        record.total
                    ),
                };
                record.done_chunks = (0..record.chunk_count())
                    .filter(|index| {
                        let (offset, len) = record.chunk_range(*index);
                        self.cache.covers(node.id, offset, len)
                    })
                    .collect();
            }
            JobRequest::Upload { target, .. } => {
                record.target = Some(target.clone());
                record.fingerprint = format!("gen:{}:size:{}", node.generation, node.size);
            }
        }
        Ok(record)
    }

    fn enqueue(&self, slot: Arc<JobSlot>) {
        if self.queue_tx.send(slot).is_err() {
            warn!("transfer queue closed");
        }
    }

    fn persist(&self, slot: &JobSlot) {
        let record = slot.record();
        if !slot.retired.load(Ordering::SeqCst) {
            self.journal.record(JournalEntry::Job(record.clone()));
        }
    }

    /// Drops the slot from the table and its persisted row.
    fn retire(&self, slot: &Arc<JobSlot>) {
        let mut jobs = self.jobs_lock();
        let key = {
            let record = slot.record();
            if !slot.retired.swap(true, Ordering::SeqCst) {
                self.journal.record(JournalEntry::JobRemoved {
                    node: record.node,
                    direction: record.direction,
                });
            }
            (record.node, record.direction)
        };
        if jobs.get(&key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            jobs.remove(&key);
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Stops the job between chunks. Committed chunks stay for a resume.
    pub fn cancel(&self, node: NodeId, direction: Direction) -> bool {
        let slot = self.jobs_lock().get(&(node, direction)).cloned();
        let Some(slot) = slot else {
            return false;
        };
        self.cancel_slot(&slot);
        true
    }

    fn cancel_slot(&self, slot: &Arc<JobSlot>) {
        slot.token().cancel();
        let queued = {
            let mut record = slot.record();
            if record.state == JobState::Queued {
                record.state = JobState::Paused;
                Some((record.node, record.direction))
            } else {
                None
            }
        };
        if let Some((node, direction)) = queued {
            self.persist(slot);
            self.emit(TransferEvent::Paused { node, direction });
            slot.publish(None);
        }
    }

    pub fn cancel_all(&self) {
        let slots: Vec<_> = self.jobs_lock().values().cloned().collect();
        for slot in &slots {
            self.cancel_slot(slot);
        }
        if !slots.is_empty() {
            info!(jobs = slots.len(), "cancelled all transfers");
        }
    }

    /// Cancels and forgets every job of a node that no longer exists.
    pub fn discard(&self, node: NodeId) {
        for direction in [Direction::Download, Direction::Upload] {
            let slot = self.jobs_lock().remove(&(node, direction));
            if let Some(slot) = slot {
                slot.token().cancel();
                {
                    let mut record = slot.record();
                    if !record.state.is_settled() {
                        record.state = JobState::Paused;
                    }
                    if !slot.retired.swap(true, Ordering::SeqCst) {
                        self.journal
                            .record(JournalEntry::JobRemoved { node, direction });
                    }
                }
                slot.publish(None);
            }
        }
    }

    pub fn handle(&self, node: NodeId, direction: Direction) -> Option<JobHandle> {
        let key = (node, direction);
        self.jobs_lock().get(&key).map(|slot| slot.handle(key))
    }

    pub fn progress(&self, node: NodeId, direction: Direction) -> Option<f64> {
        self.handle(node, direction).map(|handle| handle.progress())
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        let slots: Vec<_> = self.jobs_lock().values().cloned().collect();
        let mut out: Vec<JobRecord> = slots.iter().map(|slot| slot.snapshot()).collect();
        out.sort_by_key(|record| (record.node, record.direction.as_str()));
        out
    }

    /// Jobs queued or running.
    pub fn active(&self) -> usize {
        let slots: Vec<_> = self.jobs_lock().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| !slot.record().state.is_settled())
            .count()
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                let manager = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { manager.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        debug!(worker, "transfer worker started");
        loop {
            let next = {
                let mut rx = self.queue_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    slot = rx.recv() => slot,
                }
            };
            let Some(slot) = next else {
                break;
            };
            self.run(slot).await;
        }
        debug!(worker, "transfer worker stopped");
    }

    async fn run(&self, slot: Arc<JobSlot>) {
        let direction = {
            let mut record = slot.record();
            if record.state != JobState::Queued {
                return;
            }
            record.state = JobState::Running;
            record.direction
        };
        let token = slot.token();
        self.persist(&slot);
        slot.publish(None);

        let result = match direction {
            Direction::Download => self.download(&slot, &token).await,
            Direction::Upload => self.upload(&slot, &token).await,
        };
        self.finish(&slot, result);
    }

    fn finish(&self, slot: &Arc<JobSlot>, result: Result<Finished, TransferError>) {
        let (node, direction, generation) = {
            let record = slot.record();
            (record.node, record.direction, record.generation)
        };
        match result {
            Ok(finished) => {
                slot.record().state = JobState::Done;
                self.retire(slot);
                info!(node = %node, direction = direction.as_str(), "transfer complete");
                self.emit(match finished {
                    Finished::Downloaded => TransferEvent::Downloaded { node },
                    Finished::Uploaded(entry) => TransferEvent::Uploaded {
                        node,
                        entry,
                        generation,
                    },
                });
                slot.publish(None);
            }
            Err(TransferError::Cancelled) => {
                slot.record().state = JobState::Paused;
                self.persist(slot);
                debug!(node = %node, direction = direction.as_str(), "transfer paused");
                self.emit(TransferEvent::Paused { node, direction });
                slot.publish(None);
            }
            Err(err) => {
                let failure = JobFailure {
                    kind: err.kind(),
                    message: err.to_string(),
                };
                {
                    let mut record = slot.record();
                    record.state = JobState::Failed;
                    record.last_error = Some(failure.message.clone());
                }
                self.persist(slot);
                warn!(
                    node = %node,
                    direction = direction.as_str(),
                    error = %err,
                    "transfer failed"
                );
                self.emit(TransferEvent::Failed {
                    node,
                    direction,
                    generation,
                    failure: failure.clone(),
                });
                slot.publish(Some(failure));
            }
        }
    }

    fn complete_chunk(&self, slot: &JobSlot, index: u64) {
        slot.record().mark_done(index);
        self.persist(slot);
        slot.publish(None);
    }

    async fn download(
        &self,
        slot: &JobSlot,
        token: &CancellationToken,
    ) -> Result<Finished, TransferError> {
        let record = slot.snapshot();
        let remote_id = record
            .remote_id
            .clone()
            .ok_or(TransferError::NotRemote(record.node))?;
        let remote = &self.remote;
        let id = remote_id.as_str();
        let epoch = self.cache.epoch(record.node);
        for index in 0..record.chunk_count() {
            let done = slot.record().is_done(index);
            if done {
                continue;
            }
            if token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let (offset, len) = record.chunk_range(index);
            let data = self
                .with_retry(slot, token, "range read", move || {
                    remote.get_range(id, offset, len)
                })
                .await?;
            if token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if data.len() as u64 != len {
                return Err(TransferError::ShortRead {
                    node: record.node,
                    offset,
                    expected: len,
                    actual: data.len() as u64,
                });
            }
            match self
                .cache
                .store_chunk_at(record.node, offset, data, epoch)
                .await
            {
                Ok(()) => {}
                Err(CacheError::Superseded { .. }) => return Err(TransferError::Cancelled),
                Err(err) => return Err(err.into()),
            }
            self.complete_chunk(slot, index);
        }
        self.verify(slot, &record).await?;
        Ok(Finished::Downloaded)
    }

    /// Compares the assembled content with the remote md5, when the node
    /// still describes the content this job fetched.
    async fn verify(&self, slot: &JobSlot, record: &JobRecord) -> Result<(), TransferError> {
        let node = self.meta.require(record.node)?;
        if node.dirty || node.remote_size != Some(record.total) {
            return Ok(());
        }
        let Some(expected) = node.checksum.as_deref() else {
            return Ok(());
        };
        let actual = self.cache.checksum(record.node, record.total).await?;
        if actual.eq_ignore_ascii_case(expected) {
            return Ok(());
        }
        self.cache.invalidate(record.node);
        slot.record().done_chunks.clear();
        Err(TransferError::ChecksumMismatch {
            node: record.node,
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }

    async fn upload(
        &self,
        slot: &JobSlot,
        token: &CancellationToken,
    ) -> Result<Finished, TransferError> {
        let record = slot.snapshot();
        let target = record
            .target
            .clone()
            .ok_or(TransferError::MissingTarget(record.node))?;
        let mut restarted = false;
        loop {
            let result = self.upload_once(slot, token, &record, &target).await;
            let had_session = slot.record().session.is_some();
            match result {
                Err(TransferError::Remote(err)) if err.is_not_found() && had_session && !restarted => {
                    warn!(node = %record.node, "upload session expired; starting over");
                    {
                        let mut current = slot.record();
                        current.session = None;
                        current.done_chunks.clear();
                    }
                    self.persist(slot);
                    slot.publish(None);
                    restarted = true;
                }
                other => return other,
            }
        }
    }

    async fn upload_once(
        &self,
        slot: &JobSlot,
        token: &CancellationToken,
        record: &JobRecord,
        target: &UploadTarget,
    ) -> Result<Finished, TransferError> {
        let remote = &self.remote;
        let existing = slot.record().session.clone();
        let session = match existing {
            Some(session) => session,
            None => {
                let total = record.total;
                let session = self
                    .with_retry(slot, token, "upload start", move || {
                        remote.begin_upload(target, total)
                    })
                    .await?;
                slot.record().session = Some(session.clone());
                self.persist(slot);
                session
            }
        };
        let session_id = session.as_str();

        for index in 0..record.chunk_count() {
            let done = slot.record().is_done(index);
            if done {
                continue;
            }
            if token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let (offset, len) = record.chunk_range(index);
            let data = match self.cache.read_range(record.node, offset, len).await? {
                CacheRead::Hit(data) => data,
                CacheRead::Miss => {
                    return Err(TransferError::SourceMissing {
                        node: record.node,
                        offset,
                    });
                }
            };
            self.with_retry(slot, token, "chunk upload", move || {
                remote.upload_chunk(session_id, offset, data.clone())
            })
            .await?;
            self.complete_chunk(slot, index);
        }

        let entry = self
            .with_retry(slot, token, "upload finish", move || {
                remote.finish_upload(session_id)
            })
            .await?;
        Ok(Finished::Uploaded(entry))
    }

    /// Runs one remote call until it succeeds, fails permanently, exhausts
    /// the attempt ceiling or the job is cancelled.
    async fn with_retry<T, F, Fut>(
        &self,
        slot: &JobSlot,
        token: &CancellationToken,
        what: &'static str,
        mut call: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return Err(TransferError::Cancelled),
                result = call() => result,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;
            if !err.is_retryable() || attempt >= self.retry_attempts {
                return Err(err.into());
            }
            let node = {
                let mut record = slot.record();
                record.retries += 1;
                record.last_error = Some(err.to_string());
                record.node
            };
            warn!(node = %node, attempt, error = %err, "{what} failed; retrying");
            let waited = match err.retry_after_secs() {
                Some(secs) => tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => true,
                },
                None => self.backoff.wait(attempt - 1, token).await,
            };
            if !waited {
                return Err(TransferError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
#[path = "transfer_tests.rs"]
mod tests;
