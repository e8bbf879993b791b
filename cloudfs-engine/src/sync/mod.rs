//! Decides when content moves and settles divergence between the local
//! mirror and the remote tree.
//!
//! Per-node state runs `Clean -> Dirty -> Uploading -> Clean`, with
//! `UploadFailed` and `Conflict` as the reportable detours. Content moves
//! through the [`TransferManager`]; namespace changes go through the
//! persisted [`OperationQueue`].

pub mod conflict;
mod namespace;
pub mod queue;
mod refresh;

use std::sync::Arc;
use std::time::Duration;

use cloudfs_core::{RemoteEntry, RemoteStore, UploadTarget};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::config::{ConflictPolicy, EngineConfig};
use crate::error::{EngineError, ErrorKind};
use crate::meta::{MetadataStore, Node, NodeId, SyncState};
use crate::persist::{ConflictRecord, Journal, JournalEntry};
use crate::transfer::{
    Backoff, Direction, JobFailure, JobHandle, JobRequest, TransferEvent, TransferManager,
};

use conflict::Resolution;
pub use queue::{OperationQueue, RemoteOp, RemoteOpKind};
pub use refresh::RefreshReport;

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    meta: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    transfers: Arc<TransferManager>,
    ops: OperationQueue,
    journal: Journal,
    backoff: Backoff,
    policy: ConflictPolicy,
    auto_resolve: bool,
    dir_max_age: Duration,
    retry_attempts: u32,
    events: AsyncMutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        meta: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        transfers: Arc<TransferManager>,
        journal: Journal,
        config: &EngineConfig,
    ) -> Self {
        let events = transfers.take_events();
        if events.is_none() {
            warn!("transfer events already claimed; job outcomes will not reach the sync engine");
        }
        Self {
            remote,
            meta,
            cache,
            ops: OperationQueue::new(journal.clone()),
            transfers,
            journal,
            backoff: Backoff::from_config(config),
            policy: config.conflict_policy,
            auto_resolve: config.auto_resolve,
            dir_max_age: config.dir_max_age,
            retry_attempts: config.retry_attempts.max(1),
            events: AsyncMutex::new(events),
        }
    }

    pub fn restore_ops(&self, ops: Vec<RemoteOp>) {
        self.ops.restore(ops);
    }

    pub fn operations(&self) -> &OperationQueue {
        &self.ops
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    fn upload_in_flight(&self, id: NodeId) -> bool {
        self.transfers
            .handle(id, Direction::Upload)
            .is_some_and(|handle| !handle.status().state.is_settled())
    }

    /// Submits an upload for a dirty file. Files whose parent directory does
    /// not exist remotely yet are left dirty until the mkdir lands.
    pub fn schedule_upload(&self, id: NodeId) -> Result<Option<JobHandle>, EngineError> {
        let node = self.meta.require(id)?;
        if node.is_dir() || node.state != SyncState::Dirty {
            return Ok(None);
        }
        let parent_remote = node
            .parent
            .and_then(|parent| self.meta.get(parent))
            .and_then(|parent| parent.remote_id);
        let target = match (&node.remote_id, parent_remote) {
            (Some(id), _) => UploadTarget::Replace { id: id.clone() },
            (None, Some(parent_id)) => UploadTarget::Create {
                parent_id,
                name: node.name.clone(),
            },
            (None, None) => {
                debug!(node = %id, "upload waits for parent directory");
                return Ok(None);
            }
        };
        self.meta.set_state(id, SyncState::Uploading, None)?;
        match self.transfers.submit(JobRequest::Upload { node: id, target }) {
            Ok(handle) => Ok(Some(handle)),
            Err(err) => {
                self.meta.set_state(id, SyncState::Dirty, None)?;
                Err(err.into())
            }
        }
    }

    /// Schedules every dirty file that can be uploaded now.
    pub fn schedule_uploads(&self) -> Result<usize, EngineError> {
        let mut scheduled = 0;
        for node in self.meta.dirty_nodes() {
            if node.is_dir() {
                continue;
            }
            if self.schedule_upload(node.id)?.is_some() {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            debug!(scheduled, "uploads scheduled");
        }
        Ok(scheduled)
    }

    /// Starts or joins a download of the whole file. Nothing happens for
    /// directories, dirty nodes and files already fully cached.
    pub fn fetch(&self, id: NodeId) -> Result<Option<JobHandle>, EngineError> {
        let node = self.meta.require(id)?;
        if node.is_dir() || node.dirty || !node.has_remote_content() {
            return Ok(None);
        }
        let size = node.remote_size.unwrap_or(node.size);
        if self.cache.covers(id, 0, size) {
            return Ok(None);
        }
        Ok(Some(self.transfers.submit(JobRequest::Download { node: id })?))
    }

    pub fn pin(&self, path: &str) -> Result<usize, EngineError> {
        self.set_pinned_tree(path, true)
    }

    pub fn unpin(&self, path: &str) -> Result<usize, EngineError> {
        self.set_pinned_tree(path, false)
    }

    /// Pins or unpins `path` and everything below it; pinned files are
    /// prefetched.
    fn set_pinned_tree(&self, path: &str, pinned: bool) -> Result<usize, EngineError> {
        let root = self.meta.set_pinned(path, pinned)?;
        let mut changed = vec![root.clone()];
        if root.is_dir() {
            for node in self.subtree(root.id).into_iter().skip(1) {
                if let Some(child_path) = self.meta.path_of(node.id) {
                    changed.push(self.meta.set_pinned(&child_path, pinned)?);
                }
            }
        }
        if pinned {
            for node in &changed {
                self.fetch(node.id)?;
            }
        }
        info!(path = %path, pinned, nodes = changed.len(), "pin state changed");
        Ok(changed.len())
    }

    /// `id` followed by every node below it, parents first.
    fn subtree(&self, id: NodeId) -> Vec<Node> {
        let mut out: Vec<Node> = self.meta.get(id).into_iter().collect();
        for dir in self.meta.dirs_under(id) {
            out.extend(self.meta.children_of(dir));
        }
        out
    }

    /// Moves failed nodes back into the pipeline and pushes everything
    /// pending out now.
    pub async fn sync_now(&self) -> Result<usize, EngineError> {
        let failed = self.meta.nodes_in_state(SyncState::UploadFailed);
        for node in &failed {
            if node.is_dir() && node.remote_id.is_none() {
                self.meta.set_state(node.id, SyncState::Dirty, None)?;
                self.ops.enqueue(RemoteOpKind::Mkdir, node.id, None);
            } else if node.dirty {
                self.meta.set_state(node.id, SyncState::Dirty, None)?;
            } else {
                self.meta.set_state(node.id, SyncState::Clean, None)?;
                self.ops
                    .enqueue(RemoteOpKind::Rename, node.id, node.remote_id.clone());
            }
        }
        self.schedule_uploads()?;
        self.run_pending().await?;
        if !failed.is_empty() {
            info!(nodes = failed.len(), "retrying failed nodes");
        }
        Ok(failed.len())
    }

    /// Applies one transfer outcome to node state.
    pub fn handle_event(&self, event: TransferEvent) -> Result<(), EngineError> {
        match event {
            TransferEvent::Downloaded { node } => {
                debug!(node = %node, "download complete");
            }
            TransferEvent::Uploaded {
                node,
                entry,
                generation,
            } => self.on_uploaded(node, &entry, generation)?,
            TransferEvent::Paused {
                node,
                direction: Direction::Upload,
            } => {
                if self
                    .meta
                    .get(node)
                    .is_some_and(|current| current.state == SyncState::Uploading)
                {
                    self.meta.set_state(node, SyncState::Dirty, None)?;
                }
            }
            TransferEvent::Paused { .. } => {}
            TransferEvent::Failed {
                node,
                direction: Direction::Upload,
                generation,
                failure,
            } => self.on_upload_failed(node, generation, &failure)?,
            TransferEvent::Failed {
                node,
                direction: Direction::Download,
                failure,
                ..
            } => {
                warn!(node = %node, error = %failure.message, "download failed");
            }
        }
        Ok(())
    }

    fn on_uploaded(
        &self,
        id: NodeId,
        entry: &RemoteEntry,
        generation: u64,
    ) -> Result<(), EngineError> {
        let Some(current) = self.meta.get(id) else {
            // Unlinked while the upload ran; a tombstone already carries the delete.
            if self.meta.tombstone(id).is_none() {
                self.ops
                    .enqueue(RemoteOpKind::Delete, id, Some(entry.id.clone()));
            }
            return Ok(());
        };
        let clean = self.meta.mark_synced(id, entry, generation)?;
        if entry.name != current.name || self.ops.has_pending(id, RemoteOpKind::Rename) {
            self.ops
                .enqueue(RemoteOpKind::Rename, id, Some(entry.id.clone()));
        }
        info!(node = %id, remote_id = %entry.id, generation, clean, "upload confirmed");
        if !clean {
            self.schedule_upload(id)?;
        }
        Ok(())
    }

    fn on_upload_failed(
        &self,
        id: NodeId,
        generation: u64,
        failure: &JobFailure,
    ) -> Result<(), EngineError> {
        let Some(current) = self.meta.get(id) else {
            return Ok(());
        };
        if current.state != SyncState::Uploading {
            return Ok(());
        }
        if failure.kind == ErrorKind::NotFound && current.remote_id.is_some() {
            info!(node = %id, "remote copy is gone; uploading as a new file");
            self.transfers.discard(id);
            self.meta.clear_remote(id)?;
            self.meta.set_state(id, SyncState::Dirty, None)?;
            self.schedule_upload(id)?;
            return Ok(());
        }
        if current.generation != generation {
            self.meta.set_state(id, SyncState::Dirty, None)?;
            self.schedule_upload(id)?;
            return Ok(());
        }
        warn!(node = %id, error = %failure.message, "upload failed");
        self.meta
            .set_state(id, SyncState::UploadFailed, Some(failure.message.clone()))?;
        Ok(())
    }

    /// Drains transfer outcomes that are already waiting. Returns 0 while
    /// [`run_events`](Self::run_events) owns the channel.
    pub async fn process_events(&self) -> usize {
        let Ok(mut events) = self.events.try_lock() else {
            return 0;
        };
        let Some(rx) = events.as_mut() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            self.apply_event(event);
            handled += 1;
        }
        handled
    }

    pub async fn run_events(&self, shutdown: CancellationToken) {
        let mut events = self.events.lock().await;
        let Some(rx) = events.as_mut() else {
            warn!("no transfer event channel");
            return;
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.apply_event(event),
                    None => break,
                },
            }
        }
        debug!("transfer event loop stopped");
    }

    fn apply_event(&self, event: TransferEvent) {
        if let Err(err) = self.handle_event(event) {
            warn!(error = %err, "failed to apply transfer outcome");
        }
    }

    /// Settles a conflicted node with `policy`. Returns `None` when the node
    /// is not in conflict. The record's `id` is assigned once persisted.
    pub async fn resolve_conflict(
        &self,
        id: NodeId,
        policy: ConflictPolicy,
    ) -> Result<Option<ConflictRecord>, EngineError> {
        let lock = self.meta.node_lock(id);
        let _guard = lock.write().await;
        let node = self.meta.require(id)?;
        if node.state != SyncState::Conflict {
            return Ok(None);
        }
        let path = self.meta.path_of(id).unwrap_or_default();
        let stamp = self.free_conflict_stamp(&node);
        let mut renamed_local = String::new();
        match conflict::resolve(policy, &node.name, stamp) {
            Resolution::UploadLocal => {
                self.meta.accept_remote_base(id)?;
                self.schedule_upload(id)?;
            }
            Resolution::AdoptRemote => {
                self.transfers.discard(id);
                self.meta.reset_to_remote(id)?;
                self.cache.invalidate(id);
            }
            Resolution::KeepBoth { renamed_local: name } => {
                let copy = self.meta.create_conflict_copy(id, &name)?;
                self.transfers.discard(id);
                self.cache.move_node(id, copy.id).await?;
                self.meta.reset_to_remote(id)?;
                self.cache.invalidate(id);
                self.schedule_upload(copy.id)?;
                renamed_local = self.meta.path_of(copy.id).unwrap_or(name);
            }
        }
        let record = ConflictRecord {
            id: 0,
            path,
            renamed_local,
            created: crate::now_unix(),
            reason: policy.as_str().to_string(),
        };
        info!(
            node = %id,
            path = %record.path,
            policy = policy.as_str(),
            renamed_local = %record.renamed_local,
            "conflict resolved"
        );
        self.journal.record(JournalEntry::Conflict(record.clone()));
        Ok(Some(record))
    }

    /// First `n` for which the conflict name is still free next to `node`.
    fn free_conflict_stamp(&self, node: &Node) -> i64 {
        let Some(parent) = node.parent else {
            return 1;
        };
        (1..)
            .find(|stamp| {
                self.meta
                    .child(parent, &conflict::conflict_name(&node.name, *stamp))
                    .is_none()
            })
            .unwrap_or(1)
    }

    /// Applies the configured policy to every conflicted node.
    pub async fn resolve_conflicts(&self) -> usize {
        let mut resolved = 0;
        for node in self.meta.conflicts() {
            match self.resolve_conflict(node.id, self.policy).await {
                Ok(Some(_)) => resolved += 1,
                Ok(None) => {}
                Err(err) => warn!(node = %node.id, error = %err, "conflict resolution failed"),
            }
        }
        resolved
    }

    /// Periodic refresh of the whole tree, followed by conflict handling and
    /// upload scheduling.
    pub async fn run_refresh(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.refresh_tree("/").await {
                Ok(report) => debug!(
                    added = report.added,
                    updated = report.updated,
                    removed = report.removed,
                    conflicts = report.conflicts,
                    "periodic refresh"
                ),
                Err(err) => warn!(error = %err, "periodic refresh failed"),
            }
            if self.auto_resolve {
                self.resolve_conflicts().await;
            }
            if let Err(err) = self.schedule_uploads() {
                warn!(error = %err, "failed to schedule uploads");
            }
        }
        debug!("refresh loop stopped");
    }

    pub async fn run_ops(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            if let Err(err) = self.run_pending().await {
                warn!(error = %err, "remote operation loop error");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("remote operation loop stopped");
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
