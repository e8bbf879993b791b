use std::time::Duration;

use cloudfs_core::RemoteError;
use tracing::{debug, info, warn};

use super::SyncEngine;
use super::queue::{RemoteOp, RemoteOpKind};
use crate::error::{EngineError, ErrorKind};
use crate::meta::{Node, NodeId, NodeKind, SnapshotOutcome, SyncState};
use crate::transfer::Direction;

enum OpOutcome {
    Done,
    /// Waiting on something else, usually a parent mkdir or a running upload.
    Deferred,
}

impl SyncEngine {
    pub async fn create_file(&self, parent: &str, name: &str) -> Result<Node, EngineError> {
        let node = self.meta.create(parent, name, NodeKind::File).await?;
        debug!(node = %node.id, parent = %parent, name = %name, "file created");
        Ok(node)
    }

    pub async fn create_dir(&self, parent: &str, name: &str) -> Result<Node, EngineError> {
        let node = self.meta.create(parent, name, NodeKind::Dir).await?;
        self.ops.enqueue(RemoteOpKind::Mkdir, node.id, None);
        debug!(node = %node.id, parent = %parent, name = %name, "directory created");
        Ok(node)
    }

    /// Renames locally right away; the remote side follows through the queue.
    pub async fn rename(&self, from: &str, to: &str) -> Result<Node, EngineError> {
        let node = self.meta.rename(from, to).await?;
        if node.remote_id.is_some() || self.upload_in_flight(node.id) {
            self.ops
                .enqueue(RemoteOpKind::Rename, node.id, node.remote_id.clone());
        }
        Ok(node)
    }

    /// Renames over an existing file or empty directory at `to`. The
    /// displaced node is dropped the way [`remove`](Self::remove) drops it.
    pub async fn rename_replacing(&self, from: &str, to: &str) -> Result<Node, EngineError> {
        let (node, displaced) = self.meta.rename_replacing(from, to).await?;
        if let Some(displaced) = displaced {
            self.forget(&displaced).await?;
            debug!(node = %displaced.id, path = %to, "replaced by rename");
        }
        if node.remote_id.is_some() || self.upload_in_flight(node.id) {
            self.ops
                .enqueue(RemoteOpKind::Rename, node.id, node.remote_id.clone());
        }
        Ok(node)
    }

    /// Unlinks a file or an empty directory. Its transfers stop, its cached
    /// bytes go, and a remote delete is queued when the remote knows it.
    pub async fn remove(&self, path: &str) -> Result<Node, EngineError> {
        let node = self.meta.remove(path).await?;
        self.forget(&node).await?;
        debug!(node = %node.id, path = %path, "removed");
        Ok(node)
    }

    async fn forget(&self, node: &Node) -> Result<(), EngineError> {
        self.transfers.discard(node.id);
        self.cache.drop_node(node.id).await?;
        if let Some(remote_id) = &node.remote_id {
            self.ops
                .enqueue(RemoteOpKind::Delete, node.id, Some(remote_id.clone()));
        }
        Ok(())
    }

    /// Executes the oldest ready remote operation. False when none is ready.
    pub async fn run_once(&self) -> Result<bool, EngineError> {
        let now = crate::now_unix();
        let Some(op) = self.ops.next_ready(now) else {
            return Ok(false);
        };
        debug!(
            op = op.id,
            kind = op.kind.as_str(),
            node = %op.node,
            attempt = op.attempt,
            "remote operation start"
        );
        let result = match op.kind {
            RemoteOpKind::Mkdir => self.execute_mkdir(&op).await,
            RemoteOpKind::Delete => self.execute_delete(&op).await,
            RemoteOpKind::Rename => self.execute_rename(&op).await,
        };
        match result {
            Ok(OpOutcome::Done) => self.ops.complete(op.id),
            Ok(OpOutcome::Deferred) => {
                self.ops.defer(op.id, now + 1);
            }
            Err(err)
                if err.kind() == ErrorKind::Transient
                    && op.attempt + 1 < self.retry_attempts =>
            {
                let delay = match &err {
                    EngineError::Remote(remote) => remote.retry_after_secs().map(Duration::from_secs),
                    _ => None,
                }
                .unwrap_or_else(|| self.backoff.delay(op.attempt + 1));
                let retry_at = now + delay.as_secs().max(1) as i64;
                self.ops.requeue(op.id, retry_at, Some(err.to_string()));
                info!(
                    op = op.id,
                    kind = op.kind.as_str(),
                    attempt = op.attempt + 1,
                    retry_at,
                    error = %err,
                    "remote operation requeued"
                );
            }
            Err(err) => {
                warn!(
                    op = op.id,
                    kind = op.kind.as_str(),
                    node = %op.node,
                    attempt = op.attempt + 1,
                    error = %err,
                    "remote operation failed"
                );
                self.ops.complete(op.id);
                self.fail_op(&op, &err)?;
            }
        }
        Ok(true)
    }

    /// Runs operations until none is ready.
    pub async fn run_pending(&self) -> Result<usize, EngineError> {
        let mut ran = 0;
        while self.run_once().await? {
            ran += 1;
        }
        Ok(ran)
    }

    fn fail_op(&self, op: &RemoteOp, err: &EngineError) -> Result<(), EngineError> {
        match op.kind {
            RemoteOpKind::Delete => {
                // The entry comes back on the next refresh.
                self.meta.purge(op.node);
            }
            RemoteOpKind::Mkdir | RemoteOpKind::Rename => {
                if self.meta.get(op.node).is_some() {
                    self.meta
                        .set_state(op.node, SyncState::UploadFailed, Some(err.to_string()))?;
                }
            }
        }
        Ok(())
    }

    fn parent_remote_id(&self, node: &Node) -> Option<String> {
        node.parent
            .and_then(|parent| self.meta.get(parent))
            .and_then(|parent| parent.remote_id)
    }

    /// Makes ops of `dir`'s children that were waiting on it ready again.
    fn wake_children(&self, dir: NodeId) {
        for child in self.meta.children_of(dir) {
            for kind in [RemoteOpKind::Mkdir, RemoteOpKind::Rename] {
                if self.ops.has_pending(child.id, kind) {
                    self.ops.enqueue(kind, child.id, child.remote_id.clone());
                }
            }
        }
    }

    async fn execute_mkdir(&self, op: &RemoteOp) -> Result<OpOutcome, EngineError> {
        let Some(node) = self.meta.get(op.node) else {
            return Ok(OpOutcome::Done);
        };
        if node.remote_id.is_some() {
            return Ok(OpOutcome::Done);
        }
        let Some(parent_id) = self.parent_remote_id(&node) else {
            return Ok(OpOutcome::Deferred);
        };
        let entry = match self.remote.create_dir(&parent_id, &node.name).await {
            Ok(entry) => entry,
            Err(err) if !err.is_retryable() && !err.is_not_found() => {
                match self.find_existing_dir(&parent_id, &node.name).await? {
                    Some(entry) => entry,
                    None => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };
        self.meta.mark_created(node.id, &entry)?;
        let current = self.meta.require(node.id)?;
        if current.name != entry.name {
            self.ops
                .enqueue(RemoteOpKind::Rename, node.id, Some(entry.id.clone()));
        }
        info!(node = %node.id, remote_id = %entry.id, "directory created remotely");
        self.wake_children(node.id);
        self.schedule_uploads()?;
        Ok(OpOutcome::Done)
    }

    /// A directory of that name may already exist remotely; adopt it.
    async fn find_existing_dir(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<cloudfs_core::RemoteEntry>, RemoteError> {
        let entries = self.remote.list_children(parent_id).await?;
        Ok(entries
            .into_iter()
            .find(|entry| entry.name == name && NodeKind::from(entry.kind) == NodeKind::Dir))
    }

    async fn execute_delete(&self, op: &RemoteOp) -> Result<OpOutcome, EngineError> {
        let remote_id = op
            .remote_id
            .clone()
            .or_else(|| self.meta.tombstone(op.node).and_then(|node| node.remote_id));
        if let Some(remote_id) = remote_id {
            match self.remote.delete(&remote_id).await {
                Ok(()) => info!(node = %op.node, remote_id = %remote_id, "deleted remotely"),
                Err(err) if err.is_not_found() => {
                    debug!(node = %op.node, remote_id = %remote_id, "already gone remotely")
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.meta.purge(op.node);
        Ok(OpOutcome::Done)
    }

    async fn execute_rename(&self, op: &RemoteOp) -> Result<OpOutcome, EngineError> {
        let Some(node) = self.meta.get(op.node) else {
            return Ok(OpOutcome::Done);
        };
        let Some(remote_id) = node.remote_id.clone() else {
            // A running upload still creates the file under its old name.
            if self.upload_in_flight(node.id) {
                return Ok(OpOutcome::Deferred);
            }
            return Ok(OpOutcome::Done);
        };
        let Some(parent_id) = self.parent_remote_id(&node) else {
            return Ok(OpOutcome::Deferred);
        };
        let entry = self
            .remote
            .rename(&remote_id, &node.name, Some(&parent_id))
            .await?;
        if self.meta.apply_remote_snapshot_to(node.id, &entry)? == SnapshotOutcome::ContentChanged {
            self.transfers.cancel(node.id, Direction::Download);
            self.cache.invalidate(node.id);
        }
        info!(node = %node.id, remote_id = %remote_id, name = %node.name, "renamed remotely");
        Ok(OpOutcome::Done)
    }
}
