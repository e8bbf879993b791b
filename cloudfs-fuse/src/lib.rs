//! POSIX-style filesystem calls on top of the cloudfs engine.
//!
//! Inode numbers are node identifiers, so the mount's root inode is the
//! root node. Every call reports failures as an [`Errno`].

mod errno;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use cloudfs_engine::cache::{CacheError, CacheRead};
use cloudfs_engine::paths;
use cloudfs_engine::transfer::JobState;
use cloudfs_engine::{
    EngineContext, EngineError, Node, NodeId, NodeKind, ReadMode, SyncState,
};
use tokio::time::Instant;
use tracing::{debug, warn};

pub use errno::Errno;

pub const XATTR_STATE: &str = "user.cloudfs.state";
pub const XATTR_PINNED: &str = "user.cloudfs.pinned";

/// How often a write or truncate hydrates a file that is still not fully
/// resident before giving up.
const HYDRATE_ATTEMPTS: usize = 3;

pub type AdapterResult<T> = Result<T, Errno>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: i64,
    pub state: SyncState,
    pub pinned: bool,
}

impl From<&Node> for Attr {
    fn from(node: &Node) -> Self {
        let mtime = if node.dirty {
            node.local_mtime
        } else {
            node.remote_mtime.unwrap_or(node.local_mtime)
        };
        Self {
            ino: node.id.0,
            kind: node.kind,
            size: node.size,
            mtime,
            state: node.state,
            pinned: node.pinned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attr: Attr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub budget: u64,
    pub used: u64,
    pub files: u64,
}

#[derive(Clone, Copy)]
enum Change<'a> {
    Write { offset: u64, data: &'a [u8] },
    Truncate(u64),
}

pub struct OperationAdapter {
    engine: Arc<EngineContext>,
    read_mode: ReadMode,
    wait_timeout: Duration,
    refreshing: Arc<Mutex<HashSet<NodeId>>>,
}

impl OperationAdapter {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        let read_mode = engine.config().read_mode;
        let wait_timeout = engine.config().wait_timeout;
        Self {
            engine,
            read_mode,
            wait_timeout,
            refreshing: Arc::default(),
        }
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    fn fail(&self, op: &'static str, path: &str, err: impl Into<EngineError>) -> Errno {
        let err = err.into();
        let errno = Errno::from(err.kind());
        match errno {
            Errno::Io | Errno::NoSpace => {
                warn!(op, path = %path, error = %err, "filesystem call failed")
            }
            _ => debug!(op, path = %path, error = %err, "filesystem call failed"),
        }
        errno
    }

    fn node(&self, op: &'static str, path: &str) -> AdapterResult<Node> {
        self.engine
            .meta()
            .lookup(path)
            .map_err(|err| self.fail(op, path, err))
    }

    fn file(&self, op: &'static str, path: &str) -> AdapterResult<Node> {
        let node = self.node(op, path)?;
        if node.is_dir() {
            return Err(Errno::IsDir);
        }
        Ok(node)
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.engine.meta().path_of(NodeId(ino))
    }

    pub fn getattr(&self, path: &str) -> AdapterResult<Attr> {
        self.node("getattr", path).map(|node| Attr::from(&node))
    }

    pub fn lookup(&self, parent: &str, name: &str) -> AdapterResult<Attr> {
        paths::validate_name(name).map_err(|_| Errno::Invalid)?;
        self.getattr(&paths::join(parent, name))
    }

    /// Resolves a file and starts downloading whatever is not resident yet.
    pub fn open(&self, path: &str) -> AdapterResult<Attr> {
        let node = self.file("open", path)?;
        self.engine
            .sync()
            .fetch(node.id)
            .map_err(|err| self.fail("open", path, err))?;
        Ok(Attr::from(&node))
    }

    /// Reads from the cache. Missing bytes are either waited for, bounded by
    /// the configured timeout, or reported as [`Errno::Again`] right away.
    pub async fn read(&self, path: &str, offset: u64, len: u64) -> AdapterResult<Bytes> {
        let node = self.file("read", path)?;
        if let CacheRead::Hit(bytes) = self.read_resident(path, node.id, offset, len).await? {
            return Ok(bytes);
        }
        if self.read_mode == ReadMode::NonBlocking {
            self.engine
                .sync()
                .fetch(node.id)
                .map_err(|err| self.fail("read", path, err))?;
            return Err(Errno::Again);
        }
        self.hydrate("read", path, &node, offset, len).await?;
        match self.read_resident(path, node.id, offset, len).await? {
            CacheRead::Hit(bytes) => Ok(bytes),
            // Invalidated by a refresh while we waited.
            CacheRead::Miss => Err(Errno::Again),
        }
    }

    async fn read_resident(
        &self,
        path: &str,
        node: NodeId,
        offset: u64,
        len: u64,
    ) -> AdapterResult<CacheRead> {
        let lock = self.engine.meta().node_lock(node);
        let _guard = lock.read().await;
        self.engine
            .cache()
            .read(node, offset, len)
            .await
            .map_err(|err| self.fail("read", path, err))
    }

    /// Waits until `len` bytes at `offset` are resident, starting the
    /// download when none is running.
    async fn hydrate(
        &self,
        op: &'static str,
        path: &str,
        node: &Node,
        offset: u64,
        len: u64,
    ) -> AdapterResult<()> {
        let deadline = Instant::now() + self.wait_timeout;
        let len = len.min(node.size.saturating_sub(offset));
        let cache = self.engine.cache();
        let mut node = node.clone();
        loop {
            if cache.covers(node.id, offset, len) {
                return Ok(());
            }
            let Some(mut handle) = self
                .engine
                .sync()
                .fetch(node.id)
                .map_err(|err| self.fail(op, path, err))?
            else {
                return Ok(());
            };
            loop {
                if cache.covers(node.id, offset, len) {
                    return Ok(());
                }
                let status = handle.status();
                match status.state {
                    JobState::Done => break,
                    JobState::Paused => {
                        // A content change restarts the download; anything
                        // else pausing it was a cancellation.
                        let current = self
                            .engine
                            .meta()
                            .require(node.id)
                            .map_err(|err| self.fail(op, path, err))?;
                        if current.remote_mtime == node.remote_mtime
                            && current.checksum == node.checksum
                        {
                            return Err(self.fail(op, path, EngineError::Cancelled));
                        }
                        node = current;
                        break;
                    }
                    JobState::Failed => {
                        let errno = status
                            .failure
                            .as_ref()
                            .map_or(Errno::Io, |failure| Errno::from(failure.kind));
                        warn!(op, path = %path, error = ?status.failure, "download failed");
                        return Err(errno);
                    }
                    JobState::Queued | JobState::Running => {}
                }
                match tokio::time::timeout_at(deadline, handle.changed()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(_) => return Err(self.fail(op, path, EngineError::TimedOut(path.to_string()))),
                }
            }
            if Instant::now() >= deadline {
                return Err(self.fail(op, path, EngineError::TimedOut(path.to_string())));
            }
        }
    }

    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> AdapterResult<usize> {
        let node = self.file("write", path)?;
        self.modify("write", path, node.id, Change::Write { offset, data })
            .await?;
        Ok(data.len())
    }

    pub async fn truncate(&self, path: &str, size: u64) -> AdapterResult<Attr> {
        let node = self.file("truncate", path)?;
        self.modify("truncate", path, node.id, Change::Truncate(size))
            .await?;
        self.getattr(path)
    }

    /// Applies a content change under the node's write lock. A file the
    /// remote knows about must be fully resident first.
    async fn modify(
        &self,
        op: &'static str,
        path: &str,
        id: NodeId,
        change: Change<'_>,
    ) -> AdapterResult<()> {
        let lock = self.engine.meta().node_lock(id);
        let cache = self.engine.cache();
        for _ in 0..HYDRATE_ATTEMPTS {
            let result = {
                let _guard = lock.write().await;
                match change {
                    Change::Write { offset, data } => cache.write(id, offset, data).await.map(|_| ()),
                    Change::Truncate(size) => cache.truncate(id, size).await,
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(CacheError::NotResident { offset, .. }) => {
                    debug!(op, path = %path, offset, "hydrating before local change");
                    let current = self
                        .engine
                        .meta()
                        .require(id)
                        .map_err(|err| self.fail(op, path, err))?;
                    self.hydrate(op, path, &current, 0, current.size).await?;
                }
                Err(err) => return Err(self.fail(op, path, err)),
            }
        }
        Err(self.fail(op, path, EngineError::TimedOut(path.to_string())))
    }

    /// Lists a directory. A listing older than the configured age is
    /// refreshed in the background; one never fetched is fetched first.
    pub async fn readdir(&self, path: &str) -> AdapterResult<Vec<DirEntry>> {
        let dir = self.node("readdir", path)?;
        if !dir.is_dir() {
            return Err(Errno::NotDir);
        }
        if dir.remote_id.is_some() && self.engine.sync().is_stale(&dir) {
            if dir.refreshed_at.is_none() {
                match tokio::time::timeout(self.wait_timeout, self.engine.sync().refresh_dir(path))
                    .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(path = %path, error = %err, "listing failed; serving cached view"),
                    Err(_) => warn!(path = %path, "listing timed out; serving cached view"),
                }
            } else {
                self.refresh_in_background(dir.id, path);
            }
        }
        let children = self
            .engine
            .meta()
            .children(path)
            .map_err(|err| self.fail("readdir", path, err))?;
        Ok(children
            .iter()
            .map(|node| DirEntry {
                name: node.name.clone(),
                attr: Attr::from(node),
            })
            .collect())
    }

    fn refresh_in_background(&self, id: NodeId, path: &str) {
        let started = self
            .refreshing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        if !started {
            return;
        }
        let engine = self.engine.clone();
        let refreshing = self.refreshing.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine.sync().refresh_dir(&path).await {
                warn!(path = %path, error = %err, "background refresh failed");
            }
            refreshing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });
    }

    pub async fn create(&self, parent: &str, name: &str) -> AdapterResult<Attr> {
        self.engine
            .sync()
            .create_file(parent, name)
            .await
            .map(|node| Attr::from(&node))
            .map_err(|err| self.fail("create", &paths::join(parent, name), err))
    }

    pub async fn mkdir(&self, parent: &str, name: &str) -> AdapterResult<Attr> {
        self.engine
            .sync()
            .create_dir(parent, name)
            .await
            .map(|node| Attr::from(&node))
            .map_err(|err| self.fail("mkdir", &paths::join(parent, name), err))
    }

    pub async fn unlink(&self, path: &str) -> AdapterResult<()> {
        self.file("unlink", path)?;
        self.remove("unlink", path).await
    }

    pub async fn rmdir(&self, path: &str) -> AdapterResult<()> {
        if !self.node("rmdir", path)?.is_dir() {
            return Err(Errno::NotDir);
        }
        self.remove("rmdir", path).await
    }

    async fn remove(&self, op: &'static str, path: &str) -> AdapterResult<()> {
        self.engine
            .sync()
            .remove(path)
            .await
            .map(|_| ())
            .map_err(|err| self.fail(op, path, err))
    }

    /// Moves `from` to `to`, replacing a file or an empty directory there.
    /// Nothing changes when the move is refused.
    pub async fn rename(&self, from: &str, to: &str) -> AdapterResult<()> {
        self.engine
            .sync()
            .rename_replacing(from, to)
            .await
            .map(|_| ())
            .map_err(|err| self.fail("rename", from, err))
    }

    /// Schedules the upload of a file changed through this handle. A file
    /// in conflict cannot be uploaded until the conflict is resolved.
    pub fn flush(&self, path: &str) -> AdapterResult<()> {
        let node = self.node("flush", path)?;
        if node.state == SyncState::Conflict {
            return Err(self.fail("flush", path, EngineError::Conflict(path.to_string())));
        }
        if node.is_dir() || node.state != SyncState::Dirty {
            return Ok(());
        }
        self.engine
            .sync()
            .schedule_upload(node.id)
            .map(|_| ())
            .map_err(|err| self.fail("flush", path, err))
    }

    /// Local content is already on disk; this makes its bookkeeping durable
    /// too and queues the upload.
    pub async fn fsync(&self, path: &str) -> AdapterResult<()> {
        self.flush(path)?;
        self.engine.flush().await;
        Ok(())
    }

    pub fn statfs(&self) -> FsStats {
        let usage = self.engine.cache().usage();
        FsStats {
            budget: usage.budget,
            used: usage.used,
            files: self.engine.meta().stats().nodes as u64,
        }
    }

    pub fn state(&self, path: &str) -> AdapterResult<SyncState> {
        self.getattr(path).map(|attr| attr.state)
    }

    /// Pins or unpins `path` and everything below it.
    pub fn set_pinned(&self, path: &str, pinned: bool) -> AdapterResult<usize> {
        let sync = self.engine.sync();
        let result = if pinned { sync.pin(path) } else { sync.unpin(path) };
        result.map_err(|err| self.fail("pin", path, err))
    }
}
