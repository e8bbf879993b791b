//! Local mirror of the remote tree.
//!
//! Nodes live in one table keyed by [`NodeId`]; paths, children and remote
//! identifiers are secondary indexes rebuilt from it. Every mutation happens
//! under a single short write lock and is journalled while that lock is held,
//! so readers and the persister never see a half-applied change.

mod locks;
mod node;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cloudfs_core::RemoteEntry;
use thiserror::Error;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::paths::{self, PathError};
use crate::persist::{Journal, JournalEntry};
use crate::sync::conflict::{Divergence, classify};

pub use locks::DirGuards;
use locks::{DirLocks, NodeLocks};
pub use node::{Node, NodeId, NodeKind, SyncPoint, SyncState};

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("no such entry: {0}")]
    NotFound(String),
    #[error("entry already exists: {0}")]
    NameExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("cannot move {0} below itself")]
    IntoSelf(String),
    #[error("the root directory cannot be renamed or removed")]
    Root,
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

impl MetaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::NotFound(_) | MetaError::UnknownNode(_) => ErrorKind::NotFound,
            MetaError::NameExists(_) => ErrorKind::NameExists,
            MetaError::NotADirectory(_) => ErrorKind::NotADirectory,
            MetaError::IsADirectory(_) => ErrorKind::IsADirectory,
            MetaError::NotEmpty(_) => ErrorKind::NotEmpty,
            MetaError::IntoSelf(_) | MetaError::Root | MetaError::Path(_) => {
                ErrorKind::InvalidName
            }
        }
    }
}

/// What a remote snapshot did to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Unchanged,
    /// Clean node took the remote content; cached bytes are stale.
    ContentChanged,
    Conflict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaStats {
    pub nodes: usize,
    pub tombstones: usize,
    pub clean: usize,
    pub dirty: usize,
    pub uploading: usize,
    pub upload_failed: usize,
    pub conflict: usize,
    pub pinned: usize,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<NodeId, Node>,
    children: HashMap<NodeId, BTreeMap<String, NodeId>>,
    paths: HashMap<NodeId, String>,
    by_path: HashMap<String, NodeId>,
    by_remote: HashMap<String, NodeId>,
    tombstones: HashMap<NodeId, Node>,
    next_id: u64,
}

impl Tree {
    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn id_at(&self, path: &str) -> Result<NodeId, MetaError> {
        self.by_path
            .get(path)
            .copied()
            .ok_or_else(|| MetaError::NotFound(path.to_string()))
    }

    fn node(&self, id: NodeId) -> Result<&Node, MetaError> {
        self.nodes.get(&id).ok_or(MetaError::UnknownNode(id))
    }

    fn dir_at(&self, path: &str) -> Result<NodeId, MetaError> {
        let id = self.id_at(path)?;
        if !self.node(id)?.is_dir() {
            return Err(MetaError::NotADirectory(path.to_string()));
        }
        Ok(id)
    }

    fn insert(&mut self, node: Node, path: String) {
        let id = node.id;
        if let Some(parent) = node.parent {
            self.children
                .entry(parent)
                .or_default()
                .insert(node.name.clone(), id);
        }
        if node.is_dir() {
            self.children.entry(id).or_default();
        }
        if let Some(remote_id) = &node.remote_id {
            self.by_remote.insert(remote_id.clone(), id);
        }
        self.by_path.insert(path.clone(), id);
        self.paths.insert(id, path);
        self.nodes.insert(id, node);
    }

    fn detach(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        if let Some(parent) = node.parent
            && let Some(siblings) = self.children.get_mut(&parent)
        {
            siblings.remove(&node.name);
        }
        self.children.remove(&id);
        if let Some(path) = self.paths.remove(&id) {
            self.by_path.remove(&path);
        }
        if let Some(remote_id) = &node.remote_id
            && self.by_remote.get(remote_id) == Some(&id)
        {
            self.by_remote.remove(remote_id);
        }
        Some(node)
    }

    /// Rewrites the path index for `id` and everything below it.
    fn reindex(&mut self, id: NodeId, path: String) {
        let mut pending = VecDeque::from([(id, path)]);
        while let Some((current, path)) = pending.pop_front() {
            if let Some(old) = self.paths.insert(current, path.clone()) {
                if self.by_path.get(&old) == Some(&current) {
                    self.by_path.remove(&old);
                }
            }
            self.by_path.insert(path.clone(), current);
            if let Some(children) = self.children.get(&current) {
                for (name, child) in children {
                    pending.push_back((*child, paths::join(&path, name)));
                }
            }
        }
    }

    fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut pending = VecDeque::from([id]);
        while let Some(current) = pending.pop_front() {
            if let Some(children) = self.children.get(&current) {
                for child in children.values() {
                    out.push(*child);
                    pending.push_back(*child);
                }
            }
        }
        out
    }
}

pub struct MetadataStore {
    tree: RwLock<Tree>,
    node_locks: NodeLocks,
    dir_locks: DirLocks,
    journal: Journal,
}

impl MetadataStore {
    pub fn new(root_remote_id: &str, journal: Journal) -> Self {
        let mut tree = Tree {
            next_id: NodeId::ROOT.0 + 1,
            ..Tree::default()
        };
        let root = root_node(root_remote_id);
        journal.record(JournalEntry::Node {
            node: root.clone(),
            tombstone: false,
        });
        tree.insert(root, "/".to_string());
        Self::with_tree(tree, journal)
    }

    /// Rebuilds the tree from persisted records. Records whose parent chain
    /// does not reach the root are dropped.
    pub fn restore(root_remote_id: &str, records: Vec<(Node, bool)>, journal: Journal) -> Self {
        let mut tree = Tree::default();
        let mut by_parent: HashMap<NodeId, Vec<Node>> = HashMap::new();
        let mut root = None;
        let mut max_id = NodeId::ROOT.0;
        for (mut node, tombstone) in records {
            max_id = max_id.max(node.id.0);
            if node.state == SyncState::Uploading {
                node.state = SyncState::Dirty;
            }
            if tombstone {
                tree.tombstones.insert(node.id, node);
            } else if node.id == NodeId::ROOT {
                root = Some(node);
            } else if let Some(parent) = node.parent {
                by_parent.entry(parent).or_default().push(node);
            }
        }
        let mut root = root.unwrap_or_else(|| root_node(root_remote_id));
        root.remote_id = Some(root_remote_id.to_string());
        journal.record(JournalEntry::Node {
            node: root.clone(),
            tombstone: false,
        });
        tree.insert(root, "/".to_string());

        let mut pending = VecDeque::from([(NodeId::ROOT, "/".to_string())]);
        while let Some((parent, parent_path)) = pending.pop_front() {
            for node in by_parent.remove(&parent).unwrap_or_default() {
                let path = paths::join(&parent_path, &node.name);
                if tree.by_path.contains_key(&path) {
                    warn!(node = %node.id, path = %path, "dropping duplicate node while restoring");
                    journal.record(JournalEntry::NodeRemoved(node.id));
                    continue;
                }
                if node.is_dir() {
                    pending.push_back((node.id, path.clone()));
                }
                tree.insert(node, path);
            }
        }
        for orphan in by_parent.into_values().flatten() {
            warn!(node = %orphan.id, name = %orphan.name, "dropping orphaned node");
            journal.record(JournalEntry::NodeRemoved(orphan.id));
        }
        tree.next_id = max_id + 1;
        debug!(
            nodes = tree.nodes.len(),
            tombstones = tree.tombstones.len(),
            "metadata restored"
        );
        Self::with_tree(tree, journal)
    }

    fn with_tree(tree: Tree, journal: Journal) -> Self {
        Self {
            tree: RwLock::new(tree),
            node_locks: NodeLocks::default(),
            dir_locks: DirLocks::default(),
            journal,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, node: &Node) {
        self.journal.record(JournalEntry::Node {
            node: node.clone(),
            tombstone: false,
        });
    }

    /// Applies `change` to a live node, keeping the remote index in step.
    fn modify(&self, id: NodeId, change: impl FnOnce(&mut Node)) -> Result<Node, MetaError> {
        let mut tree = self.write();
        let node = tree.nodes.get_mut(&id).ok_or(MetaError::UnknownNode(id))?;
        let before = node.remote_id.clone();
        change(node);
        let updated = node.clone();
        if before != updated.remote_id {
            if let Some(old) = before
                && tree.by_remote.get(&old) == Some(&id)
            {
                tree.by_remote.remove(&old);
            }
            if let Some(new) = &updated.remote_id {
                tree.by_remote.insert(new.clone(), id);
            }
        }
        self.persist(&updated);
        Ok(updated)
    }

    pub fn lookup(&self, path: &str) -> Result<Node, MetaError> {
        let path = paths::normalize(path)?;
        let tree = self.read();
        let id = tree.id_at(&path)?;
        Ok(tree.node(id)?.clone())
    }

    /// Resolves several paths against one consistent view of the tree.
    pub fn lookup_all(&self, paths: &[&str]) -> Vec<Option<NodeId>> {
        let tree = self.read();
        paths
            .iter()
            .map(|path| {
                paths::normalize(path)
                    .ok()
                    .and_then(|path| tree.by_path.get(&path).copied())
            })
            .collect()
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.read().nodes.get(&id).cloned()
    }

    pub fn require(&self, id: NodeId) -> Result<Node, MetaError> {
        self.get(id).ok_or(MetaError::UnknownNode(id))
    }

    pub fn tombstone(&self, id: NodeId) -> Option<Node> {
        self.read().tombstones.get(&id).cloned()
    }

    pub fn path_of(&self, id: NodeId) -> Option<String> {
        self.read().paths.get(&id).cloned()
    }

    /// Children as of the most recent refresh, ordered by name.
    pub fn children(&self, path: &str) -> Result<Vec<Node>, MetaError> {
        let path = paths::normalize(path)?;
        let tree = self.read();
        let id = tree.dir_at(&path)?;
        Ok(collect_children(&tree, id))
    }

    pub fn children_of(&self, id: NodeId) -> Vec<Node> {
        collect_children(&self.read(), id)
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<Node> {
        let tree = self.read();
        let id = tree.children.get(&parent)?.get(name)?;
        tree.nodes.get(id).cloned()
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<Node> {
        let tree = self.read();
        let id = tree.by_remote.get(remote_id)?;
        tree.nodes.get(id).cloned()
    }

    pub fn is_tombstoned_remote(&self, remote_id: &str) -> bool {
        self.read()
            .tombstones
            .values()
            .any(|node| node.remote_id.as_deref() == Some(remote_id))
    }

    pub fn node_lock(&self, id: NodeId) -> Arc<AsyncRwLock<()>> {
        self.node_locks.get(&id)
    }

    pub async fn lock_dirs(&self, paths: &[&str]) -> DirGuards {
        self.dir_locks.lock(paths).await
    }

    pub async fn create(
        &self,
        parent_path: &str,
        name: &str,
        kind: NodeKind,
    ) -> Result<Node, MetaError> {
        let parent_path = paths::normalize(parent_path)?;
        paths::validate_name(name)?;
        let _guards = self.lock_dirs(&[&parent_path]).await;
        let mut tree = self.write();
        let parent = tree.dir_at(&parent_path)?;
        let path = paths::join(&parent_path, name);
        if tree.by_path.contains_key(&path) {
            return Err(MetaError::NameExists(path));
        }
        let id = tree.alloc_id();
        let mut node = Node::new(id, Some(parent), name, kind, crate::now_unix());
        node.dirty = true;
        node.state = SyncState::Dirty;
        self.persist(&node);
        tree.insert(node.clone(), path);
        Ok(node)
    }

    /// Adds a node first seen in a remote listing.
    pub(crate) fn insert_remote(
        &self,
        parent: NodeId,
        entry: &RemoteEntry,
    ) -> Result<Node, MetaError> {
        paths::validate_name(&entry.name)?;
        let mut tree = self.write();
        let parent_path = tree
            .paths
            .get(&parent)
            .cloned()
            .ok_or(MetaError::UnknownNode(parent))?;
        let path = paths::join(&parent_path, &entry.name);
        if tree.by_path.contains_key(&path) {
            return Err(MetaError::NameExists(path));
        }
        let id = tree.alloc_id();
        let node = Node::from_remote(id, parent, entry);
        self.persist(&node);
        tree.insert(node.clone(), path);
        Ok(node)
    }

    /// Local copy next to `source` holding its current content, used when
    /// both sides of a conflict are kept.
    pub(crate) fn create_conflict_copy(&self, source: NodeId, name: &str) -> Result<Node, MetaError> {
        paths::validate_name(name)?;
        let mut tree = self.write();
        let original = tree.node(source)?.clone();
        let parent = original.parent.ok_or(MetaError::Root)?;
        let parent_path = tree
            .paths
            .get(&parent)
            .cloned()
            .ok_or(MetaError::UnknownNode(parent))?;
        let path = paths::join(&parent_path, name);
        if tree.by_path.contains_key(&path) {
            return Err(MetaError::NameExists(path));
        }
        let id = tree.alloc_id();
        let mut copy = Node::new(id, Some(parent), name, original.kind, original.local_mtime);
        copy.size = original.size;
        copy.dirty = true;
        copy.state = SyncState::Dirty;
        copy.generation = 1;
        self.persist(&copy);
        tree.insert(copy.clone(), path);
        Ok(copy)
    }

    /// Moves a node. Both parent directories are locked in path order, and
    /// the table update itself happens in one critical section.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<Node, MetaError> {
        self.relocate(old_path, new_path, false)
            .await
            .map(|(node, _)| node)
    }

    /// Like [`rename`](Self::rename), but an existing file at `new_path`, or
    /// an empty directory when the source is a directory, is removed in the
    /// same critical section. The displaced node is returned with the moved one.
    pub async fn rename_replacing(
        &self,
        old_path: &str,
        new_path: &str,
    ) -> Result<(Node, Option<Node>), MetaError> {
        self.relocate(old_path, new_path, true).await
    }

    async fn relocate(
        &self,
        old_path: &str,
        new_path: &str,
        replace: bool,
    ) -> Result<(Node, Option<Node>), MetaError> {
        let old_path = paths::normalize(old_path)?;
        let new_path = paths::normalize(new_path)?;
        let (old_parent, _) = paths::split(&old_path).ok_or(MetaError::Root)?;
        let (new_parent, new_name) = paths::split(&new_path).ok_or(MetaError::Root)?;
        paths::validate_name(new_name)?;
        let _guards = self.lock_dirs(&[old_parent, new_parent]).await;

        let mut tree = self.write();
        let id = tree.id_at(&old_path)?;
        if old_path == new_path {
            return Ok((tree.node(id)?.clone(), None));
        }
        let parent = tree.dir_at(new_parent)?;
        if paths::is_within(&new_path, &old_path) {
            return Err(MetaError::IntoSelf(old_path));
        }
        let displaced = match tree.by_path.get(&new_path).copied() {
            None => None,
            Some(_) if !replace => return Err(MetaError::NameExists(new_path)),
            Some(target) => {
                let source_dir = tree.node(id)?.is_dir();
                let target_dir = tree.node(target)?.is_dir();
                match (source_dir, target_dir) {
                    (false, true) => return Err(MetaError::IsADirectory(new_path)),
                    (true, false) => return Err(MetaError::NotADirectory(new_path)),
                    _ => {}
                }
                if tree.children.get(&target).is_some_and(|children| !children.is_empty()) {
                    return Err(MetaError::NotEmpty(new_path));
                }
                Some(self.bury(&mut tree, target)?)
            }
        };

        let (old_parent_id, old_name) = {
            let node = tree.node(id)?;
            (node.parent, node.name.clone())
        };
        if let Some(old_parent_id) = old_parent_id
            && let Some(siblings) = tree.children.get_mut(&old_parent_id)
        {
            siblings.remove(&old_name);
        }
        tree.children
            .entry(parent)
            .or_default()
            .insert(new_name.to_string(), id);
        let node = tree.nodes.get_mut(&id).ok_or(MetaError::UnknownNode(id))?;
        node.parent = Some(parent);
        node.name = new_name.to_string();
        let updated = node.clone();
        tree.reindex(id, new_path.clone());
        self.persist(&updated);
        debug!(
            node = %id,
            from = %old_path,
            to = %new_path,
            replaced = ?displaced.as_ref().map(|node| node.id),
            "renamed"
        );
        Ok((updated, displaced))
    }

    /// Applies a rename observed on the remote side.
    pub(crate) fn rename_from_remote(
        &self,
        id: NodeId,
        parent: NodeId,
        name: &str,
    ) -> Result<Node, MetaError> {
        paths::validate_name(name)?;
        let mut tree = self.write();
        let parent_path = tree
            .paths
            .get(&parent)
            .cloned()
            .ok_or(MetaError::UnknownNode(parent))?;
        let path = paths::join(&parent_path, name);
        if parent == id || tree.descendants(id).contains(&parent) {
            let current = tree.paths.get(&id).cloned().unwrap_or_default();
            return Err(MetaError::IntoSelf(current));
        }
        if tree.by_path.contains_key(&path) {
            return Err(MetaError::NameExists(path));
        }
        let node = tree.node(id)?.clone();
        if let Some(old_parent) = node.parent
            && let Some(siblings) = tree.children.get_mut(&old_parent)
        {
            siblings.remove(&node.name);
        }
        tree.children
            .entry(parent)
            .or_default()
            .insert(name.to_string(), id);
        let node = tree.nodes.get_mut(&id).ok_or(MetaError::UnknownNode(id))?;
        node.parent = Some(parent);
        node.name = name.to_string();
        let updated = node.clone();
        tree.reindex(id, path);
        self.persist(&updated);
        Ok(updated)
    }

    pub fn mark_dirty(&self, path: &str) -> Result<Node, MetaError> {
        let id = self.lookup(path)?.id;
        self.record_write(id, None)
    }

    /// Bumps the write generation; `size` replaces the logical size when set.
    pub fn record_write(&self, id: NodeId, size: Option<u64>) -> Result<Node, MetaError> {
        self.modify(id, |node| {
            node.dirty = true;
            node.generation += 1;
            node.local_mtime = crate::now_unix();
            if let Some(size) = size {
                node.size = size;
            }
            if node.state == SyncState::Clean {
                node.state = SyncState::Dirty;
            }
        })
    }

    pub fn apply_remote_snapshot(
        &self,
        path: &str,
        entry: &RemoteEntry,
    ) -> Result<SnapshotOutcome, MetaError> {
        let id = self.lookup(path)?.id;
        self.apply_remote_snapshot_to(id, entry)
    }

    /// Merges remote attributes. A dirty node keeps its content fields; only
    /// what it knows about the remote side moves forward.
    pub fn apply_remote_snapshot_to(
        &self,
        id: NodeId,
        entry: &RemoteEntry,
    ) -> Result<SnapshotOutcome, MetaError> {
        let mut outcome = SnapshotOutcome::Unchanged;
        self.modify(id, |node| {
            node.adopt_remote(entry);
            if node.is_dir() {
                return;
            }
            let remote = SyncPoint::from_entry(entry);
            match classify(node.synced.as_ref(), node.dirty, &remote) {
                Divergence::InSync | Divergence::LocalAhead => {}
                Divergence::RemoteAhead => {
                    node.size = entry.size;
                    node.local_mtime = entry.mtime;
                    node.synced = Some(remote);
                    node.state = SyncState::Clean;
                    outcome = SnapshotOutcome::ContentChanged;
                }
                Divergence::Both => {
                    node.state = SyncState::Conflict;
                    outcome = SnapshotOutcome::Conflict;
                }
            }
        })?;
        Ok(outcome)
    }

    pub fn set_state(
        &self,
        id: NodeId,
        state: SyncState,
        last_error: Option<String>,
    ) -> Result<Node, MetaError> {
        self.modify(id, |node| {
            node.state = state;
            node.last_error = last_error;
        })
    }

    /// Records a finished upload of `generation`. Returns true when the node
    /// is clean afterwards; a newer local write keeps it dirty.
    pub fn mark_synced(
        &self,
        id: NodeId,
        entry: &RemoteEntry,
        generation: u64,
    ) -> Result<bool, MetaError> {
        let mut clean = false;
        self.modify(id, |node| {
            node.adopt_remote(entry);
            node.synced = Some(SyncPoint::from_entry(entry));
            node.last_error = None;
            if node.state == SyncState::Conflict {
                return;
            }
            if node.generation == generation {
                node.dirty = false;
                node.state = SyncState::Clean;
                clean = true;
            } else if node.state == SyncState::Uploading {
                node.state = SyncState::Dirty;
            }
        })?;
        Ok(clean)
    }

    /// A directory that now exists remotely.
    pub(crate) fn mark_created(&self, id: NodeId, entry: &RemoteEntry) -> Result<Node, MetaError> {
        self.modify(id, |node| {
            node.adopt_remote(entry);
            node.synced = Some(SyncPoint::from_entry(entry));
            node.dirty = false;
            node.state = SyncState::Clean;
            node.last_error = None;
        })
    }

    /// Forgets the remote identity so the next upload creates the file anew.
    pub(crate) fn clear_remote(&self, id: NodeId) -> Result<Node, MetaError> {
        self.modify(id, |node| {
            node.remote_id = None;
            node.remote_mtime = None;
            node.remote_size = None;
            node.checksum = None;
            node.synced = None;
        })
    }

    /// Keeps local content but treats the observed remote as the new base.
    pub(crate) fn accept_remote_base(&self, id: NodeId) -> Result<Node, MetaError> {
        self.modify(id, |node| {
            node.synced = node.observed_remote();
            node.dirty = true;
            node.state = SyncState::Dirty;
        })
    }

    /// Drops local changes in favour of the observed remote state.
    pub(crate) fn reset_to_remote(&self, id: NodeId) -> Result<Node, MetaError> {
        self.modify(id, |node| {
            if let Some(remote) = node.observed_remote() {
                node.size = remote.size;
                node.local_mtime = remote.mtime;
                node.synced = Some(remote);
            }
            node.dirty = false;
            node.generation += 1;
            node.state = SyncState::Clean;
            node.last_error = None;
        })
    }

    pub fn set_pinned(&self, path: &str, pinned: bool) -> Result<Node, MetaError> {
        let id = self.lookup(path)?.id;
        self.modify(id, |node| node.pinned = pinned)
    }

    pub(crate) fn set_refreshed(&self, id: NodeId, at: i64) -> Result<Node, MetaError> {
        self.modify(id, |node| node.refreshed_at = Some(at))
    }

    /// Detaches an empty directory or a file from the tree. Nodes the remote
    /// knows about stay behind as tombstones until [`purge`](Self::purge).
    pub async fn remove(&self, path: &str) -> Result<Node, MetaError> {
        let path = paths::normalize(path)?;
        let (parent_path, _) = paths::split(&path).ok_or(MetaError::Root)?;
        let _guards = self.lock_dirs(&[parent_path]).await;
        let mut tree = self.write();
        let id = tree.id_at(&path)?;
        if tree.children.get(&id).is_some_and(|children| !children.is_empty()) {
            return Err(MetaError::NotEmpty(path));
        }
        self.bury(&mut tree, id)
    }

    /// Detaches `id`; nodes the remote knows about become tombstones.
    fn bury(&self, tree: &mut Tree, id: NodeId) -> Result<Node, MetaError> {
        let node = tree.detach(id).ok_or(MetaError::UnknownNode(id))?;
        if node.remote_id.is_some() {
            self.journal.record(JournalEntry::Node {
                node: node.clone(),
                tombstone: true,
            });
            tree.tombstones.insert(id, node.clone());
        } else {
            self.journal.record(JournalEntry::NodeRemoved(id));
        }
        Ok(node)
    }

    /// Drops a node and everything below it after a confirmed remote deletion.
    pub(crate) fn remove_subtree(&self, id: NodeId) -> Vec<NodeId> {
        if id == NodeId::ROOT {
            return Vec::new();
        }
        let mut tree = self.write();
        let mut removed = tree.descendants(id);
        removed.reverse();
        removed.push(id);
        for node in &removed {
            tree.detach(*node);
            self.journal.record(JournalEntry::NodeRemoved(*node));
        }
        removed
    }

    /// Forgets a tombstone once the remote deletion is confirmed.
    pub fn purge(&self, id: NodeId) {
        let mut tree = self.write();
        if tree.tombstones.remove(&id).is_some() {
            self.journal.record(JournalEntry::NodeRemoved(id));
        }
    }

    pub fn nodes_in_state(&self, state: SyncState) -> Vec<Node> {
        let mut out: Vec<Node> = self
            .read()
            .nodes
            .values()
            .filter(|node| node.state == state)
            .cloned()
            .collect();
        out.sort_by_key(|node| node.id);
        out
    }

    pub fn dirty_nodes(&self) -> Vec<Node> {
        self.nodes_in_state(SyncState::Dirty)
    }

    pub fn conflicts(&self) -> Vec<Node> {
        self.nodes_in_state(SyncState::Conflict)
    }

    pub fn pinned_nodes(&self) -> Vec<Node> {
        let mut out: Vec<Node> = self
            .read()
            .nodes
            .values()
            .filter(|node| node.pinned)
            .cloned()
            .collect();
        out.sort_by_key(|node| node.id);
        out
    }

    /// Directory ids at and below `id`, parents before children.
    pub fn dirs_under(&self, id: NodeId) -> Vec<NodeId> {
        let tree = self.read();
        let mut out = vec![id];
        out.extend(
            tree.descendants(id)
                .into_iter()
                .filter(|child| tree.nodes.get(child).is_some_and(Node::is_dir)),
        );
        out
    }

    /// Dirty or pinned nodes must keep their cached content.
    pub fn is_protected(&self, id: NodeId) -> bool {
        self.read()
            .nodes
            .get(&id)
            .is_some_and(|node| node.dirty || node.pinned)
    }

    pub fn stats(&self) -> MetaStats {
        let tree = self.read();
        let mut stats = MetaStats {
            nodes: tree.nodes.len(),
            tombstones: tree.tombstones.len(),
            ..MetaStats::default()
        };
        for node in tree.nodes.values() {
            match node.state {
                SyncState::Clean => stats.clean += 1,
                SyncState::Dirty => stats.dirty += 1,
                SyncState::Uploading => stats.uploading += 1,
                SyncState::UploadFailed => stats.upload_failed += 1,
                SyncState::Conflict => stats.conflict += 1,
            }
            if node.pinned {
                stats.pinned += 1;
            }
        }
        stats
    }

    pub fn tombstones(&self) -> Vec<Node> {
        self.read().tombstones.values().cloned().collect()
    }
}

fn root_node(remote_id: &str) -> Node {
    let mut root = Node::new(NodeId::ROOT, None, "", NodeKind::Dir, crate::now_unix());
    root.remote_id = Some(remote_id.to_string());
    root
}

fn collect_children(tree: &Tree, id: NodeId) -> Vec<Node> {
    tree.children
        .get(&id)
        .map(|children| {
            children
                .values()
                .filter_map(|child| tree.nodes.get(child).cloned())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "meta_tests.rs"]
mod tests;
