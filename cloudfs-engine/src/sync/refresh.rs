use std::collections::{HashMap, HashSet, VecDeque};

use cloudfs_core::RemoteEntry;
use tracing::{debug, info, warn};

use super::SyncEngine;
use super::queue::RemoteOpKind;
use crate::error::EngineError;
use crate::meta::{MetaError, Node, NodeId, NodeKind, SnapshotOutcome, SyncState};
use crate::transfer::Direction;

/// What one refresh changed locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub conflicts: usize,
}

impl RefreshReport {
    fn merge(&mut self, other: RefreshReport) {
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
        self.conflicts += other.conflicts;
    }
}

impl SyncEngine {
    /// Whether a directory listing is older than the configured bound.
    pub fn is_stale(&self, node: &Node) -> bool {
        let max_age = self.dir_max_age.as_secs() as i64;
        node.refreshed_at
            .is_none_or(|at| crate::now_unix().saturating_sub(at) >= max_age)
    }

    /// Lists one remote directory and merges it into the local subtree.
    /// Directories not created remotely yet have nothing to compare against.
    pub async fn refresh_dir(&self, path: &str) -> Result<RefreshReport, EngineError> {
        let dir = self.meta.lookup(path)?;
        if !dir.is_dir() {
            return Err(MetaError::NotADirectory(path.to_string()).into());
        }
        let Some(remote_dir) = dir.remote_id.clone() else {
            return Ok(RefreshReport::default());
        };
        // Taken before listing so work that lands while the request is in
        // flight is not mistaken for remote changes.
        let before: HashMap<NodeId, Node> = self
            .meta
            .children_of(dir.id)
            .into_iter()
            .map(|node| (node.id, node))
            .collect();
        let entries = self.remote.list_children(&remote_dir).await?;
        let report = self.merge_listing(dir.id, &before, &entries).await?;
        self.meta.set_refreshed(dir.id, crate::now_unix())?;
        debug!(
            path = %path,
            entries = entries.len(),
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            conflicts = report.conflicts,
            "directory refreshed"
        );
        Ok(report)
    }

    /// Refreshes `path` and every directory below it, breadth first. Failing
    /// subdirectories are logged and skipped.
    pub async fn refresh_tree(&self, path: &str) -> Result<RefreshReport, EngineError> {
        let mut total = self.refresh_dir(path).await?;
        let root = self.meta.lookup(path)?;
        let mut pending: VecDeque<NodeId> = self.child_dirs(root.id).into();
        while let Some(id) = pending.pop_front() {
            let Some(dir_path) = self.meta.path_of(id) else {
                continue;
            };
            match self.refresh_dir(&dir_path).await {
                Ok(report) => total.merge(report),
                Err(err) => {
                    warn!(path = %dir_path, error = %err, "refresh failed");
                    continue;
                }
            }
            pending.extend(self.child_dirs(id));
        }
        Ok(total)
    }

    fn child_dirs(&self, id: NodeId) -> Vec<NodeId> {
        self.meta
            .children_of(id)
            .into_iter()
            .filter(Node::is_dir)
            .map(|node| node.id)
            .collect()
    }

    async fn merge_listing(
        &self,
        dir: NodeId,
        before: &HashMap<NodeId, Node>,
        entries: &[RemoteEntry],
    ) -> Result<RefreshReport, EngineError> {
        let mut report = RefreshReport::default();
        let mut seen = HashSet::new();
        let listed: HashSet<&str> = entries.iter().map(|entry| entry.id.as_str()).collect();

        // Known identities first, so remote renames free their old names
        // before anything is matched by path.
        let mut unmatched = Vec::new();
        for entry in entries {
            if self.meta.is_tombstoned_remote(&entry.id) {
                continue;
            }
            let Some(node) = self.meta.find_by_remote_id(&entry.id) else {
                unmatched.push(entry);
                continue;
            };
            seen.insert(node.id);
            if (node.parent != Some(dir) || node.name != entry.name)
                && !self.ops.has_pending(node.id, RemoteOpKind::Rename)
            {
                match self.meta.rename_from_remote(node.id, dir, &entry.name) {
                    Ok(_) => report.updated += 1,
                    Err(err) => {
                        warn!(node = %node.id, name = %entry.name, error = %err, "cannot follow remote rename")
                    }
                }
            }
            self.merge_entry(node.id, before, entry, &mut report)?;
        }

        for entry in unmatched {
            match self.meta.child(dir, &entry.name) {
                Some(local)
                    if local.kind == NodeKind::from(entry.kind)
                        && local
                            .remote_id
                            .as_deref()
                            .is_none_or(|id| !listed.contains(id)) =>
                {
                    seen.insert(local.id);
                    self.merge_entry(local.id, before, entry, &mut report)?;
                }
                Some(local) => {
                    seen.insert(local.id);
                    warn!(node = %local.id, name = %entry.name, "remote entry clashes with a local one");
                }
                None => match self.meta.insert_remote(dir, entry) {
                    Ok(_) => report.added += 1,
                    Err(err) => warn!(name = %entry.name, error = %err, "skipping remote entry"),
                },
            }
        }

        for child in self.meta.children_of(dir) {
            if seen.contains(&child.id) {
                continue;
            }
            let Some(previous) = before.get(&child.id) else {
                continue;
            };
            let known_remotely = previous.remote_id.is_some() && previous.remote_id == child.remote_id;
            if !known_remotely
                || previous.state == SyncState::Uploading
                || child.state == SyncState::Uploading
            {
                continue;
            }
            self.apply_remote_removal(child.id).await?;
            report.removed += 1;
        }
        Ok(report)
    }

    fn merge_entry(
        &self,
        id: NodeId,
        before: &HashMap<NodeId, Node>,
        entry: &RemoteEntry,
        report: &mut RefreshReport,
    ) -> Result<(), EngineError> {
        let Some(node) = self.meta.get(id) else {
            return Ok(());
        };
        let moved_on = before.get(&id).is_some_and(|previous| {
            previous.synced != node.synced || previous.state == SyncState::Uploading
        });
        if moved_on || node.state == SyncState::Uploading {
            return Ok(());
        }
        if node.is_dir() {
            if node.remote_id.is_none() {
                self.meta.mark_created(id, entry)?;
                report.updated += 1;
            } else {
                self.meta.apply_remote_snapshot_to(id, entry)?;
            }
            return Ok(());
        }
        let was_conflict = node.state == SyncState::Conflict;
        match self.meta.apply_remote_snapshot_to(id, entry)? {
            SnapshotOutcome::Unchanged => {}
            SnapshotOutcome::ContentChanged => {
                self.transfers.cancel(id, Direction::Download);
                self.cache.invalidate(id);
                report.updated += 1;
                if node.pinned {
                    self.fetch(id)?;
                }
            }
            SnapshotOutcome::Conflict => {
                if !was_conflict {
                    info!(node = %id, name = %node.name, "local and remote both changed");
                    report.conflicts += 1;
                }
            }
        }
        Ok(())
    }

    /// The remote side dropped `id`. Untouched subtrees go away locally;
    /// subtrees holding local changes are recreated remotely instead.
    async fn apply_remote_removal(&self, id: NodeId) -> Result<(), EngineError> {
        let subtree = self.subtree(id);
        if !subtree.iter().any(|node| node.dirty) {
            info!(node = %id, nodes = subtree.len(), "removed remotely");
            self.drop_nodes(self.meta.remove_subtree(id)).await?;
            return Ok(());
        }
        info!(node = %id, "removed remotely but changed locally; recreating");
        for node in subtree {
            if self.meta.get(node.id).is_none() {
                continue;
            }
            if node.is_dir() && self.subtree(node.id).iter().any(|inner| inner.dirty) {
                self.meta.clear_remote(node.id)?;
                self.meta.set_state(node.id, SyncState::Dirty, None)?;
                self.ops.enqueue(RemoteOpKind::Mkdir, node.id, None);
            } else if node.dirty {
                self.meta.clear_remote(node.id)?;
                if node.state == SyncState::Conflict {
                    self.meta.set_state(node.id, SyncState::Dirty, None)?;
                }
            } else {
                self.drop_nodes(self.meta.remove_subtree(node.id)).await?;
            }
        }
        Ok(())
    }

    async fn drop_nodes(&self, nodes: Vec<NodeId>) -> Result<(), EngineError> {
        for node in nodes {
            self.transfers.discard(node);
            self.cache.drop_node(node).await?;
        }
        Ok(())
    }
}
