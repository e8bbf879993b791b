use std::fmt;

use cloudfs_core::{EntryKind, RemoteEntry};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(1);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(NodeKind::File),
            "dir" => Some(NodeKind::Dir),
            _ => None,
        }
    }
}

impl From<EntryKind> for NodeKind {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => NodeKind::File,
            EntryKind::Dir => NodeKind::Dir,
        }
    }
}

/// Per-node position in the local/remote reconciliation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    Clean,
    Dirty,
    Uploading,
    UploadFailed,
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Clean => "clean",
            SyncState::Dirty => "dirty",
            SyncState::Uploading => "uploading",
            SyncState::UploadFailed => "upload_failed",
            SyncState::Conflict => "conflict",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clean" => Some(SyncState::Clean),
            "dirty" => Some(SyncState::Dirty),
            "uploading" => Some(SyncState::Uploading),
            "upload_failed" => Some(SyncState::UploadFailed),
            "conflict" => Some(SyncState::Conflict),
            _ => None,
        }
    }
}

/// Remote content identity at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub checksum: Option<String>,
    pub mtime: i64,
    pub size: u64,
}

impl SyncPoint {
    pub fn from_entry(entry: &RemoteEntry) -> Self {
        Self {
            checksum: entry.checksum.clone(),
            mtime: entry.mtime,
            size: entry.size,
        }
    }

    /// Checksums win when both sides have one; otherwise fall back to mtime and size.
    pub fn is_same_as(&self, other: &Self) -> bool {
        match (&self.checksum, &other.checksum) {
            (Some(left), Some(right)) => left == right,
            _ => self.mtime == other.mtime && self.size == other.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub local_mtime: i64,
    pub remote_id: Option<String>,
    pub remote_mtime: Option<i64>,
    pub remote_size: Option<u64>,
    pub checksum: Option<String>,
    /// Remote state as of the last confirmed upload or download.
    pub synced: Option<SyncPoint>,
    pub dirty: bool,
    pub pinned: bool,
    pub state: SyncState,
    pub generation: u64,
    pub last_error: Option<String>,
    pub refreshed_at: Option<i64>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        parent: Option<NodeId>,
        name: &str,
        kind: NodeKind,
        now: i64,
    ) -> Self {
        Self {
            id,
            parent,
            name: name.to_string(),
            kind,
            size: 0,
            local_mtime: now,
            remote_id: None,
            remote_mtime: None,
            remote_size: None,
            checksum: None,
            synced: None,
            dirty: false,
            pinned: false,
            state: SyncState::Clean,
            generation: 0,
            last_error: None,
            refreshed_at: None,
        }
    }

    pub(crate) fn from_remote(id: NodeId, parent: NodeId, entry: &RemoteEntry) -> Self {
        let mut node = Self::new(id, Some(parent), &entry.name, entry.kind.into(), entry.mtime);
        node.size = entry.size;
        node.remote_id = Some(entry.id.clone());
        node.remote_mtime = Some(entry.mtime);
        node.remote_size = Some(entry.size);
        node.checksum = entry.checksum.clone();
        node.synced = Some(SyncPoint::from_entry(entry));
        node
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    /// Remote state as last observed by a refresh, upload or download.
    pub fn observed_remote(&self) -> Option<SyncPoint> {
        Some(SyncPoint {
            checksum: self.checksum.clone(),
            mtime: self.remote_mtime?,
            size: self.remote_size.unwrap_or(self.size),
        })
    }

    /// Whether the node has content on the remote side worth fetching.
    pub fn has_remote_content(&self) -> bool {
        self.kind == NodeKind::File && self.remote_id.is_some() && self.remote_size.unwrap_or(0) > 0
    }

    pub(crate) fn adopt_remote(&mut self, entry: &RemoteEntry) {
        self.remote_id = Some(entry.id.clone());
        self.remote_mtime = Some(entry.mtime);
        self.remote_size = Some(entry.size);
        self.checksum = entry.checksum.clone();
    }
}
