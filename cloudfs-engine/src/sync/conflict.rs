use crate::config::ConflictPolicy;
use crate::meta::SyncPoint;

/// How local and remote have moved relative to the last sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    InSync,
    LocalAhead,
    RemoteAhead,
    Both,
}

pub fn classify(base: Option<&SyncPoint>, local_changed: bool, remote: &SyncPoint) -> Divergence {
    let remote_changed = match base {
        Some(base) => !remote.is_same_as(base),
        // Never synced: any remote content counts as news.
        None => true,
    };
    match (local_changed, remote_changed) {
        (false, false) => Divergence::InSync,
        (true, false) => Divergence::LocalAhead,
        (false, true) => Divergence::RemoteAhead,
        (true, true) => Divergence::Both,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Local content wins and is uploaded over the remote copy.
    UploadLocal,
    /// Remote content wins; local changes are discarded.
    AdoptRemote,
    /// Local content moves to a sibling named `renamed_local`.
    KeepBoth { renamed_local: String },
}

pub fn resolve(policy: ConflictPolicy, name: &str, stamp: i64) -> Resolution {
    match policy {
        ConflictPolicy::PreferLocal => Resolution::UploadLocal,
        ConflictPolicy::PreferRemote => Resolution::AdoptRemote,
        ConflictPolicy::KeepBoth => Resolution::KeepBoth {
            renamed_local: conflict_name(name, stamp),
        },
    }
}

pub fn conflict_name(name: &str, stamp: i64) -> String {
    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{stem} (conflict {stamp}).{ext}");
    }
    format!("{name} (conflict {stamp})")
}
