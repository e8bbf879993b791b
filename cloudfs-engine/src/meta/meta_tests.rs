use std::sync::Arc;

use cloudfs_core::EntryKind;

use super::*;

fn store() -> MetadataStore {
    MetadataStore::new("root", Journal::disabled())
}

fn remote_file(id: &str, name: &str, checksum: &str, mtime: i64, size: u64) -> RemoteEntry {
    RemoteEntry {
        id: id.to_string(),
        name: name.to_string(),
        kind: EntryKind::File,
        size,
        mtime,
        checksum: Some(checksum.to_string()),
    }
}

#[tokio::test]
async fn create_then_lookup() {
    let store = store();
    let dir = store.create("/", "a", NodeKind::Dir).await.unwrap();
    let file = store.create("/a", "b.txt", NodeKind::File).await.unwrap();

    assert_eq!(store.lookup("/a/b.txt").unwrap().id, file.id);
    assert_eq!(file.parent, Some(dir.id));
    assert_eq!(file.state, SyncState::Dirty);
    assert_eq!(store.path_of(file.id).as_deref(), Some("/a/b.txt"));
    let names: Vec<_> = store
        .children("/a")
        .unwrap()
        .into_iter()
        .map(|node| node.name)
        .collect();
    assert_eq!(names, vec!["b.txt"]);
}

#[tokio::test]
async fn create_rejects_duplicates_and_file_parents() {
    let store = store();
    store.create("/", "a.txt", NodeKind::File).await.unwrap();

    let err = store.create("/", "a.txt", NodeKind::File).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameExists);
    let err = store
        .create("/a.txt", "child", NodeKind::File)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotADirectory);
    let err = store.create("/", "bad/name", NodeKind::File).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidName);
    assert!(matches!(store.lookup("/missing"), Err(MetaError::NotFound(_))));
}

#[tokio::test]
async fn rename_moves_whole_subtree() {
    let store = store();
    store.create("/", "a", NodeKind::Dir).await.unwrap();
    store.create("/a", "inner", NodeKind::Dir).await.unwrap();
    let leaf = store.create("/a/inner", "f.txt", NodeKind::File).await.unwrap();
    store.create("/", "b", NodeKind::Dir).await.unwrap();

    store.rename("/a", "/b/moved").await.unwrap();

    assert!(store.lookup("/a").is_err());
    assert!(store.lookup("/a/inner/f.txt").is_err());
    assert_eq!(store.lookup("/b/moved/inner/f.txt").unwrap().id, leaf.id);
    assert_eq!(
        store.path_of(leaf.id).as_deref(),
        Some("/b/moved/inner/f.txt")
    );
}

#[tokio::test]
async fn rename_refuses_existing_target_and_own_subtree() {
    let store = store();
    store.create("/", "a", NodeKind::Dir).await.unwrap();
    store.create("/", "b.txt", NodeKind::File).await.unwrap();

    let err = store.rename("/b.txt", "/a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameExists);
    let err = store.rename("/a", "/a/deeper").await.unwrap_err();
    assert!(matches!(err, MetaError::IntoSelf(_)));
    let err = store.rename("/missing", "/x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(store.lookup("/b.txt").is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rename_is_never_observed_half_done() {
    let store = Arc::new(store());
    let node = store.create("/", "left", NodeKind::File).await.unwrap();

    let mover = {
        let store = store.clone();
        tokio::spawn(async move {
            for round in 0..200 {
                let (from, to) = if round % 2 == 0 {
                    ("/left", "/right")
                } else {
                    ("/right", "/left")
                };
                store.rename(from, to).await.unwrap();
            }
        })
    };
    let observer = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..2000 {
                let seen = store.lookup_all(&["/left", "/right"]);
                let hits = seen.iter().flatten().count();
                assert_eq!(hits, 1, "saw {seen:?}");
                assert!(seen.iter().flatten().all(|id| *id == node.id));
                tokio::task::yield_now().await;
            }
        })
    };
    mover.await.unwrap();
    observer.await.unwrap();
}

#[tokio::test]
async fn writes_bump_generation_and_dirty_the_node() {
    let store = store();
    let root = store.lookup("/").unwrap();
    let node = store
        .insert_remote(root.id, &remote_file("r1", "doc.txt", "aa", 10, 3))
        .unwrap();
    assert_eq!(node.state, SyncState::Clean);

    let dirty = store.mark_dirty("/doc.txt").unwrap();
    assert!(dirty.dirty);
    assert_eq!(dirty.state, SyncState::Dirty);
    assert_eq!(dirty.generation, node.generation + 1);

    let grown = store.record_write(node.id, Some(99)).unwrap();
    assert_eq!(grown.size, 99);
    assert_eq!(grown.generation, node.generation + 2);
}

#[tokio::test]
async fn snapshot_updates_clean_nodes() {
    let store = store();
    let root = store.lookup("/").unwrap();
    store
        .insert_remote(root.id, &remote_file("r1", "doc.txt", "aa", 10, 3))
        .unwrap();

    let outcome = store
        .apply_remote_snapshot("/doc.txt", &remote_file("r1", "doc.txt", "bb", 20, 7))
        .unwrap();

    assert_eq!(outcome, SnapshotOutcome::ContentChanged);
    let node = store.lookup("/doc.txt").unwrap();
    assert_eq!(node.size, 7);
    assert_eq!(node.state, SyncState::Clean);
    assert_eq!(node.synced.unwrap().checksum.as_deref(), Some("bb"));
}

#[tokio::test]
async fn snapshot_never_touches_dirty_content() {
    let store = store();
    let root = store.lookup("/").unwrap();
    let node = store
        .insert_remote(root.id, &remote_file("r1", "doc.txt", "aa", 10, 3))
        .unwrap();
    store.record_write(node.id, Some(5)).unwrap();

    let same = store
        .apply_remote_snapshot("/doc.txt", &remote_file("r1", "doc.txt", "aa", 10, 3))
        .unwrap();
    assert_eq!(same, SnapshotOutcome::Unchanged);
    assert_eq!(store.lookup("/doc.txt").unwrap().state, SyncState::Dirty);

    let changed = store
        .apply_remote_snapshot("/doc.txt", &remote_file("r1", "doc.txt", "cc", 30, 9))
        .unwrap();
    assert_eq!(changed, SnapshotOutcome::Conflict);
    let node = store.lookup("/doc.txt").unwrap();
    assert_eq!(node.state, SyncState::Conflict);
    assert_eq!(node.size, 5);
    assert_eq!(node.remote_size, Some(9));
    assert_eq!(node.checksum.as_deref(), Some("cc"));
    assert_eq!(node.synced.unwrap().checksum.as_deref(), Some("aa"));
    assert_eq!(store.conflicts().len(), 1);
}

#[tokio::test]
async fn upload_of_stale_generation_keeps_node_dirty() {
    let store = store();
    let node = store.create("/", "a.txt", NodeKind::File).await.unwrap();
    let first = store.record_write(node.id, Some(5)).unwrap();
    store.set_state(node.id, SyncState::Uploading, None).unwrap();
    store.record_write(node.id, Some(6)).unwrap();

    let entry = remote_file("r9", "a.txt", "x", 1, 5);
    assert!(!store.mark_synced(node.id, &entry, first.generation).unwrap());
    let node = store.require(node.id).unwrap();
    assert_eq!(node.state, SyncState::Dirty);
    assert_eq!(node.remote_id.as_deref(), Some("r9"));
    assert_eq!(store.find_by_remote_id("r9").unwrap().id, node.id);

    assert!(store.mark_synced(node.id, &entry, node.generation).unwrap());
    assert_eq!(store.require(node.id).unwrap().state, SyncState::Clean);
}

#[tokio::test]
async fn remove_keeps_tombstone_until_purged() {
    let store = store();
    let root = store.lookup("/").unwrap();
    let shared = store
        .insert_remote(
            root.id,
            &RemoteEntry {
                id: "d1".into(),
                name: "shared.bin".into(),
                kind: EntryKind::File,
                size: 0,
                mtime: 1,
                checksum: None,
            },
        )
        .unwrap();
    let local = store.create("/", "local.txt", NodeKind::File).await.unwrap();

    let removed = store.remove("/shared.bin").await.unwrap();
    assert_eq!(removed.id, shared.id);
    assert!(store.lookup("/shared.bin").is_err());
    assert!(store.is_tombstoned_remote("d1"));
    store.purge(shared.id);
    assert!(!store.is_tombstoned_remote("d1"));

    store.remove("/local.txt").await.unwrap();
    assert!(store.tombstone(local.id).is_none());
}

#[tokio::test]
async fn remove_refuses_non_empty_directories() {
    let store = store();
    store.create("/", "d", NodeKind::Dir).await.unwrap();
    store.create("/d", "f", NodeKind::File).await.unwrap();

    let err = store.remove("/d").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEmpty);
    assert!(matches!(store.remove("/").await, Err(MetaError::Root)));
}

#[tokio::test]
async fn remote_subtree_removal_drops_descendants() {
    let store = store();
    let dir = store.create("/", "d", NodeKind::Dir).await.unwrap();
    let file = store.create("/d", "f", NodeKind::File).await.unwrap();

    let removed = store.remove_subtree(dir.id);
    assert_eq!(removed, vec![file.id, dir.id]);
    assert!(store.get(file.id).is_none());
    assert!(store.children("/").unwrap().is_empty());
}

#[test]
fn restore_rebuilds_paths_and_drops_orphans() {
    let mut dir = Node::new(NodeId(2), Some(NodeId::ROOT), "docs", NodeKind::Dir, 1);
    dir.remote_id = Some("d".into());
    let mut file = Node::new(NodeId(3), Some(NodeId(2)), "a.txt", NodeKind::File, 1);
    file.state = SyncState::Uploading;
    file.dirty = true;
    let orphan = Node::new(NodeId(9), Some(NodeId(42)), "lost", NodeKind::File, 1);
    let mut gone = Node::new(NodeId(5), Some(NodeId(2)), "old", NodeKind::File, 1);
    gone.remote_id = Some("g".into());

    let store = MetadataStore::restore(
        "root",
        vec![(file, false), (orphan, false), (dir, false), (gone, true)],
        Journal::disabled(),
    );

    let restored = store.lookup("/docs/a.txt").unwrap();
    assert_eq!(restored.id, NodeId(3));
    assert_eq!(restored.state, SyncState::Dirty);
    assert!(store.get(NodeId(9)).is_none());
    assert!(store.is_tombstoned_remote("g"));
    assert_eq!(
        store.find_by_remote_id("d").map(|node| node.id),
        Some(NodeId(2))
    );
}

#[tokio::test]
async fn restored_store_allocates_fresh_ids() {
    let file = Node::new(NodeId(40), Some(NodeId::ROOT), "a", NodeKind::File, 1);
    let store = MetadataStore::restore("root", vec![(file, false)], Journal::disabled());
    let created = store.create("/", "b", NodeKind::File).await.unwrap();
    assert_eq!(created.id, NodeId(41));
}

#[tokio::test]
async fn mutations_are_journalled_in_order() {
    let (journal, mut rx) = Journal::channel();
    let store = MetadataStore::new("root", journal);
    let node = store.create("/", "a", NodeKind::File).await.unwrap();
    store.mark_dirty("/a").unwrap();

    let mut seen = Vec::new();
    while let Ok(entry) = rx.try_recv() {
        if let JournalEntry::Node { node, .. } = entry {
            seen.push((node.id, node.generation));
        }
    }
    assert_eq!(
        seen,
        vec![(NodeId::ROOT, 0), (node.id, 0), (node.id, 1)]
    );
}

#[tokio::test]
async fn conflict_copy_takes_local_size() {
    let store = store();
    let root = store.lookup("/").unwrap();
    let node = store
        .insert_remote(root.id, &remote_file("r1", "a.txt", "aa", 10, 3))
        .unwrap();
    store.record_write(node.id, Some(8)).unwrap();

    let copy = store.create_conflict_copy(node.id, "a (conflict 1).txt").unwrap();
    assert_eq!(copy.size, 8);
    assert!(copy.remote_id.is_none());
    assert_eq!(copy.state, SyncState::Dirty);

    let reset = store.reset_to_remote(node.id).unwrap();
    assert_eq!(reset.size, 3);
    assert_eq!(reset.state, SyncState::Clean);
    assert!(!reset.dirty);
}
