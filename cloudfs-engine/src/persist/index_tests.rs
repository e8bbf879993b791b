use cloudfs_core::UploadTarget;

use super::*;

async fn make_store() -> IndexStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn sample_node() -> Node {
    let mut node = Node::new(NodeId(7), Some(NodeId::ROOT), "A.txt", NodeKind::File, 1_700_000_000);
    node.size = 12;
    node.remote_id = Some("r7".into());
    node.remote_mtime = Some(1_700_000_100);
    node.remote_size = Some(10);
    node.checksum = Some("hash".into());
    node.synced = Some(SyncPoint {
        checksum: Some("hash".into()),
        mtime: 1_700_000_100,
        size: 10,
    });
    node.dirty = true;
    node.pinned = true;
    node.state = SyncState::UploadFailed;
    node.generation = 4;
    node.last_error = Some("quota".into());
    node
}

#[tokio::test]
async fn node_round_trips_every_field() {
    let store = make_store().await;
    let node = sample_node();

    store.upsert_node(&node, false).await.unwrap();
    let loaded = store.load_nodes().await.unwrap();

    assert_eq!(loaded, vec![(node, false)]);
}

#[tokio::test]
async fn upsert_updates_existing_node() {
    let store = make_store().await;
    let mut node = sample_node();
    store.upsert_node(&node, false).await.unwrap();

    node.name = "B.txt".into();
    node.synced = None;
    store.upsert_node(&node, true).await.unwrap();

    let loaded = store.load_nodes().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].0.name, "B.txt");
    assert!(loaded[0].0.synced.is_none());
    assert!(loaded[0].1);

    store.delete_node(node.id).await.unwrap();
    assert!(store.load_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn cache_entries_load_in_access_order() {
    let store = make_store().await;
    for (offset, accessed) in [(0u64, 9u64), (4096, 3), (8192, 5)] {
        store
            .upsert_cache_entry(&CacheRecord {
                node: NodeId(3),
                offset,
                len: 4096,
                valid: true,
                accessed,
            })
            .await
            .unwrap();
    }
    store.delete_cache_entry(NodeId(3), 8192).await.unwrap();

    let offsets: Vec<_> = store
        .load_cache_entries()
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.offset)
        .collect();
    assert_eq!(offsets, vec![4096, 0]);
}

#[tokio::test]
async fn jobs_keep_progress_and_session() {
    let store = make_store().await;
    let record = JobRecord {
        node: NodeId(5),
        direction: Direction::Upload,
        state: JobState::Paused,
        remote_id: None,
        target: Some(UploadTarget::Create {
            parent_id: "root".into(),
            name: "a.bin".into(),
        }),
        session: Some("s1".into()),
        fingerprint: "gen:3:size:20".into(),
        total: 20,
        chunk_size: 8,
        done_chunks: vec![0, 1],
        retries: 2,
        generation: 3,
        last_error: None,
    };

    store.upsert_job(&record).await.unwrap();
    assert_eq!(store.load_jobs().await.unwrap(), vec![record.clone()]);

    store.delete_job(NodeId(5), Direction::Upload).await.unwrap();
    assert!(store.load_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn remote_ops_survive_reload_in_order() {
    let store = make_store().await;
    for (id, kind) in [(2u64, RemoteOpKind::Delete), (1, RemoteOpKind::Mkdir)] {
        store
            .upsert_op(&RemoteOp {
                id,
                kind,
                node: NodeId(id + 10),
                remote_id: None,
                attempt: 0,
                retry_at: None,
                last_error: None,
            })
            .await
            .unwrap();
    }

    let ops = store.load_ops().await.unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].kind, RemoteOpKind::Mkdir);
    assert_eq!(ops[1].node, NodeId(12));

    store.delete_op(1).await.unwrap();
    assert_eq!(store.load_ops().await.unwrap().len(), 1);
}

#[tokio::test]
async fn records_and_lists_conflicts() {
    let store = make_store().await;
    store
        .record_conflict(&ConflictRecord {
            id: 0,
            path: "/Docs/A.txt".into(),
            renamed_local: "/Docs/A (conflict 1).txt".into(),
            created: 123,
            reason: "keep-both".into(),
        })
        .await
        .unwrap();

    let conflicts = store.list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].path, "/Docs/A.txt");
    assert_eq!(conflicts[0].reason, "keep-both");
}

#[tokio::test]
async fn opens_database_file_under_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("index.sqlite3");

    let store = IndexStore::open_file(&path).await.unwrap();
    store.upsert_node(&sample_node(), false).await.unwrap();

    assert!(path.exists());
}
