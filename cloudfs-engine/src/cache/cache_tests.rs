use cloudfs_core::{EntryKind, RemoteEntry};
use tempfile::{TempDir, tempdir};

use super::*;
use crate::meta::NodeKind;

struct Fixture {
    dir: TempDir,
    meta: Arc<MetadataStore>,
    cache: ContentCache,
}

fn fixture(budget: u64, chunk_size: u64) -> Fixture {
    let dir = tempdir().unwrap();
    let meta = Arc::new(MetadataStore::new("root", Journal::disabled()));
    let cache = ContentCache::new(
        dir.path().join("objects"),
        budget,
        chunk_size,
        meta.clone(),
        Journal::disabled(),
    );
    Fixture {
        dir,
        meta,
        cache,
    }
}

fn remote(meta: &MetadataStore, name: &str, size: u64) -> NodeId {
    let entry = RemoteEntry {
        id: format!("r-{name}"),
        name: name.to_string(),
        kind: EntryKind::File,
        size,
        mtime: 1,
        checksum: None,
    };
    meta.insert_remote(NodeId::ROOT, &entry).unwrap().id
}

async fn local(meta: &MetadataStore, name: &str) -> NodeId {
    meta.create("/", name, NodeKind::File).await.unwrap().id
}

async fn hit(cache: &ContentCache, node: NodeId, offset: u64, len: u64) -> Vec<u8> {
    match cache.read(node, offset, len).await.unwrap() {
        CacheRead::Hit(bytes) => bytes.to_vec(),
        CacheRead::Miss => panic!("unexpected miss for {node} at {offset}"),
    }
}

#[tokio::test]
async fn write_then_read_across_chunks() {
    let fx = fixture(1024, 4);
    let node = local(&fx.meta, "a.txt").await;

    assert_eq!(fx.cache.write(node, 0, b"hello world").await.unwrap(), 11);
    assert_eq!(fx.cache.write(node, 3, b"LO").await.unwrap(), 11);

    assert_eq!(hit(&fx.cache, node, 0, 100).await, b"helLO world");
    assert_eq!(hit(&fx.cache, node, 6, 3).await, b"wor");
    let meta = fx.meta.require(node).unwrap();
    assert_eq!(meta.size, 11);
    assert!(meta.dirty);
    assert_eq!(fx.cache.usage().used, 11);
}

#[tokio::test]
async fn write_past_end_zero_fills_gap() {
    let fx = fixture(1024, 4);
    let node = local(&fx.meta, "sparse").await;
    fx.cache.write(node, 0, b"ab").await.unwrap();

    fx.cache.write(node, 9, b"z").await.unwrap();

    assert_eq!(hit(&fx.cache, node, 0, 10).await, b"ab\0\0\0\0\0\0\0z");
}

#[tokio::test]
async fn read_beyond_size_is_empty_and_unresident_is_miss() {
    let fx = fixture(1024, 8);
    let node = remote(&fx.meta, "r.bin", 20);

    assert_eq!(hit(&fx.cache, node, 20, 5).await, b"");
    assert_eq!(fx.cache.read(node, 0, 5).await.unwrap(), CacheRead::Miss);

    fx.cache
        .store_chunk(node, 0, Bytes::from_static(b"01234567"))
        .await
        .unwrap();
    assert_eq!(hit(&fx.cache, node, 2, 4).await, b"2345");
    assert_eq!(fx.cache.read(node, 6, 4).await.unwrap(), CacheRead::Miss);
    assert!(fx.cache.covers(node, 0, 8));
    assert!(!fx.cache.covers(node, 0, 9));
}

#[tokio::test]
async fn lru_entry_is_evicted_before_staging_third_file() {
    let fx = fixture(100, 64);
    let a = remote(&fx.meta, "a", 40);
    let b = remote(&fx.meta, "b", 40);
    let c = remote(&fx.meta, "c", 40);

    fx.cache.store_chunk(a, 0, Bytes::from(vec![1u8; 40])).await.unwrap();
    fx.cache.store_chunk(b, 0, Bytes::from(vec![2u8; 40])).await.unwrap();
    fx.cache.store_chunk(c, 0, Bytes::from(vec![3u8; 40])).await.unwrap();

    assert_eq!(fx.cache.read(a, 0, 40).await.unwrap(), CacheRead::Miss);
    assert_eq!(hit(&fx.cache, b, 0, 40).await, vec![2u8; 40]);
    assert_eq!(hit(&fx.cache, c, 0, 40).await, vec![3u8; 40]);
    assert_eq!(fx.cache.usage().used, 80);
}

#[tokio::test]
async fn recent_reads_protect_from_eviction() {
    let fx = fixture(100, 64);
    let a = remote(&fx.meta, "a", 40);
    let b = remote(&fx.meta, "b", 40);
    let c = remote(&fx.meta, "c", 40);
    fx.cache.store_chunk(a, 0, Bytes::from(vec![1u8; 40])).await.unwrap();
    fx.cache.store_chunk(b, 0, Bytes::from(vec![2u8; 40])).await.unwrap();

    hit(&fx.cache, a, 0, 40).await;
    fx.cache.store_chunk(c, 0, Bytes::from(vec![3u8; 40])).await.unwrap();

    assert_eq!(fx.cache.read(b, 0, 40).await.unwrap(), CacheRead::Miss);
    assert!(fx.cache.covers(a, 0, 40));
}

#[tokio::test]
async fn dirty_and_pinned_entries_are_never_evicted() {
    let fx = fixture(100, 64);
    let dirty = local(&fx.meta, "dirty").await;
    let pinned = remote(&fx.meta, "pinned", 40);
    let extra = remote(&fx.meta, "extra", 40);
    fx.cache.write(dirty, 0, &[7u8; 40]).await.unwrap();
    fx.cache
        .store_chunk(pinned, 0, Bytes::from(vec![8u8; 40]))
        .await
        .unwrap();
    fx.meta.set_pinned("/pinned", true).unwrap();

    let err = fx
        .cache
        .store_chunk(extra, 0, Bytes::from(vec![9u8; 40]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CacheExhausted);
    assert_eq!(hit(&fx.cache, dirty, 0, 40).await, vec![7u8; 40]);
    assert_eq!(hit(&fx.cache, pinned, 0, 40).await, vec![8u8; 40]);
    let report = fx.cache.evict_if_needed().await.unwrap();
    assert_eq!(report.evicted, 0);
    assert!(fx.cache.usage().used <= 100);
}

#[tokio::test]
async fn written_bytes_survive_pressure_from_other_nodes() {
    let fx = fixture(120, 16);
    let mine = local(&fx.meta, "mine").await;
    fx.cache.write(mine, 0, b"first version of the data").await.unwrap();
    fx.cache.write(mine, 0, b"final").await.unwrap();

    for round in 0..10 {
        let other = remote(&fx.meta, &format!("other-{round}"), 32);
        fx.cache
            .store_chunk(other, 0, Bytes::from(vec![round as u8; 16]))
            .await
            .unwrap();
        fx.cache
            .store_chunk(other, 16, Bytes::from(vec![round as u8; 16]))
            .await
            .unwrap();
        assert!(fx.cache.usage().used <= 120);
    }

    assert_eq!(
        hit(&fx.cache, mine, 0, 64).await,
        b"final version of the data"
    );
}

#[tokio::test]
async fn invalid_entries_read_as_miss_and_are_purged_first() {
    let fx = fixture(1000, 64);
    let node = remote(&fx.meta, "n", 10);
    fx.cache
        .store_chunk(node, 0, Bytes::from_static(b"0123456789"))
        .await
        .unwrap();

    fx.cache.invalidate(node);

    assert_eq!(fx.cache.read(node, 0, 10).await.unwrap(), CacheRead::Miss);
    let report = fx.cache.evict_if_needed().await.unwrap();
    assert_eq!(report.evicted, 1);
    assert_eq!(fx.cache.usage().used, 0);
}

#[tokio::test]
async fn chunk_from_before_invalidation_is_refused() {
    let fx = fixture(1000, 64);
    let node = remote(&fx.meta, "n", 10);
    let epoch = fx.cache.epoch(node);

    fx.cache.invalidate(node);
    let err = fx
        .cache
        .store_chunk_at(node, 0, Bytes::from_static(b"0123456789"), epoch)
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Superseded { offset: 0, .. }));
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(fx.cache.read(node, 0, 10).await.unwrap(), CacheRead::Miss);
    assert_eq!(fx.cache.usage().used, 0);

    fx.cache
        .store_chunk_at(node, 0, Bytes::from_static(b"abcdefghij"), fx.cache.epoch(node))
        .await
        .unwrap();
    assert_eq!(hit(&fx.cache, node, 0, 10).await, b"abcdefghij");
}

#[tokio::test]
async fn refetched_chunk_replaces_stale_one_without_double_counting() {
    let fx = fixture(1000, 64);
    let node = remote(&fx.meta, "n", 10);
    fx.cache
        .store_chunk(node, 0, Bytes::from_static(b"0123456789"))
        .await
        .unwrap();
    fx.cache.invalidate(node);

    fx.cache
        .store_chunk(node, 0, Bytes::from_static(b"abcdefghij"))
        .await
        .unwrap();

    assert_eq!(fx.cache.usage().used, 10);
    assert_eq!(hit(&fx.cache, node, 0, 10).await, b"abcdefghij");
}

#[tokio::test]
async fn writes_to_partially_cached_remote_files_need_hydration() {
    let fx = fixture(1000, 4);
    let node = remote(&fx.meta, "doc", 10);
    fx.cache
        .store_chunk(node, 0, Bytes::from_static(b"0123"))
        .await
        .unwrap();

    let err = fx.cache.write(node, 0, b"x").await.unwrap_err();
    assert!(matches!(err, CacheError::NotResident { offset: 4, .. }));
    assert!(!fx.meta.require(node).unwrap().dirty);

    fx.cache
        .store_chunk(node, 4, Bytes::from_static(b"4567"))
        .await
        .unwrap();
    fx.cache
        .store_chunk(node, 8, Bytes::from_static(b"89"))
        .await
        .unwrap();
    fx.cache.write(node, 0, b"x").await.unwrap();
    assert_eq!(hit(&fx.cache, node, 0, 10).await, b"x123456789");
}

#[tokio::test]
async fn truncate_shrinks_and_extends() {
    let fx = fixture(1000, 4);
    let node = local(&fx.meta, "t").await;
    fx.cache.write(node, 0, b"abcdefghij").await.unwrap();

    fx.cache.truncate(node, 5).await.unwrap();
    assert_eq!(fx.meta.require(node).unwrap().size, 5);
    assert_eq!(hit(&fx.cache, node, 0, 100).await, b"abcde");
    assert_eq!(fx.cache.usage().used, 5);

    fx.cache.truncate(node, 7).await.unwrap();
    assert_eq!(hit(&fx.cache, node, 0, 100).await, b"abcde\0\0");

    fx.cache.truncate(node, 0).await.unwrap();
    assert_eq!(fx.cache.usage().used, 0);
    assert!(fx.cache.resident_chunks(node).is_empty());
}

#[tokio::test]
async fn truncating_uncached_remote_file_to_zero_needs_no_data() {
    let fx = fixture(1000, 4);
    let node = remote(&fx.meta, "big", 4096);

    fx.cache.truncate(node, 0).await.unwrap();

    let meta = fx.meta.require(node).unwrap();
    assert_eq!(meta.size, 0);
    assert!(meta.dirty);
}

#[tokio::test]
async fn move_node_hands_over_chunks() {
    let fx = fixture(1000, 4);
    let from = local(&fx.meta, "from").await;
    let to = local(&fx.meta, "to").await;
    fx.cache.write(from, 0, b"payload").await.unwrap();
    fx.meta.record_write(to, Some(7)).unwrap();

    fx.cache.move_node(from, to).await.unwrap();

    assert!(fx.cache.resident_chunks(from).is_empty());
    assert_eq!(hit(&fx.cache, to, 0, 7).await, b"payload");
    assert_eq!(fx.cache.usage().used, 7);
}

#[tokio::test]
async fn checksum_covers_resident_content() {
    let fx = fixture(1000, 2);
    let node = local(&fx.meta, "h").await;
    fx.cache.write(node, 0, b"hello").await.unwrap();

    assert_eq!(
        fx.cache.checksum(node, 5).await.unwrap(),
        "5d41402abc4b2a76b9719d911017c592"
    );

    let missing = remote(&fx.meta, "cold", 4);
    assert!(matches!(
        fx.cache.checksum(missing, 4).await,
        Err(CacheError::NotResident { .. })
    ));
}

#[tokio::test]
async fn drop_node_releases_space() {
    let fx = fixture(1000, 4);
    let node = local(&fx.meta, "d").await;
    fx.cache.write(node, 0, b"123456").await.unwrap();

    fx.cache.drop_node(node).await.unwrap();

    assert_eq!(fx.cache.usage(), CacheUsage {
        used: 0,
        budget: 1000,
        entries: 0,
        nodes: 0,
    });
}

#[tokio::test]
async fn restore_skips_records_without_files() {
    let fx = fixture(1000, 4);
    let node = remote(&fx.meta, "r", 8);
    fx.cache
        .store_chunk(node, 0, Bytes::from_static(b"abcd"))
        .await
        .unwrap();
    let objects = fx.dir.path().join("objects");

    let restored = ContentCache::new(objects, 1000, 4, fx.meta.clone(), Journal::disabled());
    restored
        .restore(vec![
            CacheRecord {
                node,
                offset: 0,
                len: 4,
                valid: true,
                accessed: 5,
            },
            CacheRecord {
                node,
                offset: 4,
                len: 4,
                valid: true,
                accessed: 6,
            },
        ])
        .await
        .unwrap();

    assert_eq!(restored.resident_chunks(node), vec![(0, 4)]);
    assert_eq!(restored.usage().used, 4);
    assert_eq!(hit(&restored, node, 0, 4).await, b"abcd");
}
