//! Chunked on-disk content store with a hard byte budget.
//!
//! Every entry is one chunk-aligned file under `objects/<node>/<offset>`.
//! The index lives behind a short std mutex; file I/O happens outside it,
//! guarded by a per-entry async lock that eviction only ever `try`s.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::meta::{MetaError, MetadataStore, Node, NodeId};
use crate::paths;
use crate::persist::{Journal, JournalEntry};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache budget of {budget} bytes cannot fit {needed} more")]
    Exhausted { needed: u64, budget: u64 },
    #[error("{node} has no resident data at offset {offset}")]
    NotResident { node: NodeId, offset: u64 },
    #[error("chunk offset {offset} of {node} is not aligned")]
    Unaligned { node: NodeId, offset: u64 },
    #[error("chunk at {offset} of {node} was fetched for content since replaced")]
    Superseded { node: NodeId, offset: u64 },
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Exhausted { .. } => ErrorKind::CacheExhausted,
            CacheError::NotResident { .. } => ErrorKind::Transient,
            CacheError::Superseded { .. } => ErrorKind::Cancelled,
            CacheError::Unaligned { .. } | CacheError::Io(_) => ErrorKind::Io,
            CacheError::Meta(err) => err.kind(),
        }
    }
}

/// Persisted form of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub node: NodeId,
    pub offset: u64,
    pub len: u64,
    pub valid: bool,
    pub accessed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRead {
    Hit(Bytes),
    Miss,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub used: u64,
    pub budget: u64,
    pub entries: usize,
    pub nodes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub freed: u64,
}

struct Entry {
    len: u64,
    valid: bool,
    accessed: u64,
    lock: Arc<AsyncRwLock<()>>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<NodeId, BTreeMap<u64, Entry>>,
    used: u64,
    tick: u64,
    busy: HashMap<NodeId, usize>,
    /// Bumped whenever a node's cached bytes stop describing its content.
    epochs: HashMap<NodeId, u64>,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn entry(&self, node: NodeId, offset: u64) -> Option<&Entry> {
        self.entries.get(&node)?.get(&offset)
    }

    fn epoch(&self, node: NodeId) -> u64 {
        self.epochs.get(&node).copied().unwrap_or(0)
    }

    fn bump_epoch(&mut self, node: NodeId) {
        *self.epochs.entry(node).or_insert(0) += 1;
    }
}

pub struct ContentCache {
    objects: PathBuf,
    budget: u64,
    chunk_size: u64,
    meta: Arc<MetadataStore>,
    journal: Journal,
    state: Mutex<CacheState>,
}

/// Keeps a node out of eviction while its chunks are being rewritten.
struct BusyGuard<'a> {
    cache: &'a ContentCache,
    node: NodeId,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.cache.lock();
        if let Some(count) = state.busy.get_mut(&self.node) {
            *count -= 1;
            if *count == 0 {
                state.busy.remove(&self.node);
            }
        }
    }
}

struct ChunkPlan {
    offset: u64,
    len: u64,
    existing: u64,
}

impl ContentCache {
    pub fn new(
        objects: PathBuf,
        budget: u64,
        chunk_size: u64,
        meta: Arc<MetadataStore>,
        journal: Journal,
    ) -> Self {
        Self {
            objects,
            budget,
            chunk_size: chunk_size.max(1),
            meta,
            journal,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunk_path(&self, node: NodeId, offset: u64) -> PathBuf {
        paths::object_path(&self.objects, node.0, offset)
    }

    fn node_dir(&self, node: NodeId) -> PathBuf {
        self.objects.join(node.0.to_string())
    }

    fn mark_busy(&self, node: NodeId) -> BusyGuard<'_> {
        *self.lock().busy.entry(node).or_insert(0) += 1;
        BusyGuard { cache: self, node }
    }

    fn record(&self, node: NodeId, offset: u64, entry: &Entry) {
        self.journal.record(JournalEntry::CacheEntry(CacheRecord {
            node,
            offset,
            len: entry.len,
            valid: entry.valid,
            accessed: entry.accessed,
        }));
    }

    /// Reloads persisted entries, dropping those whose node or file is gone.
    pub async fn restore(&self, records: Vec<CacheRecord>) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.objects).await?;
        let mut kept = 0usize;
        for record in records {
            let path = self.chunk_path(record.node, record.offset);
            let on_disk = tokio::fs::metadata(&path).await.map(|meta| meta.len()).ok();
            if self.meta.get(record.node).is_none() || on_disk != Some(record.len) {
                debug!(node = %record.node, offset = record.offset, "dropping stale cache record");
                if let Err(err) = tokio::fs::remove_file(&path).await
                    && !is_missing(&err)
                {
                    debug!(path = %path.display(), error = %err, "cannot remove stale chunk file");
                }
                self.journal.record(JournalEntry::CacheEntryRemoved {
                    node: record.node,
                    offset: record.offset,
                });
                continue;
            }
            let mut state = self.lock();
            state.tick = state.tick.max(record.accessed);
            state.used += record.len;
            state.entries.entry(record.node).or_default().insert(
                record.offset,
                Entry {
                    len: record.len,
                    valid: record.valid,
                    accessed: record.accessed,
                    lock: Arc::default(),
                },
            );
            kept += 1;
        }
        debug!(entries = kept, used = self.usage().used, "cache restored");
        Ok(())
    }

    /// Reads up to `len` bytes at `offset`, clamped to the node's size.
    pub async fn read(&self, node: NodeId, offset: u64, len: u64) -> Result<CacheRead, CacheError> {
        let size = self.meta.require(node)?.size;
        if len == 0 || offset >= size {
            return Ok(CacheRead::Hit(Bytes::new()));
        }
        let end = offset.saturating_add(len).min(size);
        self.read_range(node, offset, end - offset).await
    }

    /// Reads an exact range; `Miss` unless every covering chunk is valid.
    pub async fn read_range(
        &self,
        node: NodeId,
        offset: u64,
        len: u64,
    ) -> Result<CacheRead, CacheError> {
        let end = offset + len;
        let plan = {
            let mut state = self.lock();
            let tick = state.next_tick();
            let Some(chunks) = state.entries.get_mut(&node) else {
                return Ok(CacheRead::Miss);
            };
            let mut plan = Vec::new();
            let mut pos = offset;
            while pos < end {
                let chunk = pos - pos % self.chunk_size;
                let upto = end.min(chunk + self.chunk_size);
                let Some(entry) = chunks.get_mut(&chunk) else {
                    return Ok(CacheRead::Miss);
                };
                if !entry.valid || chunk + entry.len < upto {
                    return Ok(CacheRead::Miss);
                }
                entry.accessed = tick;
                plan.push((chunk, pos - chunk, upto - pos, entry.lock.clone()));
                pos = upto;
            }
            plan
        };

        let mut out = BytesMut::with_capacity(len as usize);
        for (chunk, from, count, lock) in plan {
            let guard = lock.read().await;
            if !self.still_valid(node, chunk, &lock) {
                return Ok(CacheRead::Miss);
            }
            match read_file(&self.chunk_path(node, chunk), from, count).await {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(err) if is_missing(&err) => {
                    warn!(node = %node, offset = chunk, "cache file vanished");
                    drop(guard);
                    self.forget(node, chunk);
                    return Ok(CacheRead::Miss);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(CacheRead::Hit(out.freeze()))
    }

    fn still_valid(&self, node: NodeId, offset: u64, lock: &Arc<AsyncRwLock<()>>) -> bool {
        self.lock()
            .entry(node, offset)
            .is_some_and(|entry| entry.valid && Arc::ptr_eq(&entry.lock, lock))
    }

    fn forget(&self, node: NodeId, offset: u64) {
        let mut state = self.lock();
        let removed = state
            .entries
            .get_mut(&node)
            .and_then(|chunks| chunks.remove(&offset));
        if let Some(entry) = removed {
            state.used = state.used.saturating_sub(entry.len);
            self.journal
                .record(JournalEntry::CacheEntryRemoved { node, offset });
        }
    }

    pub fn covers(&self, node: NodeId, offset: u64, len: u64) -> bool {
        let state = self.lock();
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            let chunk = pos - pos % self.chunk_size;
            let upto = end.min(chunk + self.chunk_size);
            match state.entry(node, chunk) {
                Some(entry) if entry.valid && chunk + entry.len >= upto => pos = upto,
                _ => return false,
            }
        }
        true
    }

    /// Valid resident chunks as `(offset, len)`, in offset order.
    pub fn resident_chunks(&self, node: NodeId) -> Vec<(u64, u64)> {
        self.lock()
            .entries
            .get(&node)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|(_, entry)| entry.valid)
                    .map(|(offset, entry)| (*offset, entry.len))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes with remote content must be fully resident before their bytes
    /// can be changed locally.
    fn ensure_complete(&self, node: &Node) -> Result<(), CacheError> {
        if node.remote_id.is_none() || node.size == 0 {
            return Ok(());
        }
        let state = self.lock();
        let mut offset = 0;
        while offset < node.size {
            let want = (node.size - offset).min(self.chunk_size);
            match state.entry(node.id, offset) {
                Some(entry) if entry.valid && entry.len >= want => {}
                _ => {
                    return Err(CacheError::NotResident {
                        node: node.id,
                        offset,
                    });
                }
            }
            offset += self.chunk_size;
        }
        Ok(())
    }

    /// Buffers a local write and marks the node dirty. Returns the new size.
    pub async fn write(&self, node: NodeId, offset: u64, data: &[u8]) -> Result<u64, CacheError> {
        let current = self.meta.require(node)?;
        if data.is_empty() {
            return Ok(current.size);
        }
        self.ensure_complete(&current)?;
        let _busy = self.mark_busy(node);
        let end = offset + data.len() as u64;
        let new_size = current.size.max(end);
        self.rewrite(node, new_size, offset.min(current.size), end, offset, data)
            .await?;
        self.meta.record_write(node, Some(new_size))?;
        Ok(new_size)
    }

    /// Rebuilds every chunk touching `[start, end)` for a node of `new_size`
    /// bytes, overlaying `data` at `data_offset` and zero-filling gaps.
    async fn rewrite(
        &self,
        node: NodeId,
        new_size: u64,
        start: u64,
        end: u64,
        data_offset: u64,
        data: &[u8],
    ) -> Result<(), CacheError> {
        let cs = self.chunk_size;
        let mut plans = Vec::new();
        let mut grow = 0u64;
        {
            let state = self.lock();
            let mut chunk = start - start % cs;
            while chunk < end {
                let len = (new_size - chunk).min(cs);
                let existing = state
                    .entry(node, chunk)
                    .filter(|entry| entry.valid)
                    .map_or(0, |entry| entry.len);
                grow += len.saturating_sub(existing);
                plans.push(ChunkPlan {
                    offset: chunk,
                    len,
                    existing,
                });
                chunk += cs;
            }
        }
        self.reserve(grow).await?;

        let mut committed = 0u64;
        let result: Result<(), CacheError> = async {
            for plan in &plans {
                let path = self.chunk_path(node, plan.offset);
                let mut buf = vec![0u8; plan.len as usize];
                if plan.existing > 0 {
                    let keep = plan.existing.min(plan.len);
                    let old = read_file(&path, 0, keep).await?;
                    buf[..old.len()].copy_from_slice(&old);
                }
                let lo = data_offset.max(plan.offset);
                let hi = (data_offset + data.len() as u64).min(plan.offset + plan.len);
                if lo < hi {
                    buf[(lo - plan.offset) as usize..(hi - plan.offset) as usize]
                        .copy_from_slice(&data[(lo - data_offset) as usize..(hi - data_offset) as usize]);
                }
                let lock = self.slot_lock(node, plan.offset);
                let _guard = lock.write().await;
                write_file(&path, &buf).await?;
                self.commit(node, plan.offset, plan.len, lock.clone(), None);
                committed += plan.len.saturating_sub(plan.existing);
            }
            Ok(())
        }
        .await;
        if result.is_err() {
            self.release(grow - committed);
        }
        result
    }

    fn slot_lock(&self, node: NodeId, offset: u64) -> Arc<AsyncRwLock<()>> {
        self.lock()
            .entry(node, offset)
            .map(|entry| entry.lock.clone())
            .unwrap_or_default()
    }

    /// Installs a freshly written chunk. Space must already be reserved.
    /// With `epoch` set, nothing is installed once the node has moved past it.
    fn commit(
        &self,
        node: NodeId,
        offset: u64,
        len: u64,
        lock: Arc<AsyncRwLock<()>>,
        epoch: Option<u64>,
    ) -> bool {
        let mut state = self.lock();
        if epoch.is_some_and(|epoch| epoch != state.epoch(node)) {
            return false;
        }
        let tick = state.next_tick();
        let chunks = state.entries.entry(node).or_default();
        let entry = chunks.entry(offset).or_insert_with(|| Entry {
            len: 0,
            valid: false,
            accessed: tick,
            lock,
        });
        // Reservations cover growth over the previous valid length; a stale
        // entry's bytes are released in full.
        let refund = if entry.valid {
            entry.len.saturating_sub(len)
        } else {
            entry.len
        };
        entry.len = len;
        entry.valid = true;
        entry.accessed = tick;
        let snapshot = CacheRecord {
            node,
            offset,
            len,
            valid: true,
            accessed: tick,
        };
        state.used = state.used.saturating_sub(refund);
        self.journal.record(JournalEntry::CacheEntry(snapshot));
        true
    }

    async fn reserve(&self, bytes: u64) -> Result<(), CacheError> {
        if bytes == 0 || self.try_reserve(bytes) {
            return Ok(());
        }
        if bytes <= self.budget {
            self.evict_to(self.budget - bytes).await?;
            if self.try_reserve(bytes) {
                return Ok(());
            }
        }
        Err(CacheError::Exhausted {
            needed: bytes,
            budget: self.budget,
        })
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        let mut state = self.lock();
        if state.used + bytes <= self.budget {
            state.used += bytes;
            true
        } else {
            false
        }
    }

    fn release(&self, bytes: u64) {
        let mut state = self.lock();
        state.used = state.used.saturating_sub(bytes);
    }

    /// Current content epoch of `node`; see [`store_chunk_at`](Self::store_chunk_at).
    pub fn epoch(&self, node: NodeId) -> u64 {
        self.lock().epoch(node)
    }

    /// Stores a downloaded chunk. Chunks a dirty node already holds win.
    pub async fn store_chunk(&self, node: NodeId, offset: u64, data: Bytes) -> Result<(), CacheError> {
        let epoch = self.epoch(node);
        self.store_chunk_at(node, offset, data, epoch).await
    }

    /// Like [`store_chunk`](Self::store_chunk) for bytes fetched while the
    /// node was at `epoch`. Fails with `Superseded` once it is invalidated.
    pub async fn store_chunk_at(
        &self,
        node: NodeId,
        offset: u64,
        data: Bytes,
        epoch: u64,
    ) -> Result<(), CacheError> {
        if offset % self.chunk_size != 0 {
            return Err(CacheError::Unaligned { node, offset });
        }
        let current = self.meta.require(node)?;
        let existing = {
            let state = self.lock();
            state.entry(node, offset).map(|entry| (entry.valid, entry.len))
        };
        if current.dirty && matches!(existing, Some((true, _))) {
            debug!(node = %node, offset, "keeping local chunk over downloaded one");
            return Ok(());
        }
        let existing = match existing {
            Some((true, len)) => len,
            _ => 0,
        };
        let len = data.len() as u64;
        let reserved = len.saturating_sub(existing);
        self.reserve(reserved).await?;
        let lock = self.slot_lock(node, offset);
        let _guard = lock.write().await;
        if self.epoch(node) != epoch {
            self.release(reserved);
            return Err(CacheError::Superseded { node, offset });
        }
        if let Err(err) = write_file(&self.chunk_path(node, offset), &data).await {
            self.release(reserved);
            return Err(err.into());
        }
        if !self.commit(node, offset, len, lock.clone(), Some(epoch)) {
            self.release(reserved);
            return Err(CacheError::Superseded { node, offset });
        }
        Ok(())
    }

    /// Resizes the node's content, zero-extending or dropping chunks.
    pub async fn truncate(&self, node: NodeId, new_size: u64) -> Result<(), CacheError> {
        let current = self.meta.require(node)?;
        if new_size > 0 {
            self.ensure_complete(&current)?;
        }
        let _busy = self.mark_busy(node);
        let old_size = current.size;
        if new_size > old_size {
            self.rewrite(node, new_size, old_size, new_size, new_size, &[])
                .await?;
        } else if new_size < old_size {
            self.shrink(node, new_size).await?;
        }
        self.meta.record_write(node, Some(new_size))?;
        Ok(())
    }

    async fn shrink(&self, node: NodeId, new_size: u64) -> Result<(), CacheError> {
        let cs = self.chunk_size;
        let (dropped, tail) = {
            let mut state = self.lock();
            let Some(chunks) = state.entries.get_mut(&node) else {
                return Ok(());
            };
            let cut = new_size.div_ceil(cs) * cs;
            let dropped: Vec<(u64, Entry)> = chunks.split_off(&cut).into_iter().collect();
            let tail = (new_size % cs != 0)
                .then(|| new_size - new_size % cs)
                .and_then(|offset| {
                    chunks
                        .get(&offset)
                        .filter(|entry| entry.len > new_size - offset)
                        .map(|entry| (offset, entry.lock.clone()))
                });
            let freed: u64 = dropped.iter().map(|(_, entry)| entry.len).sum();
            state.used = state.used.saturating_sub(freed);
            (dropped, tail)
        };
        for (offset, _) in dropped {
            remove_quietly(&self.chunk_path(node, offset)).await?;
            self.journal
                .record(JournalEntry::CacheEntryRemoved { node, offset });
        }
        if let Some((offset, lock)) = tail {
            let keep = new_size - offset;
            let _guard = lock.write().await;
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(self.chunk_path(node, offset))
                .await?;
            file.set_len(keep).await?;
            let mut state = self.lock();
            let mut shrunk = None;
            if let Some(entry) = state
                .entries
                .get_mut(&node)
                .and_then(|chunks| chunks.get_mut(&offset))
                && entry.len > keep
            {
                shrunk = Some(entry.len - keep);
                entry.len = keep;
                self.record(node, offset, entry);
            }
            if let Some(freed) = shrunk {
                state.used = state.used.saturating_sub(freed);
            }
        }
        Ok(())
    }

    /// Marks every chunk of the node stale; stale chunks are purged first.
    pub fn invalidate(&self, node: NodeId) {
        let mut state = self.lock();
        state.bump_epoch(node);
        if let Some(chunks) = state.entries.get_mut(&node) {
            for (offset, entry) in chunks.iter_mut() {
                entry.valid = false;
                self.record(node, *offset, entry);
            }
        }
    }

    pub async fn drop_node(&self, node: NodeId) -> Result<(), CacheError> {
        let removed = {
            let mut state = self.lock();
            state.bump_epoch(node);
            let removed = state.entries.remove(&node).unwrap_or_default();
            let freed: u64 = removed.values().map(|entry| entry.len).sum();
            state.used = state.used.saturating_sub(freed);
            removed
        };
        for offset in removed.keys() {
            self.journal.record(JournalEntry::CacheEntryRemoved {
                node,
                offset: *offset,
            });
        }
        match tokio::fs::remove_dir_all(self.node_dir(node)).await {
            Err(err) if !is_missing(&err) => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Hands every chunk of `from` over to `to`.
    pub async fn move_node(&self, from: NodeId, to: NodeId) -> Result<(), CacheError> {
        let target_dir = self.node_dir(to);
        self.drop_node(to).await?;
        match tokio::fs::rename(self.node_dir(from), &target_dir).await {
            Err(err) if !is_missing(&err) => return Err(err.into()),
            _ => {}
        }
        let mut state = self.lock();
        let Some(chunks) = state.entries.remove(&from) else {
            return Ok(());
        };
        for (offset, entry) in &chunks {
            self.journal.record(JournalEntry::CacheEntryRemoved {
                node: from,
                offset: *offset,
            });
            self.record(to, *offset, entry);
        }
        state.entries.insert(to, chunks);
        Ok(())
    }

    /// Hex md5 of the node's first `size` bytes; all of them must be resident.
    pub async fn checksum(&self, node: NodeId, size: u64) -> Result<String, CacheError> {
        let mut context = md5::Context::new();
        let mut offset = 0;
        while offset < size {
            let len = (size - offset).min(self.chunk_size);
            match self.read_range(node, offset, len).await? {
                CacheRead::Hit(bytes) => context.consume(&bytes),
                CacheRead::Miss => return Err(CacheError::NotResident { node, offset }),
            }
            offset += len;
        }
        Ok(format!("{:x}", context.compute()))
    }

    pub async fn evict_if_needed(&self) -> Result<EvictionReport, CacheError> {
        self.evict_to(self.budget).await
    }

    /// Purges stale entries, then least-recently-used unprotected ones until
    /// usage is at most `target`.
    async fn evict_to(&self, target: u64) -> Result<EvictionReport, CacheError> {
        let mut candidates: Vec<(bool, u64, NodeId, u64)> = {
            let state = self.lock();
            state
                .entries
                .iter()
                .filter(|(node, _)| !state.busy.contains_key(node))
                .flat_map(|(node, chunks)| {
                    chunks
                        .iter()
                        .map(|(offset, entry)| (entry.valid, entry.accessed, *node, *offset))
                })
                .collect()
        };
        candidates.sort_unstable();

        let mut report = EvictionReport::default();
        for (valid, _, node, offset) in candidates {
            let used = self.lock().used;
            if valid && used <= target {
                break;
            }
            if valid && self.meta.is_protected(node) {
                continue;
            }
            let taken = {
                let mut state = self.lock();
                if state.busy.contains_key(&node) {
                    continue;
                }
                let Some(chunks) = state.entries.get_mut(&node) else {
                    continue;
                };
                let Some(entry) = chunks.get(&offset) else {
                    continue;
                };
                if entry.valid != valid {
                    continue;
                }
                let Ok(guard) = entry.lock.clone().try_write_owned() else {
                    continue;
                };
                let len = entry.len;
                chunks.remove(&offset);
                if chunks.is_empty() {
                    state.entries.remove(&node);
                }
                state.used = state.used.saturating_sub(len);
                (len, guard)
            };
            let (len, _guard) = taken;
            self.journal
                .record(JournalEntry::CacheEntryRemoved { node, offset });
            remove_quietly(&self.chunk_path(node, offset)).await?;
            report.evicted += 1;
            report.freed += len;
        }
        if report.evicted > 0 {
            debug!(evicted = report.evicted, freed = report.freed, "cache eviction pass");
        }
        Ok(report)
    }

    pub fn usage(&self) -> CacheUsage {
        let state = self.lock();
        CacheUsage {
            used: state.used,
            budget: self.budget,
            entries: state.entries.values().map(BTreeMap::len).sum(),
            nodes: state.entries.len(),
        }
    }
}

async fn read_file(path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes through a temporary file so a chunk is either old or new, never torn.
async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn remove_quietly(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if !is_missing(&err) => Err(err),
        _ => Ok(()),
    }
}

fn is_missing(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
