//! Owns every engine component and the tasks that keep them moving.
//!
//! [`EngineContext::open`] rebuilds the in-memory state from the index, then
//! [`EngineContext::spawn_background`] starts the transfer workers and the
//! refresh, remote operation and eviction loops. [`EngineContext::shutdown`]
//! pauses transfers, stops the loops and waits for the journal to drain.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cloudfs_core::RemoteStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheUsage, ContentCache};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::meta::{MetaStats, MetadataStore, NodeId, SyncState};
use crate::persist::{ConflictRecord, IndexStore, Journal, Snapshot, spawn_persister};
use crate::sync::SyncEngine;
use crate::transfer::TransferManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub nodes: MetaStats,
    pub cache: CacheUsage,
    pub jobs: usize,
    pub active_jobs: usize,
    pub pending_ops: usize,
}

/// A node whose last upload or remote operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUpload {
    pub node: NodeId,
    pub path: String,
    pub error: Option<String>,
}

pub struct EngineContext {
    config: EngineConfig,
    meta: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    transfers: Arc<TransferManager>,
    sync: Arc<SyncEngine>,
    index: Option<IndexStore>,
    journal: Journal,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Ends on its own once every journal sender is dropped.
    _persister: Option<JoinHandle<()>>,
}

impl EngineContext {
    /// Opens the index named by the configuration and restores from it.
    pub async fn open(
        config: EngineConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self, EngineError> {
        tokio::fs::create_dir_all(config.objects_dir()).await?;
        let index = IndexStore::new(&config.database_url()).await?;
        Self::with_index(config, remote, index).await
    }

    pub async fn with_index(
        config: EngineConfig,
        remote: Arc<dyn RemoteStore>,
        index: IndexStore,
    ) -> Result<Self, EngineError> {
        let snapshot = index.load().await?;
        info!(
            nodes = snapshot.nodes.len(),
            cache_entries = snapshot.cache.len(),
            jobs = snapshot.jobs.len(),
            ops = snapshot.ops.len(),
            "restoring engine state"
        );
        let (journal, rx) = Journal::channel();
        let persister = spawn_persister(index.clone(), rx);
        let mut context = Self::assemble(config, remote, journal, Some(index), snapshot).await?;
        context._persister = Some(persister);
        Ok(context)
    }

    /// Engine without persistence; state is lost on drop.
    pub async fn ephemeral(
        config: EngineConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self, EngineError> {
        Self::assemble(config, remote, Journal::disabled(), None, Snapshot::default()).await
    }

    async fn assemble(
        config: EngineConfig,
        remote: Arc<dyn RemoteStore>,
        journal: Journal,
        index: Option<IndexStore>,
        snapshot: Snapshot,
    ) -> Result<Self, EngineError> {
        let meta = Arc::new(MetadataStore::restore(
            &config.root_remote_id,
            snapshot.nodes,
            journal.clone(),
        ));
        let cache = Arc::new(ContentCache::new(
            config.objects_dir(),
            config.cache_max_bytes,
            config.chunk_size,
            meta.clone(),
            journal.clone(),
        ));
        cache.restore(snapshot.cache).await?;
        let transfers = Arc::new(TransferManager::new(
            remote.clone(),
            cache.clone(),
            meta.clone(),
            journal.clone(),
            &config,
        ));
        transfers.restore(snapshot.jobs);
        let sync = Arc::new(SyncEngine::new(
            remote,
            meta.clone(),
            cache.clone(),
            transfers.clone(),
            journal.clone(),
            &config,
        ));
        sync.restore_ops(snapshot.ops);
        Ok(Self {
            config,
            meta,
            cache,
            transfers,
            sync,
            index,
            journal,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            _persister: None,
        })
    }

    fn tasks_lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn meta(&self) -> &Arc<MetadataStore> {
        &self.meta
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    /// Starts workers and periodic loops, then resumes work left over from
    /// the previous run.
    pub fn spawn_background(&self) {
        let mut tasks = self.tasks_lock();
        tasks.extend(self.transfers.start(self.shutdown.clone()));

        let sync = self.sync.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { sync.run_events(token).await }));

        let sync = self.sync.clone();
        let token = self.shutdown.clone();
        let interval = self.config.refresh_interval;
        tasks.push(tokio::spawn(async move { sync.run_refresh(interval, token).await }));

        let sync = self.sync.clone();
        let token = self.shutdown.clone();
        let interval = self.config.worker_interval;
        tasks.push(tokio::spawn(async move { sync.run_ops(interval, token).await }));

        let cache = self.cache.clone();
        let token = self.shutdown.clone();
        let interval = self.config.eviction_interval;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match cache.evict_if_needed().await {
                    Ok(report) if report.evicted > 0 => {
                        info!(evicted = report.evicted, freed = report.freed, "cache evicted");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "eviction failed"),
                }
            }
            debug!("eviction loop stopped");
        }));
        drop(tasks);

        self.resume();
        info!(
            workers = self.config.transfer_workers,
            refresh_secs = self.config.refresh_interval.as_secs(),
            "engine started"
        );
    }

    fn resume(&self) {
        match self.sync.schedule_uploads() {
            Ok(0) => {}
            Ok(count) => info!(count, "resuming uploads"),
            Err(err) => warn!(error = %err, "failed to resume uploads"),
        }
        for node in self.meta.pinned_nodes() {
            if let Err(err) = self.sync.fetch(node.id) {
                warn!(node = %node.id, error = %err, "failed to resume pinned download");
            }
        }
    }

    /// Pauses transfers, stops every loop and waits until the journal is
    /// on disk.
    pub async fn shutdown(&self) {
        self.transfers.cancel_all();
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks_lock());
        for result in futures_util::future::join_all(tasks).await {
            if let Err(err) = result {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        self.journal.flush().await;
        info!("engine stopped");
    }

    /// Waits until every change made so far is persisted.
    pub async fn flush(&self) {
        self.journal.flush().await;
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            nodes: self.meta.stats(),
            cache: self.cache.usage(),
            jobs: self.transfers.jobs().len(),
            active_jobs: self.transfers.active(),
            pending_ops: self.sync.operations().len(),
        }
    }

    /// Resolutions recorded so far, oldest first. Empty without an index.
    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, EngineError> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        self.journal.flush().await;
        Ok(index.list_conflicts().await?)
    }

    pub fn failed_uploads(&self) -> Vec<FailedUpload> {
        let mut failed: Vec<FailedUpload> = self
            .meta
            .nodes_in_state(SyncState::UploadFailed)
            .into_iter()
            .filter_map(|node| {
                Some(FailedUpload {
                    path: self.meta.path_of(node.id)?,
                    node: node.id,
                    error: node.last_error,
                })
            })
            .collect();
        failed.sort_by(|a, b| a.path.cmp(&b.path));
        failed
    }
}
