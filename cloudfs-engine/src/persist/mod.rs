//! Durable state: the sqlite index and the in-order journal that feeds it.

mod index;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheRecord;
use crate::meta::{Node, NodeId};
use crate::sync::queue::RemoteOp;
use crate::transfer::{Direction, JobRecord};

pub use index::{ConflictRecord, IndexError, IndexStore};

/// One durable change, applied by the persister in send order.
#[derive(Debug)]
pub enum JournalEntry {
    Node { node: Node, tombstone: bool },
    NodeRemoved(NodeId),
    CacheEntry(CacheRecord),
    CacheEntryRemoved { node: NodeId, offset: u64 },
    Job(JobRecord),
    JobRemoved { node: NodeId, direction: Direction },
    Op(RemoteOp),
    OpRemoved(u64),
    Conflict(ConflictRecord),
    Barrier(oneshot::Sender<()>),
}

/// Sending half of the journal. A disabled journal drops every entry.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    tx: Option<mpsc::UnboundedSender<JournalEntry>>,
}

impl Journal {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JournalEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn record(&self, entry: JournalEntry) {
        if let Some(tx) = &self.tx
            && tx.send(entry).is_err()
        {
            debug!("journal closed; entry dropped");
        }
    }

    /// Resolves once every entry recorded before the call is durable.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.record(JournalEntry::Barrier(tx));
        let _ = rx.await;
    }
}

pub fn spawn_persister(
    store: IndexStore,
    mut rx: mpsc::UnboundedReceiver<JournalEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            if let Err(err) = store.apply(entry).await {
                warn!(error = %err, "failed to persist journal entry");
            }
        }
        debug!("persister stopped");
    })
}

/// Everything the engine reloads on startup.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub nodes: Vec<(Node, bool)>,
    pub cache: Vec<CacheRecord>,
    pub jobs: Vec<JobRecord>,
    pub ops: Vec<RemoteOp>,
}

impl IndexStore {
    pub async fn load(&self) -> Result<Snapshot, IndexError> {
        Ok(Snapshot {
            nodes: self.load_nodes().await?,
            cache: self.load_cache_entries().await?,
            jobs: self.load_jobs().await?,
            ops: self.load_ops().await?,
        })
    }

    pub async fn apply(&self, entry: JournalEntry) -> Result<(), IndexError> {
        match entry {
            JournalEntry::Node { node, tombstone } => self.upsert_node(&node, tombstone).await,
            JournalEntry::NodeRemoved(id) => self.delete_node(id).await,
            JournalEntry::CacheEntry(record) => self.upsert_cache_entry(&record).await,
            JournalEntry::CacheEntryRemoved { node, offset } => {
                self.delete_cache_entry(node, offset).await
            }
            JournalEntry::Job(record) => self.upsert_job(&record).await,
            JournalEntry::JobRemoved { node, direction } => self.delete_job(node, direction).await,
            JournalEntry::Op(op) => self.upsert_op(&op).await,
            JournalEntry::OpRemoved(id) => self.delete_op(id).await,
            JournalEntry::Conflict(record) => self.record_conflict(&record).await.map(|_| ()),
            JournalEntry::Barrier(done) => {
                let _ = done.send(());
                Ok(())
            }
        }
    }
}
