use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use crate::cache::CacheRecord;
use crate::meta::{Node, NodeId, NodeKind, SyncPoint, SyncState};
use crate::sync::queue::{RemoteOp, RemoteOpKind};
use crate::transfer::{Direction, JobRecord, JobState};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid node kind: {0}")]
    InvalidKind(String),
    #[error("invalid sync state: {0}")]
    InvalidState(String),
    #[error("invalid transfer direction: {0}")]
    InvalidDirection(String),
    #[error("invalid job state: {0}")]
    InvalidJobState(String),
    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: i64,
    pub path: String,
    pub renamed_local: String,
    pub created: i64,
    pub reason: String,
}

#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, IndexError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_file(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_node(&self, node: &Node, tombstone: bool) -> Result<(), IndexError> {
        let synced = node.synced.as_ref();
        sqlx::query(
            "INSERT INTO nodes (
                id, parent_id, name, kind, size, local_mtime,
                remote_id, remote_mtime, remote_size, checksum,
                synced_checksum, synced_mtime, synced_size,
                dirty, pinned, state, generation, last_error, refreshed_at, tombstone
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                name = excluded.name,
                kind = excluded.kind,
                size = excluded.size,
                local_mtime = excluded.local_mtime,
                remote_id = excluded.remote_id,
                remote_mtime = excluded.remote_mtime,
                remote_size = excluded.remote_size,
                checksum = excluded.checksum,
                synced_checksum = excluded.synced_checksum,
                synced_mtime = excluded.synced_mtime,
                synced_size = excluded.synced_size,
                dirty = excluded.dirty,
                pinned = excluded.pinned,
                state = excluded.state,
                generation = excluded.generation,
                last_error = excluded.last_error,
                refreshed_at = excluded.refreshed_at,
                tombstone = excluded.tombstone",
        )
        .bind(node.id.0 as i64)
        .bind(node.parent.map(|parent| parent.0 as i64))
        .bind(&node.name)
        .bind(node.kind.as_str())
        .bind(node.size as i64)
        .bind(node.local_mtime)
        .bind(&node.remote_id)
        .bind(node.remote_mtime)
        .bind(node.remote_size.map(|size| size as i64))
        .bind(&node.checksum)
        .bind(synced.and_then(|point| point.checksum.clone()))
        .bind(synced.map(|point| point.mtime))
        .bind(synced.map(|point| point.size as i64))
        .bind(if node.dirty { 1 } else { 0 })
        .bind(if node.pinned { 1 } else { 0 })
        .bind(node.state.as_str())
        .bind(node.generation as i64)
        .bind(&node.last_error)
        .bind(node.refreshed_at)
        .bind(if tombstone { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_node(&self, id: NodeId) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM nodes WHERE id = ?1")
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_nodes(&self) -> Result<Vec<(Node, bool)>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, parent_id, name, kind, size, local_mtime, remote_id, remote_mtime,
                    remote_size, checksum, synced_checksum, synced_mtime, synced_size,
                    dirty, pinned, state, generation, last_error, refreshed_at, tombstone
             FROM nodes
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let tombstone: i64 = row.try_get("tombstone")?;
            out.push((node_from_row(&row)?, tombstone != 0));
        }
        Ok(out)
    }

    pub async fn upsert_cache_entry(&self, record: &CacheRecord) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO cache_entries (node_id, chunk_offset, len, valid, accessed)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(node_id, chunk_offset) DO UPDATE SET
                len = excluded.len,
                valid = excluded.valid,
                accessed = excluded.accessed",
        )
        .bind(record.node.0 as i64)
        .bind(record.offset as i64)
        .bind(record.len as i64)
        .bind(if record.valid { 1 } else { 0 })
        .bind(record.accessed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_cache_entry(&self, node: NodeId, offset: u64) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM cache_entries WHERE node_id = ?1 AND chunk_offset = ?2")
            .bind(node.0 as i64)
            .bind(offset as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_cache_entries(&self) -> Result<Vec<CacheRecord>, IndexError> {
        let rows = sqlx::query(
            "SELECT node_id, chunk_offset, len, valid, accessed
             FROM cache_entries
             ORDER BY accessed ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let node: i64 = row.try_get("node_id")?;
            let offset: i64 = row.try_get("chunk_offset")?;
            let len: i64 = row.try_get("len")?;
            let valid: i64 = row.try_get("valid")?;
            let accessed: i64 = row.try_get("accessed")?;
            out.push(CacheRecord {
                node: NodeId(node as u64),
                offset: offset as u64,
                len: len as u64,
                valid: valid != 0,
                accessed: accessed as u64,
            });
        }
        Ok(out)
    }

    pub async fn upsert_job(&self, record: &JobRecord) -> Result<(), IndexError> {
        let target = record
            .target
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let done = serde_json::to_string(&record.done_chunks)?;
        sqlx::query(
            "INSERT INTO transfer_jobs (
                node_id, direction, state, remote_id, target, session, fingerprint,
                total, chunk_size, done_chunks, retries, generation, last_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(node_id, direction) DO UPDATE SET
                state = excluded.state,
                remote_id = excluded.remote_id,
                target = excluded.target,
                session = excluded.session,
                fingerprint = excluded.fingerprint,
                total = excluded.total,
                chunk_size = excluded.chunk_size,
                done_chunks = excluded.done_chunks,
                retries = excluded.retries,
                generation = excluded.generation,
                last_error = excluded.last_error",
        )
        .bind(record.node.0 as i64)
        .bind(record.direction.as_str())
        .bind(record.state.as_str())
        .bind(&record.remote_id)
        .bind(target)
        .bind(&record.session)
        .bind(&record.fingerprint)
        .bind(record.total as i64)
        .bind(record.chunk_size as i64)
        .bind(done)
        .bind(i64::from(record.retries))
        .bind(record.generation as i64)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_job(&self, node: NodeId, direction: Direction) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM transfer_jobs WHERE node_id = ?1 AND direction = ?2")
            .bind(node.0 as i64)
            .bind(direction.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_jobs(&self) -> Result<Vec<JobRecord>, IndexError> {
        let rows = sqlx::query(
            "SELECT node_id, direction, state, remote_id, target, session, fingerprint,
                    total, chunk_size, done_chunks, retries, generation, last_error
             FROM transfer_jobs
             ORDER BY node_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let node: i64 = row.try_get("node_id")?;
            let direction: String = row.try_get("direction")?;
            let state: String = row.try_get("state")?;
            let target: Option<String> = row.try_get("target")?;
            let done: String = row.try_get("done_chunks")?;
            let total: i64 = row.try_get("total")?;
            let chunk_size: i64 = row.try_get("chunk_size")?;
            let retries: i64 = row.try_get("retries")?;
            let generation: i64 = row.try_get("generation")?;
            out.push(JobRecord {
                node: NodeId(node as u64),
                direction: Direction::parse(&direction)
                    .ok_or(IndexError::InvalidDirection(direction))?,
                state: JobState::parse(&state).ok_or(IndexError::InvalidJobState(state))?,
                remote_id: row.try_get("remote_id")?,
                target: target
                    .map(|value| serde_json::from_str(&value))
                    .transpose()?,
                session: row.try_get("session")?,
                fingerprint: row.try_get("fingerprint")?,
                total: total as u64,
                chunk_size: chunk_size as u64,
                done_chunks: serde_json::from_str(&done)?,
                retries: retries.clamp(0, i64::from(u32::MAX)) as u32,
                generation: generation as u64,
                last_error: row.try_get("last_error")?,
            });
        }
        Ok(out)
    }

    pub async fn upsert_op(&self, op: &RemoteOp) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO remote_ops (id, kind, node_id, remote_id, attempt, retry_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                remote_id = excluded.remote_id,
                attempt = excluded.attempt,
                retry_at = excluded.retry_at,
                last_error = excluded.last_error",
        )
        .bind(op.id as i64)
        .bind(op.kind.as_str())
        .bind(op.node.0 as i64)
        .bind(&op.remote_id)
        .bind(i64::from(op.attempt))
        .bind(op.retry_at)
        .bind(&op.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_op(&self, id: u64) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM remote_ops WHERE id = ?1")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_ops(&self) -> Result<Vec<RemoteOp>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, kind, node_id, remote_id, attempt, retry_at, last_error
             FROM remote_ops
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let kind: String = row.try_get("kind")?;
            let node: i64 = row.try_get("node_id")?;
            let attempt: i64 = row.try_get("attempt")?;
            out.push(RemoteOp {
                id: id as u64,
                kind: RemoteOpKind::parse(&kind).ok_or(IndexError::InvalidOperationKind(kind))?,
                node: NodeId(node as u64),
                remote_id: row.try_get("remote_id")?,
                attempt: attempt.clamp(0, i64::from(u32::MAX)) as u32,
                retry_at: row.try_get("retry_at")?,
                last_error: row.try_get("last_error")?,
            });
        }
        Ok(out)
    }

    pub async fn record_conflict(&self, record: &ConflictRecord) -> Result<i64, IndexError> {
        let result = sqlx::query(
            "INSERT INTO conflicts (path, renamed_local, created, reason) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&record.path)
        .bind(&record.renamed_local)
        .bind(record.created)
        .bind(&record.reason)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, path, renamed_local, created, reason FROM conflicts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConflictRecord {
                id: row.try_get("id")?,
                path: row.try_get("path")?,
                renamed_local: row.try_get("renamed_local")?,
                created: row.try_get("created")?,
                reason: row.try_get("reason")?,
            });
        }
        Ok(out)
    }
}

fn node_from_row(row: &SqliteRow) -> Result<Node, IndexError> {
    let id: i64 = row.try_get("id")?;
    let parent: Option<i64> = row.try_get("parent_id")?;
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let size: i64 = row.try_get("size")?;
    let remote_size: Option<i64> = row.try_get("remote_size")?;
    let synced_mtime: Option<i64> = row.try_get("synced_mtime")?;
    let synced_size: Option<i64> = row.try_get("synced_size")?;
    let synced_checksum: Option<String> = row.try_get("synced_checksum")?;
    let dirty: i64 = row.try_get("dirty")?;
    let pinned: i64 = row.try_get("pinned")?;
    let generation: i64 = row.try_get("generation")?;

    Ok(Node {
        id: NodeId(id as u64),
        parent: parent.map(|parent| NodeId(parent as u64)),
        name: row.try_get("name")?,
        kind: NodeKind::parse(&kind).ok_or(IndexError::InvalidKind(kind))?,
        size: size as u64,
        local_mtime: row.try_get("local_mtime")?,
        remote_id: row.try_get("remote_id")?,
        remote_mtime: row.try_get("remote_mtime")?,
        remote_size: remote_size.map(|size| size as u64),
        checksum: row.try_get("checksum")?,
        synced: synced_mtime.map(|mtime| SyncPoint {
            checksum: synced_checksum,
            mtime,
            size: synced_size.unwrap_or(0) as u64,
        }),
        dirty: dirty != 0,
        pinned: pinned != 0,
        state: SyncState::parse(&state).ok_or(IndexError::InvalidState(state))?,
        generation: generation as u64,
        last_error: row.try_get("last_error")?,
        refreshed_at: row.try_get("refreshed_at")?,
    })
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
