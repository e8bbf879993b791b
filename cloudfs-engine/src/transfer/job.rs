use cloudfs_core::{RemoteEntry, UploadTarget};
use tokio::sync::watch;

use crate::error::ErrorKind;
use crate::meta::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload" => Some(Direction::Upload),
            "download" => Some(Direction::Download),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Failed,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Failed => "failed",
            JobState::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "paused" => Some(JobState::Paused),
            "failed" => Some(JobState::Failed),
            "done" => Some(JobState::Done),
            _ => None,
        }
    }

    /// Whether no worker will touch the job until it is submitted again.
    pub fn is_settled(&self) -> bool {
        matches!(self, JobState::Paused | JobState::Failed | JobState::Done)
    }
}

/// Persisted form of a transfer job. Chunk indexes in `done_chunks` are
/// committed: in the cache for downloads, in the remote session for uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub node: NodeId,
    pub direction: Direction,
    pub state: JobState,
    pub remote_id: Option<String>,
    pub target: Option<UploadTarget>,
    pub session: Option<String>,
    pub fingerprint: String,
    pub total: u64,
    pub chunk_size: u64,
    pub done_chunks: Vec<u64>,
    pub retries: u32,
    pub generation: u64,
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn chunk_count(&self) -> u64 {
        self.total.div_ceil(self.chunk_size.max(1))
    }

    pub fn chunk_range(&self, index: u64) -> (u64, u64) {
        let offset = index * self.chunk_size;
        (offset, self.chunk_size.min(self.total - offset))
    }

    pub fn is_done(&self, index: u64) -> bool {
        self.done_chunks.contains(&index)
    }

    pub fn mark_done(&mut self, index: u64) {
        if let Err(pos) = self.done_chunks.binary_search(&index) {
            self.done_chunks.insert(pos, index);
        }
    }

    pub fn done_bytes(&self) -> u64 {
        self.done_chunks
            .iter()
            .filter(|index| **index < self.chunk_count())
            .map(|index| self.chunk_range(*index).1)
            .sum()
    }
}

/// What a caller asks the manager to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    Download { node: NodeId },
    Upload { node: NodeId, target: UploadTarget },
}

impl JobRequest {
    pub fn node(&self) -> NodeId {
        match self {
            JobRequest::Download { node } | JobRequest::Upload { node, .. } => *node,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            JobRequest::Download { .. } => Direction::Download,
            JobRequest::Upload { .. } => Direction::Upload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Snapshot published to job watchers after every state change and chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub done: u64,
    pub total: u64,
    pub failure: Option<JobFailure>,
}

impl JobStatus {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return if self.state == JobState::Done { 1.0 } else { 0.0 };
        }
        self.done as f64 / self.total as f64
    }
}

/// Job outcomes delivered to the sync engine.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Downloaded {
        node: NodeId,
    },
    Uploaded {
        node: NodeId,
        entry: RemoteEntry,
        generation: u64,
    },
    Paused {
        node: NodeId,
        direction: Direction,
    },
    Failed {
        node: NodeId,
        direction: Direction,
        generation: u64,
        failure: JobFailure,
    },
}

/// Observer for one job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub node: NodeId,
    pub direction: Direction,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub(crate) fn new(node: NodeId, direction: Direction, status: watch::Receiver<JobStatus>) -> Self {
        Self {
            node,
            direction,
            status,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn progress(&self) -> f64 {
        self.status.borrow().fraction()
    }

    /// Waits for the next published status. False once the job is gone.
    pub async fn changed(&mut self) -> bool {
        self.status.changed().await.is_ok()
    }

    /// Waits until the job is done, failed or paused.
    pub async fn wait(&mut self) -> JobStatus {
        let settled = self
            .status
            .wait_for(|status| status.state.is_settled())
            .await
            .map(|status| status.clone());
        match settled {
            Ok(status) => status,
            Err(_) => self.status.borrow().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total: u64, chunk_size: u64) -> JobRecord {
        JobRecord {
            node: NodeId(2),
            direction: Direction::Download,
            state: JobState::Queued,
            remote_id: Some("r".into()),
            target: None,
            session: None,
            fingerprint: String::new(),
            total,
            chunk_size,
            done_chunks: Vec::new(),
            retries: 0,
            generation: 0,
            last_error: None,
        }
    }

    #[test]
    fn last_chunk_is_short() {
        let job = record(10, 4);
        assert_eq!(job.chunk_count(), 3);
        assert_eq!(job.chunk_range(2), (8, 2));
        assert_eq!(record(0, 4).chunk_count(), 0);
    }

    #[test]
    fn done_chunks_stay_sorted_and_unique() {
        let mut job = record(10, 4);
        job.mark_done(2);
        job.mark_done(0);
        job.mark_done(2);
        assert_eq!(job.done_chunks, vec![0, 2]);
        assert_eq!(job.done_bytes(), 6);
    }

    #[test]
    fn names_round_trip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Paused,
            JobState::Failed,
            JobState::Done,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(Direction::parse("upload"), Some(Direction::Upload));
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn empty_job_reports_full_progress_only_when_done() {
        let mut status = JobStatus {
            state: JobState::Running,
            done: 0,
            total: 0,
            failure: None,
        };
        assert_eq!(status.fraction(), 0.0);
        status.state = JobState::Done;
        assert_eq!(status.fraction(), 1.0);
    }

    #[tokio::test]
    async fn wait_returns_the_last_status_once_the_job_is_gone() {
        let (tx, rx) = watch::channel(JobStatus {
            state: JobState::Running,
            done: 1,
            total: 4,
            failure: None,
        });
        let mut handle = JobHandle::new(NodeId(2), Direction::Download, rx);
        drop(tx);

        let status = handle.wait().await;
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.done, 1);
    }
}
