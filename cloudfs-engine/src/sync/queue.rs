use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::meta::NodeId;
use crate::persist::{Journal, JournalEntry};

/// Remote namespace change waiting to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOpKind {
    Mkdir,
    Delete,
    Rename,
}

impl RemoteOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteOpKind::Mkdir => "mkdir",
            RemoteOpKind::Delete => "delete",
            RemoteOpKind::Rename => "rename",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mkdir" => Some(RemoteOpKind::Mkdir),
            "delete" => Some(RemoteOpKind::Delete),
            "rename" => Some(RemoteOpKind::Rename),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOp {
    pub id: u64,
    pub kind: RemoteOpKind,
    pub node: NodeId,
    /// Remote identity captured at enqueue time; deletes need it after the
    /// node itself is gone.
    pub remote_id: Option<String>,
    pub attempt: u32,
    /// Unix seconds before which the op is not retried.
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
}

impl RemoteOp {
    fn is_ready(&self, now: i64) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ops: VecDeque<RemoteOp>,
    next_id: u64,
}

/// FIFO of remote namespace operations, one per node and kind.
#[derive(Debug)]
pub struct OperationQueue {
    state: Mutex<QueueState>,
    journal: Journal,
}

impl OperationQueue {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ops: VecDeque::new(),
                next_id: 1,
            }),
            journal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn restore(&self, mut ops: Vec<RemoteOp>) {
        ops.sort_by_key(|op| op.id);
        let mut state = self.lock();
        state.next_id = ops.last().map_or(1, |op| op.id + 1).max(state.next_id);
        state.ops = ops.into();
        debug!(ops = state.ops.len(), "remote operations restored");
    }

    /// Queues `kind` for `node`. An op of the same kind already pending is
    /// made ready again instead of being duplicated. A delete supersedes
    /// every other op of the node.
    pub fn enqueue(&self, kind: RemoteOpKind, node: NodeId, remote_id: Option<String>) -> RemoteOp {
        let mut state = self.lock();
        if kind == RemoteOpKind::Delete {
            let journal = &self.journal;
            state.ops.retain(|op| {
                let superseded = op.node == node && op.kind != RemoteOpKind::Delete;
                if superseded {
                    journal.record(JournalEntry::OpRemoved(op.id));
                }
                !superseded
            });
        }
        if let Some(existing) = state
            .ops
            .iter_mut()
            .find(|op| op.kind == kind && op.node == node)
        {
            existing.retry_at = None;
            if remote_id.is_some() {
                existing.remote_id = remote_id;
            }
            let op = existing.clone();
            self.journal.record(JournalEntry::Op(op.clone()));
            return op;
        }
        let op = RemoteOp {
            id: state.next_id,
            kind,
            node,
            remote_id,
            attempt: 0,
            retry_at: None,
            last_error: None,
        };
        state.next_id += 1;
        state.ops.push_back(op.clone());
        self.journal.record(JournalEntry::Op(op.clone()));
        op
    }

    /// Oldest op whose retry time has passed. It stays queued until
    /// [`complete`](Self::complete) or [`requeue`](Self::requeue).
    pub fn next_ready(&self, now: i64) -> Option<RemoteOp> {
        self.lock().ops.iter().find(|op| op.is_ready(now)).cloned()
    }

    pub fn complete(&self, id: u64) {
        let mut state = self.lock();
        if let Some(pos) = state.ops.iter().position(|op| op.id == id) {
            state.ops.remove(pos);
            self.journal.record(JournalEntry::OpRemoved(id));
        }
    }

    /// Moves the op to the back of the queue, not before `retry_at`.
    pub fn requeue(&self, id: u64, retry_at: i64, error: Option<String>) -> Option<RemoteOp> {
        let mut state = self.lock();
        let pos = state.ops.iter().position(|op| op.id == id)?;
        let mut op = state.ops.remove(pos)?;
        op.attempt += 1;
        op.retry_at = Some(retry_at);
        op.last_error = error;
        state.ops.push_back(op.clone());
        self.journal.record(JournalEntry::Op(op.clone()));
        Some(op)
    }

    /// Like [`requeue`](Self::requeue) without counting an attempt.
    pub fn defer(&self, id: u64, retry_at: i64) -> Option<RemoteOp> {
        let mut state = self.lock();
        let pos = state.ops.iter().position(|op| op.id == id)?;
        let mut op = state.ops.remove(pos)?;
        op.retry_at = Some(retry_at);
        state.ops.push_back(op.clone());
        self.journal.record(JournalEntry::Op(op.clone()));
        Some(op)
    }

    pub fn has_pending(&self, node: NodeId, kind: RemoteOpKind) -> bool {
        self.lock()
            .ops
            .iter()
            .any(|op| op.node == node && op.kind == kind)
    }

    pub fn pending(&self) -> Vec<RemoteOp> {
        self.lock().ops.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = OperationQueue::new(Journal::disabled());
        queue.enqueue(RemoteOpKind::Mkdir, NodeId(2), None);
        queue.enqueue(RemoteOpKind::Rename, NodeId(3), Some("r3".into()));

        let first = queue.next_ready(0).unwrap();
        assert_eq!(first.kind, RemoteOpKind::Mkdir);
        queue.complete(first.id);
        assert_eq!(queue.next_ready(0).unwrap().node, NodeId(3));
    }

    #[test]
    fn same_kind_for_a_node_is_queued_once() {
        let queue = OperationQueue::new(Journal::disabled());
        let first = queue.enqueue(RemoteOpKind::Rename, NodeId(4), None);
        queue.requeue(first.id, 100, Some("busy".into()));

        let again = queue.enqueue(RemoteOpKind::Rename, NodeId(4), Some("r4".into()));

        assert_eq!(queue.len(), 1);
        assert_eq!(again.id, first.id);
        assert_eq!(again.retry_at, None);
        assert_eq!(again.remote_id.as_deref(), Some("r4"));
    }

    #[test]
    fn delete_supersedes_other_ops_of_the_node() {
        let queue = OperationQueue::new(Journal::disabled());
        queue.enqueue(RemoteOpKind::Rename, NodeId(5), Some("r5".into()));
        queue.enqueue(RemoteOpKind::Mkdir, NodeId(6), None);

        queue.enqueue(RemoteOpKind::Delete, NodeId(5), Some("r5".into()));

        let kinds: Vec<_> = queue.pending().iter().map(|op| (op.node, op.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (NodeId(6), RemoteOpKind::Mkdir),
                (NodeId(5), RemoteOpKind::Delete)
            ]
        );
    }

    #[test]
    fn requeued_op_waits_for_retry_time() {
        let queue = OperationQueue::new(Journal::disabled());
        let op = queue.enqueue(RemoteOpKind::Delete, NodeId(7), Some("r7".into()));
        queue.enqueue(RemoteOpKind::Mkdir, NodeId(8), None);

        let requeued = queue.requeue(op.id, 50, Some("503".into())).unwrap();

        assert_eq!(requeued.attempt, 1);
        assert_eq!(queue.next_ready(10).unwrap().node, NodeId(8));
        queue.complete(queue.next_ready(10).unwrap().id);
        assert!(queue.next_ready(10).is_none());
        assert_eq!(queue.next_ready(50).unwrap().id, op.id);
    }

    #[test]
    fn restore_continues_id_sequence() {
        let queue = OperationQueue::new(Journal::disabled());
        queue.restore(vec![RemoteOp {
            id: 9,
            kind: RemoteOpKind::Delete,
            node: NodeId(2),
            remote_id: Some("r2".into()),
            attempt: 3,
            retry_at: None,
            last_error: None,
        }]);

        let op = queue.enqueue(RemoteOpKind::Mkdir, NodeId(3), None);

        assert_eq!(op.id, 10);
        assert!(queue.has_pending(NodeId(2), RemoteOpKind::Delete));
    }
}
