use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock};

use super::NodeId;

const PRUNE_THRESHOLD: usize = 1024;

/// Lazily created locks, dropped once nobody holds a handle.
pub(crate) struct LockTable<K, L> {
    slots: Mutex<HashMap<K, Weak<L>>>,
}

impl<K, L> Default for LockTable<K, L> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, L: Default> LockTable<K, L> {
    pub(crate) fn get(&self, key: &K) -> Arc<L> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slots.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        if slots.len() >= PRUNE_THRESHOLD {
            slots.retain(|_, slot| slot.strong_count() > 0);
        }
        let fresh = Arc::new(L::default());
        slots.insert(key.clone(), Arc::downgrade(&fresh));
        fresh
    }
}

pub(crate) type NodeLocks = LockTable<NodeId, AsyncRwLock<()>>;

#[derive(Default)]
pub(crate) struct DirLocks {
    table: LockTable<String, AsyncMutex<()>>,
}

/// Held directory locks; released on drop.
pub struct DirGuards {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl DirLocks {
    /// Acquires every lock in lexicographic path order.
    pub(crate) async fn lock(&self, paths: &[&str]) -> DirGuards {
        let mut keys: Vec<String> = paths.iter().map(|path| path.to_string()).collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.table.get(&key).lock_owned().await);
        }
        DirGuards { _guards: guards }
    }
}
