//! In-process `RemoteStore` used by tests and local experiments.
//!
//! Every mutation bumps a logical clock that doubles as the entry mtime, so
//! two successive writes always look different to the sync engine. Failures
//! can be scripted per call kind with [`MemoryRemote::fail_next`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;

use crate::store::{ApiErrorClass, EntryKind, RemoteEntry, RemoteError, RemoteStore, UploadTarget};

pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    List,
    GetRange,
    BeginUpload,
    UploadChunk,
    FinishUpload,
    CreateDir,
    Delete,
    Rename,
}

#[derive(Debug, Clone)]
struct MemEntry {
    parent: Option<String>,
    name: String,
    kind: EntryKind,
    data: Bytes,
    mtime: i64,
}

#[derive(Debug)]
struct Session {
    target: UploadTarget,
    size: u64,
    chunks: BTreeMap<u64, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, MemEntry>,
    sessions: HashMap<String, Session>,
    next_id: u64,
    clock: i64,
    failures: HashMap<RemoteCall, VecDeque<Option<ApiErrorClass>>>,
    range_log: Vec<(String, u64, u64)>,
    chunk_log: Vec<(String, u64)>,
    calls: HashMap<RemoteCall, usize>,
    range_delay: Option<Duration>,
}

#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut state = State::default();
        state.entries.insert(
            ROOT_ID.to_string(),
            MemEntry {
                parent: None,
                name: String::new(),
                kind: EntryKind::Dir,
                data: Bytes::new(),
                mtime: 0,
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` calls of `call` fail with an error of `class`.
    pub fn fail_next(&self, call: RemoteCall, count: usize, class: ApiErrorClass) {
        let mut state = self.lock();
        let queue = state.failures.entry(call).or_default();
        queue.extend(std::iter::repeat_n(Some(class), count));
    }

    /// Lets `passes` calls of `call` through, then fails the one after.
    pub fn fail_after(&self, call: RemoteCall, passes: usize, class: ApiErrorClass) {
        let mut state = self.lock();
        let queue = state.failures.entry(call).or_default();
        queue.extend(std::iter::repeat_n(None, passes));
        queue.push_back(Some(class));
    }

    pub fn set_range_delay(&self, delay: Option<Duration>) {
        self.lock().range_delay = delay;
    }

    pub fn insert_dir(&self, parent_id: &str, name: &str) -> String {
        self.insert(parent_id, name, EntryKind::Dir, Bytes::new())
    }

    pub fn insert_file(&self, parent_id: &str, name: &str, data: impl Into<Bytes>) -> String {
        self.insert(parent_id, name, EntryKind::File, data.into())
    }

    /// Replaces the content of an existing file as if another client wrote it.
    pub fn update_file(&self, id: &str, data: impl Into<Bytes>) {
        let mut state = self.lock();
        state.clock += 1;
        let clock = state.clock;
        if let Some(entry) = state.entries.get_mut(id) {
            entry.data = data.into();
            entry.mtime = clock;
        }
    }

    pub fn remove(&self, id: &str) {
        let mut state = self.lock();
        remove_tree(&mut state, id);
    }

    pub fn content(&self, id: &str) -> Option<Bytes> {
        self.lock().entries.get(id).map(|entry| entry.data.clone())
    }

    pub fn name_of(&self, id: &str) -> Option<String> {
        self.lock().entries.get(id).map(|entry| entry.name.clone())
    }

    pub fn parent_of(&self, id: &str) -> Option<String> {
        self.lock().entries.get(id).and_then(|entry| entry.parent.clone())
    }

    pub fn find(&self, parent_id: &str, name: &str) -> Option<String> {
        let state = self.lock();
        state
            .entries
            .iter()
            .find(|(_, entry)| entry.parent.as_deref() == Some(parent_id) && entry.name == name)
            .map(|(id, _)| id.clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// `(id, offset, length)` of every successful range read, in call order.
    pub fn range_log(&self) -> Vec<(String, u64, u64)> {
        self.lock().range_log.clone()
    }

    /// `(session, offset)` of every accepted upload chunk, in call order.
    pub fn chunk_log(&self) -> Vec<(String, u64)> {
        self.lock().chunk_log.clone()
    }

    pub fn calls(&self, call: RemoteCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    fn insert(&self, parent_id: &str, name: &str, kind: EntryKind, data: Bytes) -> String {
        let mut state = self.lock();
        let id = next_id(&mut state);
        state.clock += 1;
        let mtime = state.clock;
        state.entries.insert(
            id.clone(),
            MemEntry {
                parent: Some(parent_id.to_string()),
                name: name.to_string(),
                kind,
                data,
                mtime,
            },
        );
        id
    }

    fn begin_call(&self, call: RemoteCall) -> Result<MutexGuard<'_, State>, RemoteError> {
        let mut state = self.lock();
        *state.calls.entry(call).or_default() += 1;
        if let Some(Some(class)) = state.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            return Err(injected(class));
        }
        Ok(state)
    }
}

fn next_id(state: &mut State) -> String {
    state.next_id += 1;
    format!("n{}", state.next_id)
}

fn remove_tree(state: &mut State, id: &str) {
    let children: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, entry)| entry.parent.as_deref() == Some(id))
        .map(|(child, _)| child.clone())
        .collect();
    for child in children {
        remove_tree(state, &child);
    }
    state.entries.remove(id);
}

fn injected(class: ApiErrorClass) -> RemoteError {
    let status = match class {
        ApiErrorClass::Auth => StatusCode::UNAUTHORIZED,
        ApiErrorClass::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ApiErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ApiErrorClass::NotFound => StatusCode::NOT_FOUND,
        ApiErrorClass::Permanent => StatusCode::INSUFFICIENT_STORAGE,
    };
    RemoteError::api(status, "injected failure")
}

fn not_found(id: &str) -> RemoteError {
    RemoteError::api(StatusCode::NOT_FOUND, format!("no entry {id}"))
}

fn entry_view(id: &str, entry: &MemEntry) -> RemoteEntry {
    RemoteEntry {
        id: id.to_string(),
        name: entry.name.clone(),
        kind: entry.kind,
        size: entry.data.len() as u64,
        mtime: entry.mtime,
        checksum: match entry.kind {
            EntryKind::File => Some(format!("{:x}", md5::compute(&entry.data))),
            EntryKind::Dir => None,
        },
    }
}

fn name_taken(state: &State, parent_id: &str, name: &str, except: Option<&str>) -> bool {
    state.entries.iter().any(|(id, entry)| {
        entry.parent.as_deref() == Some(parent_id)
            && entry.name == name
            && Some(id.as_str()) != except
    })
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_children(&self, dir_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let state = self.begin_call(RemoteCall::List)?;
        match state.entries.get(dir_id) {
            Some(entry) if entry.kind == EntryKind::Dir => {}
            _ => return Err(not_found(dir_id)),
        }
        let mut out: Vec<RemoteEntry> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.parent.as_deref() == Some(dir_id))
            .map(|(id, entry)| entry_view(id, entry))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Bytes, RemoteError> {
        let delay = self.lock().range_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.begin_call(RemoteCall::GetRange)?;
        let data = state
            .entries
            .get(id)
            .filter(|entry| entry.kind == EntryKind::File)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| not_found(id))?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());
        state.range_log.push((id.to_string(), offset, length));
        Ok(data.slice(start..end))
    }

    async fn begin_upload(&self, target: &UploadTarget, size: u64) -> Result<String, RemoteError> {
        let mut state = self.begin_call(RemoteCall::BeginUpload)?;
        match target {
            UploadTarget::Replace { id } if !state.entries.contains_key(id) => {
                return Err(not_found(id));
            }
            UploadTarget::Create { parent_id, .. } if !state.entries.contains_key(parent_id) => {
                return Err(not_found(parent_id));
            }
            _ => {}
        }
        let session = format!("s{}", state.sessions.len() + 1);
        state.sessions.insert(
            session.clone(),
            Session {
                target: target.clone(),
                size,
                chunks: BTreeMap::new(),
            },
        );
        Ok(session)
    }

    async fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        let mut state = self.begin_call(RemoteCall::UploadChunk)?;
        let upload = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| not_found(session))?;
        upload.chunks.insert(offset, data);
        state.chunk_log.push((session.to_string(), offset));
        Ok(())
    }

    async fn finish_upload(&self, session: &str) -> Result<RemoteEntry, RemoteError> {
        let mut state = self.begin_call(RemoteCall::FinishUpload)?;
        let upload = state
            .sessions
            .remove(session)
            .ok_or_else(|| not_found(session))?;
        let mut buf = BytesMut::with_capacity(upload.size as usize);
        for (offset, chunk) in &upload.chunks {
            if *offset != buf.len() as u64 {
                return Err(RemoteError::api(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("gap before offset {offset}"),
                ));
            }
            buf.extend_from_slice(chunk);
        }
        if buf.len() as u64 != upload.size {
            return Err(RemoteError::api(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("expected {} bytes, got {}", upload.size, buf.len()),
            ));
        }
        state.clock += 1;
        let mtime = state.clock;
        let id = match upload.target {
            UploadTarget::Replace { id } => {
                let entry = state.entries.get_mut(&id).ok_or_else(|| not_found(&id))?;
                entry.data = buf.freeze();
                entry.mtime = mtime;
                id
            }
            UploadTarget::Create { parent_id, name } => {
                let existing = state
                    .entries
                    .iter()
                    .find(|(_, entry)| {
                        entry.parent.as_deref() == Some(parent_id.as_str()) && entry.name == name
                    })
                    .map(|(id, _)| id.clone());
                let id = match existing {
                    Some(id) => id,
                    None => next_id(&mut state),
                };
                state.entries.insert(
                    id.clone(),
                    MemEntry {
                        parent: Some(parent_id),
                        name,
                        kind: EntryKind::File,
                        data: buf.freeze(),
                        mtime,
                    },
                );
                id
            }
        };
        let entry = state.entries.get(&id).ok_or_else(|| not_found(&id))?;
        Ok(entry_view(&id, entry))
    }

    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<RemoteEntry, RemoteError> {
        let mut state = self.begin_call(RemoteCall::CreateDir)?;
        if !state.entries.contains_key(parent_id) {
            return Err(not_found(parent_id));
        }
        if name_taken(&state, parent_id, name, None) {
            return Err(RemoteError::api(StatusCode::UNPROCESSABLE_ENTITY, "name exists"));
        }
        let id = next_id(&mut state);
        state.clock += 1;
        let entry = MemEntry {
            parent: Some(parent_id.to_string()),
            name: name.to_string(),
            kind: EntryKind::Dir,
            data: Bytes::new(),
            mtime: state.clock,
        };
        let view = entry_view(&id, &entry);
        state.entries.insert(id, entry);
        Ok(view)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin_call(RemoteCall::Delete)?;
        if !state.entries.contains_key(id) {
            return Err(not_found(id));
        }
        remove_tree(&mut state, id);
        Ok(())
    }

    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        new_parent: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError> {
        let mut state = self.begin_call(RemoteCall::Rename)?;
        let parent = match new_parent {
            Some(parent) => parent.to_string(),
            None => state
                .entries
                .get(id)
                .and_then(|entry| entry.parent.clone())
                .ok_or_else(|| not_found(id))?,
        };
        if !state.entries.contains_key(&parent) {
            return Err(not_found(&parent));
        }
        if name_taken(&state, &parent, new_name, Some(id)) {
            return Err(RemoteError::api(StatusCode::UNPROCESSABLE_ENTITY, "name exists"));
        }
        state.clock += 1;
        let clock = state.clock;
        let entry = state.entries.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.name = new_name.to_string();
        entry.parent = Some(parent);
        entry.mtime = clock;
        let entry = entry.clone();
        Ok(entry_view(id, &entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunked_upload_creates_entry_with_checksum() {
        let remote = MemoryRemote::new();
        let target = UploadTarget::Create {
            parent_id: ROOT_ID.into(),
            name: "a.txt".into(),
        };
        let session = remote.begin_upload(&target, 5).await.unwrap();
        remote
            .upload_chunk(&session, 0, Bytes::from_static(b"hel"))
            .await
            .unwrap();
        remote
            .upload_chunk(&session, 3, Bytes::from_static(b"lo"))
            .await
            .unwrap();
        let entry = remote.finish_upload(&session).await.unwrap();

        assert_eq!(entry.size, 5);
        assert_eq!(
            entry.checksum.as_deref(),
            Some(format!("{:x}", md5::compute(b"hello")).as_str())
        );
        assert_eq!(remote.content(&entry.id).unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let remote = MemoryRemote::new();
        let id = remote.insert_file(ROOT_ID, "a", Bytes::from_static(b"abc"));
        remote.fail_next(RemoteCall::GetRange, 1, ApiErrorClass::Transient);

        let err = remote.get_range(&id, 0, 3).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(remote.get_range(&id, 1, 2).await.unwrap(), Bytes::from_static(b"bc"));
        assert_eq!(remote.range_log(), vec![(id, 1, 2)]);
    }

    #[tokio::test]
    async fn delete_removes_subtree() {
        let remote = MemoryRemote::new();
        let dir = remote.insert_dir(ROOT_ID, "d");
        let file = remote.insert_file(&dir, "f", Bytes::from_static(b"x"));
        remote.delete(&dir).await.unwrap();
        assert!(!remote.exists(&file));
        assert!(remote.list_children(ROOT_ID).await.unwrap().is_empty());
    }
}
