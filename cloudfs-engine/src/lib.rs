pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod meta;
pub mod paths;
pub mod persist;
pub mod sync;
pub mod transfer;

pub use config::{ConflictPolicy, EngineConfig, ReadMode};
pub use context::{EngineContext, EngineStatus, FailedUpload};
pub use error::{EngineError, ErrorKind};
pub use meta::{MetadataStore, Node, NodeId, NodeKind, SyncState};

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
