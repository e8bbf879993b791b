mod client;
pub mod memory;
mod store;

pub use client::HttpRemote;
pub use memory::{MemoryRemote, RemoteCall};
pub use store::{
    ApiErrorClass, EntryKind, RemoteEntry, RemoteError, RemoteStore, UploadTarget,
};
