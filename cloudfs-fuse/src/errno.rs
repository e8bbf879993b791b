use cloudfs_engine::{EngineError, ErrorKind};
use thiserror::Error;

/// The only failures an adapter call can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Errno {
    #[error("no such file or directory")]
    NoEntry,
    #[error("file exists")]
    Exists,
    #[error("device or resource busy")]
    Busy,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("input/output error")]
    Io,
    #[error("no space left on device")]
    NoSpace,
    #[error("operation cancelled")]
    Cancelled,
    #[error("directory not empty")]
    NotEmpty,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("invalid argument")]
    Invalid,
}

impl Errno {
    pub fn code(self) -> i32 {
        match self {
            Errno::NoEntry => libc::ENOENT,
            Errno::Exists => libc::EEXIST,
            Errno::Busy => libc::EBUSY,
            Errno::Again => libc::EAGAIN,
            Errno::Io => libc::EIO,
            Errno::NoSpace => libc::ENOSPC,
            Errno::Cancelled => libc::ECANCELED,
            Errno::NotEmpty => libc::ENOTEMPTY,
            Errno::NotDir => libc::ENOTDIR,
            Errno::IsDir => libc::EISDIR,
            Errno::Invalid => libc::EINVAL,
        }
    }
}

impl From<ErrorKind> for Errno {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => Errno::NoEntry,
            ErrorKind::NameExists => Errno::Exists,
            ErrorKind::Conflict => Errno::Busy,
            ErrorKind::Transient => Errno::Again,
            ErrorKind::Permanent | ErrorKind::Io => Errno::Io,
            ErrorKind::CacheExhausted => Errno::NoSpace,
            ErrorKind::Cancelled => Errno::Cancelled,
            ErrorKind::NotEmpty => Errno::NotEmpty,
            ErrorKind::NotADirectory => Errno::NotDir,
            ErrorKind::IsADirectory => Errno::IsDir,
            ErrorKind::InvalidName => Errno::Invalid,
        }
    }
}

impl From<EngineError> for Errno {
    fn from(err: EngineError) -> Self {
        err.kind().into()
    }
}
