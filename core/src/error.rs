use nix::errno::Errno;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExFatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No such file or directory")]
    NotFound,

    #[error("File exists")]
    AlreadyExists,

    #[error("Not a directory")]
    NotADirectory,

    #[error("Is a directory")]
    IsADirectory,

    #[error("Directory not empty")]
    DirectoryNotEmpty,

    #[error("No free space left")]
    NoSpace,

    #[error("Filesystem is corrupted: {0}")]
    Corrupted(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Name is too long")]
    NameTooLong,

    #[error("Filesystem is mounted read-only")]
    ReadOnly,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type ExFatResult<T> = Result<T, ExFatError>;

impl ExFatError {
    /// Negative POSIX error code handed back to FUSE-style callers.
    pub fn errno(&self) -> i32 {
        let errno = match self {
            ExFatError::Io(e) => e.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO),
            ExFatError::NotFound => Errno::ENOENT,
            ExFatError::AlreadyExists => Errno::EEXIST,
            ExFatError::NotADirectory => Errno::ENOTDIR,
            ExFatError::IsADirectory => Errno::EISDIR,
            ExFatError::DirectoryNotEmpty => Errno::ENOTEMPTY,
            ExFatError::NoSpace => Errno::ENOSPC,
            ExFatError::Corrupted(_) | ExFatError::InvalidVolume(_) => Errno::EIO,
            ExFatError::InvalidName(_) => Errno::ENOENT,
            ExFatError::NameTooLong => Errno::ENAMETOOLONG,
            ExFatError::ReadOnly => Errno::EROFS,
            ExFatError::InvalidArgument(_) => Errno::EINVAL,
        };
        -(errno as i32)
    }

    /// Whether this error reports a damaged or unusable volume rather than a
    /// caller mistake.
    pub fn is_corruption(&self) -> bool {
        matches!(self, ExFatError::Corrupted(_) | ExFatError::InvalidVolume(_))
    }
}

/// Count of Error-severity events seen by one mounted volume.
///
/// Callers that tolerate a failed operation can still check whether the
/// volume reported damage along the way.
#[derive(Debug, Default)]
pub struct ErrorCounter(AtomicU32);

impl ErrorCounter {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn record(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[doc(hidden)]
pub use log as __log;

/// Abort on a broken internal invariant.
///
/// Used where continuing would risk further damage to the volume: a
/// reference count going negative, a short device transfer, a cluster
/// number that was already validated turning out invalid.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::error::__log::error!("BUG: {}", message);
        panic!("BUG: {}", message)
    }};
}
