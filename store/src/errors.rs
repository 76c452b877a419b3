use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A bounded wait on one of the named primitives ran out of time.
    #[error("timed out after {waited:?} waiting for {primitive}")]
    LockTimeout {
        primitive: &'static str,
        waited: Duration,
    },

    /// The write gate was held by a process that no longer exists.
    #[error("{primitive} was abandoned by process {owner_pid}")]
    LockAbandoned {
        primitive: &'static str,
        owner_pid: u32,
    },

    #[error("cannot access {}: {source}", .path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot serialize snapshot of {}: {source}", .path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    // raw_sync reports failures as non-Send boxed errors, so only the message is kept.
    #[error("{context}: {message}")]
    Primitive {
        context: &'static str,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub(crate) fn primitive(context: &'static str, err: impl fmt::Display) -> StoreError {
        StoreError::Primitive {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn file_access(path: impl Into<PathBuf>, source: io::Error) -> StoreError {
        StoreError::FileAccess {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl Into<PathBuf>, source: CodecError) -> StoreError {
        StoreError::Serialization {
            path: path.into(),
            source,
        }
    }

    /// True for the two lock-wait failures (`LockTimeout`, `LockAbandoned`).
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout { .. } | StoreError::LockAbandoned { .. }
        )
    }
}
