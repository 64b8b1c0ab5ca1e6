use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the readers in this crate.
///
/// `Error` is `Clone` so a failed reader can keep its status and surface it
/// again on every later call. Operating system errors are captured as the
/// failing operation plus the stringified errno.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// An operating system call failed.
    #[error("{op} failed on {target}: {message}")]
    Io {
        op: &'static str,
        target: String,
        message: String,
    },
    /// The caller violated a precondition of the call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The reader's state forbids the operation.
    #[error("{0}")]
    FailedPrecondition(String),
    /// The file contents do not form a valid record file.
    #[error("data loss: {0}")]
    DataLoss(String),
    /// A position lies outside the source.
    #[error("{0}")]
    OutOfRange(String),
    /// Clean end of file in the middle of a structure. The source may still
    /// grow, so this does not poison the reader.
    #[error("truncated: {0}")]
    Truncated(String),
    /// The reader was closed before the call.
    #[error("reader is closed")]
    Closed,
}

impl Error {
    pub(crate) fn io(op: &'static str, target: impl Into<String>, err: io::Error) -> Self {
        Error::Io {
            op,
            target: target.into(),
            message: err.to_string(),
        }
    }

    /// Captures errno of the syscall that just failed.
    pub(crate) fn last_os(op: &'static str, target: impl Into<String>) -> Self {
        Self::io(op, target, io::Error::last_os_error())
    }

    pub fn is_data_loss(&self) -> bool {
        matches!(self, Error::DataLoss(_))
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Error::Truncated(_))
    }
}
