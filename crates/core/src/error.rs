use std::io;

use ledgerd_primitives::buf::DecodeError;
use ledgerd_primitives::{GroupId, StorageTeamId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TLogError>;

/// Caller-visible errors of the log server.
///
/// Everything here is a protocol outcome the caller is expected to handle,
/// usually by retrying against a fresh interface or sequence. Invariant
/// violations are *not* represented here; those abort the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TLogError {
    /// The addressed generation has been stopped by a newer recovery.
    #[error("log generation is stopped")]
    TLogStopped,
    /// The generation hosts no such storage team.
    #[error("storage team {0} not found")]
    StorageTeamNotFound(StorageTeamId),
    /// The process hosts no such log group.
    #[error("log group {0} not found")]
    GroupNotFound(GroupId),
    /// No data at or beyond the requested version will ever be served.
    #[error("end of stream")]
    EndOfStream,
    /// A peek sequence tracker expired while the request waited.
    #[error("timed out")]
    TimedOut,
    /// This process has been displaced from the cluster.
    #[error("worker removed")]
    WorkerRemoved,
    /// Recruitment could not complete.
    #[error("recruitment failed: {0}")]
    RecruitmentFailed(String),
    /// The request refers to state that no longer exists.
    #[error("operation obsolete")]
    OperationObsolete,
    /// A checksum or accumulative-checksum mismatch. Fatal: the caller is
    /// expected to restart the process so it re-recovers from disk.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),
    /// A persistent device failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<io::Error> for TLogError {
    fn from(e: io::Error) -> Self {
        TLogError::Storage(e.to_string())
    }
}

impl From<DecodeError> for TLogError {
    fn from(e: DecodeError) -> Self {
        TLogError::Storage(e.to_string())
    }
}

impl TLogError {
    /// `true` for errors the caller handles by retrying elsewhere; `false`
    /// for conditions that end this process's participation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TLogError::TLogStopped
                | TLogError::StorageTeamNotFound(_)
                | TLogError::GroupNotFound(_)
                | TLogError::EndOfStream
                | TLogError::TimedOut
                | TLogError::OperationObsolete
        )
    }
}
