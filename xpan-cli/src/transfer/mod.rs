pub mod downloader;
pub mod hash_cache;
pub mod hasher;
pub mod pool;
pub mod resume;
pub mod retry;
pub mod uploader;

use std::path::PathBuf;

use thiserror::Error;
use xpan_core::{ErrorClass, XpanError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("api error: {0}")]
    Api(#[from] XpanError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] crate::paths::PathError),
    #[error("local file changed during transfer: {}", .0.display())]
    FileChanged(PathBuf),
    #[error("remote path already exists: {0}")]
    Conflict(String),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("download link expired")]
    LinkExpired,
    #[error("upload session expired")]
    SessionExpired,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("cancelled")]
    Cancelled,
}

/// How the retry harness should treat an error.
pub trait RetryClass {
    fn retry_class(&self) -> ErrorClass;
}

impl RetryClass for XpanError {
    fn retry_class(&self) -> ErrorClass {
        self.classification()
    }
}

impl RetryClass for TransferError {
    fn retry_class(&self) -> ErrorClass {
        match self {
            TransferError::Api(api) => api.classification(),
            // A mismatched slice digest or an expired link is worth
            // re-issuing the same transfer.
            TransferError::Integrity { .. } | TransferError::LinkExpired => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

// The provider signals an existing target with errno -8 when rtype forbids
// overwriting.
const ERRNO_PATH_EXISTS: i64 = -8;

impl TransferError {
    pub(crate) fn from_api(err: XpanError, remote_path: &str) -> Self {
        match err {
            XpanError::Api { errno, .. } if errno == ERRNO_PATH_EXISTS => {
                TransferError::Conflict(remote_path.to_string())
            }
            other => TransferError::Api(other),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

impl From<pool::PoolError<TransferError>> for TransferError {
    fn from(err: pool::PoolError<TransferError>) -> Self {
        match err {
            pool::PoolError::Task { error, .. } => error,
            pool::PoolError::Cancelled => TransferError::Cancelled,
        }
    }
}
