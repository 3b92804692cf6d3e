use thiserror::Error;

/// Errors raised by storage backends.
///
/// Upload failures are not represented here: they are reported through
/// [`crate::UploadResult`] so the asynchronous path can deliver them too.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Malformed or unsupported document location.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Host or credential rejection.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Transport or protocol failure talking to the storage host.
    #[error("Storage connection error: {0}")]
    Connection(String),

    /// Not enough local disk space to write the working copy.
    #[error("Low disk space: {0}")]
    SpaceLow(String),

    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid storage settings.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the caller may retry without re-fetching metadata.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }
}
