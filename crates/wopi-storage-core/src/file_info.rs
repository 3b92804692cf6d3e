use std::fmt;

use tokio::sync::oneshot;

/// Basic metadata of a stored document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub owner_id: String,
    /// Opaque modification token, compared verbatim by the storage host.
    pub last_modified_time: String,
}

impl FileInfo {
    pub fn new(
        filename: impl Into<String>,
        owner_id: impl Into<String>,
        last_modified_time: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            owner_id: owner_id.into(),
            last_modified_time: last_modified_time.into(),
        }
    }

    /// A file is valid once it has a name; zero-byte files are fine.
    pub fn is_valid(&self) -> bool {
        !self.filename.is_empty()
    }
}

/// Outcome category of an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadResultKind {
    #[default]
    Ok,
    DiskFull,
    Unauthorized,
    /// The document was modified on the host since it was loaded.
    DocChanged,
    Conflict,
    Failed,
}

impl fmt::Display for UploadResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadResultKind::Ok => "OK",
            UploadResultKind::DiskFull => "DISKFULL",
            UploadResultKind::Unauthorized => "UNAUTHORIZED",
            UploadResultKind::DocChanged => "DOC_CHANGED",
            UploadResultKind::Conflict => "CONFLICT",
            UploadResultKind::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Typed result of an upload. Uploads never fail with an `Err`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResult {
    pub kind: UploadResultKind,
    pub reason: String,
    /// Name assigned by the host after save-as or rename.
    pub save_as_name: String,
    pub save_as_url: String,
}

impl UploadResult {
    pub fn new(kind: UploadResultKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_reason(kind: UploadResultKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            ..Self::default()
        }
    }

    pub fn ok() -> Self {
        Self::new(UploadResultKind::Ok)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::with_reason(UploadResultKind::Failed, reason)
    }

    pub fn is_ok(&self) -> bool {
        self.kind == UploadResultKind::Ok
    }

    pub fn set_save_as(&mut self, name: impl Into<String>, url: impl Into<String>) {
        self.save_as_name = name.into();
        self.save_as_url = url.into();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AsyncUploadState {
    /// No upload in flight and no result pending.
    #[default]
    None,
    Running,
    /// The upload could not be performed or was cancelled.
    Error,
    /// The upload finished; the result says how.
    Complete,
}

/// State and, once terminal, result of an asynchronous upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsyncUpload {
    pub state: AsyncUploadState,
    pub result: UploadResult,
}

impl AsyncUpload {
    pub fn new(state: AsyncUploadState, result: UploadResult) -> Self {
        Self { state, result }
    }

    pub fn running() -> Self {
        Self::new(AsyncUploadState::Running, UploadResult::ok())
    }

    pub fn complete(result: UploadResult) -> Self {
        Self::new(AsyncUploadState::Complete, result)
    }

    pub fn error(result: UploadResult) -> Self {
        Self::new(AsyncUploadState::Error, result)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            AsyncUploadState::Error | AsyncUploadState::Complete
        )
    }
}

/// Invoked exactly once with the terminal state of an asynchronous upload.
pub type AsyncUploadCallback = Box<dyn FnOnce(AsyncUpload) + Send + 'static>;

/// A callback that forwards its result to the returned receiver.
pub fn oneshot_callback() -> (AsyncUploadCallback, oneshot::Receiver<AsyncUpload>) {
    let (tx, rx) = oneshot::channel();
    let callback: AsyncUploadCallback = Box::new(move |upload| {
        let _ = tx.send(upload);
    });
    (callback, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_info_validity() {
        assert!(!FileInfo::default().is_valid());
        assert!(FileInfo::new("empty.odt", "", "").is_valid());
    }

    #[test]
    fn test_upload_kind_display() {
        assert_eq!(UploadResultKind::DocChanged.to_string(), "DOC_CHANGED");
        assert_eq!(UploadResultKind::DiskFull.to_string(), "DISKFULL");
    }

    #[test]
    fn test_oneshot_callback_delivers() {
        let (callback, mut rx) = oneshot_callback();
        callback(AsyncUpload::error(UploadResult::failed("boom")));

        let upload = rx.try_recv().unwrap();
        assert_eq!(upload.state, AsyncUploadState::Error);
        assert_eq!(upload.result.kind, UploadResultKind::Failed);
        assert_eq!(upload.result.reason, "boom");
        assert!(upload.is_terminal());
        assert!(!AsyncUpload::running().is_terminal());
    }
}
