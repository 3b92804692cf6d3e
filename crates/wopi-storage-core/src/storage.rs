use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use crate::anonymize::Anonymizer;
use crate::auth::{sanitize_uri, Authorization};
use crate::error::StorageError;
use crate::file_info::{AsyncUpload, AsyncUploadCallback, FileInfo, UploadResult};
use crate::lock::LockContext;
use crate::settings::StorageSettings;
use crate::wopi_info::WopiFileInfo;

/// Suffix of the file the session writes before an upload.
pub const TO_UPLOAD_SUFFIX: &str = ".upload";
/// Appended to [`TO_UPLOAD_SUFFIX`] for the file currently being uploaded.
pub const UPLOADING_SUFFIX: &str = "ing";

/// Metadata returned by [`StorageBackend::fetch_metadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMetadata {
    pub file_info: FileInfo,
    pub details: MetadataDetails,
}

/// Backend-specific part of [`StorageMetadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataDetails {
    Local(LocalFileInfo),
    Wopi(Box<WopiFileInfo>),
}

/// Synthesized user identity for documents opened from the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileInfo {
    pub size: u64,
    pub user_id: String,
    pub username: String,
}

impl StorageMetadata {
    pub fn wopi(&self) -> Option<&WopiFileInfo> {
        match &self.details {
            MetadataDetails::Wopi(info) => Some(info),
            MetadataDetails::Local(_) => None,
        }
    }

    pub fn local(&self) -> Option<&LocalFileInfo> {
        match &self.details {
            MetadataDetails::Local(info) => Some(info),
            MetadataDetails::Wopi(_) => None,
        }
    }

    pub fn user_id(&self) -> &str {
        match &self.details {
            MetadataDetails::Local(info) => &info.user_id,
            MetadataDetails::Wopi(info) => &info.user_id,
        }
    }

    pub fn username(&self) -> &str {
        match &self.details {
            MetadataDetails::Local(info) => &info.username,
            MetadataDetails::Wopi(info) => &info.username,
        }
    }
}

/// What an upload writes back to storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UploadRequest {
    /// Overwrite the document with its pending local copy.
    #[default]
    Save,
    /// Store the file at `path` as a new document, suggesting `filename`.
    SaveAs { path: PathBuf, filename: OsString },
    /// Rename the document to `filename`.
    Rename { filename: OsString },
}

impl UploadRequest {
    pub fn is_save_as(&self) -> bool {
        matches!(self, UploadRequest::SaveAs { .. })
    }

    pub fn is_rename(&self) -> bool {
        matches!(self, UploadRequest::Rename { .. })
    }

    /// The name requested for save-as or rename.
    pub fn target_filename(&self) -> Option<&OsStr> {
        match self {
            UploadRequest::Save => None,
            UploadRequest::SaveAs { filename, .. } | UploadRequest::Rename { filename } => {
                Some(filename)
            }
        }
    }
}

/// Document state shared with in-flight asynchronous uploads.
#[derive(Debug, Default)]
pub struct DocumentState {
    pub file_info: FileInfo,
    /// Overwrite the host copy even if it changed since it was loaded.
    pub force_save: bool,
}

/// Handle on [`DocumentState`] that can be moved into an upload task.
#[derive(Debug, Clone, Default)]
pub struct SharedDocumentState(Arc<Mutex<DocumentState>>);

impl SharedDocumentState {
    pub fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_last_modified_time(&self, time: impl Into<String>) {
        self.lock().file_info.last_modified_time = time.into();
    }

    pub fn clear_force_save(&self) {
        self.lock().force_save = false;
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// State common to every backend: document location, working paths, save
/// intent and the shared document state.
#[derive(Debug)]
pub struct StorageBase {
    /// Never carries an access token value.
    uri: Url,
    local_store_path: PathBuf,
    jail_path: PathBuf,
    root_file_path: PathBuf,
    is_downloaded: bool,
    user_modified: bool,
    autosave: bool,
    exit_save: bool,
    extended_data: String,
    document: SharedDocumentState,
    anonymizer: Anonymizer,
    settings: Arc<StorageSettings>,
}

impl StorageBase {
    pub fn new(
        uri: &Url,
        local_store_path: impl Into<PathBuf>,
        jail_path: impl Into<PathBuf>,
        settings: Arc<StorageSettings>,
    ) -> Self {
        let anonymizer = Anonymizer::from_settings(&settings.anonymization);
        let base = Self {
            uri: sanitize_uri(uri),
            local_store_path: local_store_path.into(),
            jail_path: jail_path.into(),
            root_file_path: PathBuf::new(),
            is_downloaded: false,
            user_modified: false,
            autosave: false,
            exit_save: false,
            extended_data: String::new(),
            document: SharedDocumentState::default(),
            anonymizer,
            settings,
        };
        debug!(
            "Storage for [{}] with local store [{}] and jail [{}]",
            base.uri_anonym(),
            base.local_store_path.display(),
            base.jail_path.display()
        );
        base
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Replace the document URI, e.g. after a redirect.
    pub fn set_uri(&mut self, uri: &Url) {
        self.uri = sanitize_uri(uri);
    }

    pub fn uri_anonym(&self) -> String {
        self.anonymizer.url(self.uri.as_str())
    }

    pub fn local_store_path(&self) -> &Path {
        &self.local_store_path
    }

    pub fn jail_path(&self) -> &Path {
        &self.jail_path
    }

    /// Absolute directory holding the working copy: the jail path under the
    /// local store.
    pub fn local_root_path(&self) -> PathBuf {
        let relative = self.jail_path.strip_prefix("/").unwrap_or(&self.jail_path);
        self.local_store_path.join(relative)
    }

    /// Absolute path of the working copy, once materialized.
    pub fn root_file_path(&self) -> &Path {
        &self.root_file_path
    }

    pub fn set_root_file_path(&mut self, path: impl Into<PathBuf>) {
        self.root_file_path = path.into();
    }

    pub fn root_file_path_to_upload(&self) -> PathBuf {
        with_suffix(&self.root_file_path, TO_UPLOAD_SUFFIX)
    }

    pub fn root_file_path_uploading(&self) -> PathBuf {
        with_suffix(
            &self.root_file_path,
            &format!("{}{}", TO_UPLOAD_SUFFIX, UPLOADING_SUFFIX),
        )
    }

    /// Path of the working copy as seen from inside the jail.
    pub fn jailed_file_path(&self, filename: &str) -> PathBuf {
        self.jail_path.join(filename)
    }

    pub fn is_downloaded(&self) -> bool {
        self.is_downloaded
    }

    pub fn set_downloaded(&mut self, downloaded: bool) {
        self.is_downloaded = downloaded;
    }

    /// Record the intent of the next save.
    pub fn set_save_flags(
        &mut self,
        user_modified: bool,
        autosave: bool,
        exit_save: bool,
        extended_data: impl Into<String>,
    ) {
        self.user_modified = user_modified;
        self.autosave = autosave;
        self.exit_save = exit_save;
        self.extended_data = extended_data.into();
    }

    pub fn is_user_modified(&self) -> bool {
        self.user_modified
    }

    pub fn is_autosave(&self) -> bool {
        self.autosave
    }

    pub fn is_exit_save(&self) -> bool {
        self.exit_save
    }

    pub fn extended_data(&self) -> &str {
        &self.extended_data
    }

    pub fn file_info(&self) -> FileInfo {
        self.document.lock().file_info.clone()
    }

    pub fn set_file_info(&self, file_info: FileInfo) {
        self.document.lock().file_info = file_info;
    }

    pub fn force_save(&self) -> bool {
        self.document.lock().force_save
    }

    pub fn set_force_save(&self, force: bool) {
        self.document.lock().force_save = force;
    }

    pub fn document(&self) -> SharedDocumentState {
        self.document.clone()
    }

    pub fn anonymizer(&self) -> &Anonymizer {
        &self.anonymizer
    }

    pub fn settings(&self) -> &Arc<StorageSettings> {
        &self.settings
    }

    /// Fail with [`StorageError::SpaceLow`] if the filesystem holding `path`
    /// has less free space than configured.
    pub fn ensure_disk_space(&self, path: &Path) -> Result<(), StorageError> {
        ensure_disk_space(path, self.settings.min_free_disk_bytes)
    }
}

/// Fail with [`StorageError::SpaceLow`] if fewer than `min_free` bytes are
/// available on the filesystem holding `path` (or its nearest existing
/// ancestor).
pub fn ensure_disk_space(path: &Path, min_free: u64) -> Result<(), StorageError> {
    if min_free == 0 {
        return Ok(());
    }

    let Some(existing) = path.ancestors().find(|p| p.exists()) else {
        return Ok(());
    };

    match fs2::available_space(existing) {
        Ok(available) if available < min_free => Err(StorageError::SpaceLow(format!(
            "{} bytes available at {}, {} required",
            available,
            existing.display(),
            min_free
        ))),
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("Cannot check free space at {}: {}", existing.display(), e);
            Ok(())
        }
    }
}

/// Uniform access to a document's durable location.
///
/// A backend belongs to one document session; methods take `&mut self` and
/// are not meant to be called concurrently.
#[async_trait]
pub trait StorageBackend: std::fmt::Debug + Send + Sync {
    fn base(&self) -> &StorageBase;

    fn base_mut(&mut self) -> &mut StorageBase;

    /// Fetch the document metadata and record its basic file info.
    async fn fetch_metadata(
        &mut self,
        auth: &Authorization,
        lock_ctx: &mut LockContext,
    ) -> Result<StorageMetadata, StorageError>;

    /// Place a working copy of the document in the jail.
    ///
    /// Returns the jailed path of the copy. When `template_uri` is given the
    /// content is taken from there instead of the document itself.
    async fn materialize_local(
        &mut self,
        auth: &Authorization,
        lock_ctx: &LockContext,
        template_uri: Option<&str>,
    ) -> Result<PathBuf, StorageError>;

    /// Acquire (`lock = true`) or release the document lock.
    ///
    /// Returns `true` if the host does not support locks. On failure the
    /// reason is recorded in `lock_ctx`.
    async fn update_lock(
        &mut self,
        auth: &Authorization,
        lock_ctx: &mut LockContext,
        lock: bool,
    ) -> bool;

    async fn upload_sync(
        &mut self,
        auth: &Authorization,
        lock_ctx: &LockContext,
        request: &UploadRequest,
    ) -> UploadResult;

    /// Start an upload; `callback` receives its terminal state exactly once.
    async fn upload_async(
        &mut self,
        auth: &Authorization,
        lock_ctx: &LockContext,
        request: &UploadRequest,
        callback: AsyncUploadCallback,
    ) {
        let result = self.upload_sync(auth, lock_ctx, request).await;
        callback(AsyncUpload::complete(result));
    }

    fn query_async_upload_state(&self) -> AsyncUpload {
        AsyncUpload::default()
    }

    fn cancel_async_upload(&mut self) {}
}
