use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use tokio::fs;
use tracing::{debug, error, info, instrument, trace};
use url::Url;
use wopi_storage_core::{
    Authorization, FileInfo, LocalFileInfo, LockContext, MetadataDetails, StorageBackend,
    StorageBase, StorageError, StorageMetadata, StorageSettings, UploadRequest, UploadResult,
};

/// Owner reported for every local document.
pub const LOCAL_OWNER: &str = "LocalOwner";

static LAST_LOCAL_STORAGE_ID: AtomicU64 = AtomicU64::new(0);

type Linker = for<'a> fn(&'a Path, &'a Path) -> BoxFuture<'a, io::Result<()>>;

/// Modification time as ISO-8601 UTC with microseconds.
fn iso8601_micros(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn hard_link<'a>(src: &'a Path, dst: &'a Path) -> BoxFuture<'a, io::Result<()>> {
    Box::pin(fs::hard_link(src, dst))
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_dir_if_empty(dir: &Path) {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return;
    };
    if let Ok(None) = entries.next_entry().await {
        if let Err(e) = fs::remove_dir(dir).await {
            debug!("Failed to remove empty directory {}: {}", dir.display(), e);
        }
    }
}

/// Backend for documents addressed by a `file:` URI or a plain path.
///
/// The working copy is a hard link to the document when possible, a full
/// copy otherwise. Temporary documents handed over by the caller are moved.
#[derive(Debug)]
pub struct LocalStorage {
    base: StorageBase,
    is_temporary_file: bool,
    /// The working copy is a copy, so saves must be copied back.
    is_copy: bool,
    linker: Linker,
}

impl LocalStorage {
    pub fn new(
        uri: &Url,
        local_store_path: impl Into<PathBuf>,
        jail_path: impl Into<PathBuf>,
        is_temporary_file: bool,
        settings: Arc<StorageSettings>,
    ) -> Self {
        Self {
            base: StorageBase::new(uri, local_store_path, jail_path, settings),
            is_temporary_file,
            is_copy: false,
            linker: hard_link,
        }
    }

    pub fn is_copy(&self) -> bool {
        self.is_copy
    }

    pub fn is_temporary_file(&self) -> bool {
        self.is_temporary_file
    }

    fn source_path(&self) -> Result<PathBuf, StorageError> {
        self.base
            .uri()
            .to_file_path()
            .map_err(|_| StorageError::BadRequest(format!("Invalid URI: {}", self.base.uri_anonym())))
    }

    fn anonym(&self, path: &Path) -> String {
        self.base.anonymizer().url(&path.to_string_lossy())
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn base(&self) -> &StorageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StorageBase {
        &mut self.base
    }

    #[instrument(skip(self, _auth, _lock_ctx), level = "debug")]
    async fn fetch_metadata(
        &mut self,
        _auth: &Authorization,
        _lock_ctx: &mut LockContext,
    ) -> Result<StorageMetadata, StorageError> {
        let path = self.source_path()?;
        debug!(
            "Getting info for local uri [{}], path [{}]",
            self.base.uri_anonym(),
            self.anonym(&path)
        );

        let metadata = fs::metadata(&path).await.map_err(|e| {
            StorageError::BadRequest(format!("Cannot stat {}: {}", self.anonym(&path), e))
        })?;
        let modified = metadata.modified().map(iso8601_micros).unwrap_or_default();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let file_info = FileInfo::new(filename, LOCAL_OWNER, modified);
        self.base.set_file_info(file_info.clone());

        let id = LAST_LOCAL_STORAGE_ID.fetch_add(1, Ordering::Relaxed);
        Ok(StorageMetadata {
            file_info,
            details: MetadataDetails::Local(LocalFileInfo {
                size: metadata.len(),
                user_id: format!("LocalUser{}", id),
                username: format!("LocalUser#{}", id),
            }),
        })
    }

    #[instrument(skip_all, level = "debug")]
    async fn materialize_local(
        &mut self,
        _auth: &Authorization,
        _lock_ctx: &LockContext,
        _template_uri: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        let source = self.source_path()?;
        let filename = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                StorageError::BadRequest(format!("Invalid URI: {}", self.base.uri_anonym()))
            })?;

        let local_root = self.base.local_root_path();
        let root_file_path = local_root.join(&filename);
        self.base.set_root_file_path(&root_file_path);
        info!(
            "Public URI [{}] jailed to [{}]",
            self.anonym(&source),
            self.anonym(&root_file_path)
        );

        if !exists(&source).await {
            error!("Local file URI [{}] invalid or doesn't exist", self.anonym(&source));
            return Err(StorageError::BadRequest(format!(
                "Invalid URI: {}",
                self.base.uri_anonym()
            )));
        }

        fs::create_dir_all(&local_root).await.map_err(|e| {
            StorageError::Io(format!("Failed to create {}: {}", self.anonym(&local_root), e))
        })?;
        self.base.ensure_disk_space(&root_file_path)?;

        if self.is_temporary_file {
            match fs::rename(&source, &root_file_path).await {
                Ok(()) => {
                    if let Some(parent) = source.parent() {
                        remove_dir_if_empty(parent).await;
                    }
                }
                Err(e) => error!(
                    "Failed to move [{}] to [{}]: {}",
                    self.anonym(&source),
                    self.anonym(&root_file_path),
                    e
                ),
            }
        }

        if !exists(&root_file_path).await {
            info!(
                "Linking {} to {}",
                self.anonym(&source),
                self.anonym(&root_file_path)
            );
            if let Err(e) = (self.linker)(&source, &root_file_path).await {
                info!("Linking failed, will copy: {}", e);
            }
        }

        if !exists(&root_file_path).await {
            fs::copy(&source, &root_file_path).await.map_err(|e| {
                error!(
                    "Copying [{}] to [{}] failed: {}",
                    self.anonym(&source),
                    self.anonym(&root_file_path),
                    e
                );
                StorageError::Io(format!("Failed to copy {}: {}", self.anonym(&source), e))
            })?;
            self.is_copy = true;
        }

        self.base.set_downloaded(true);
        Ok(self.base.jailed_file_path(&filename))
    }

    async fn update_lock(
        &mut self,
        _auth: &Authorization,
        _lock_ctx: &mut LockContext,
        _lock: bool,
    ) -> bool {
        true
    }

    #[instrument(skip_all, level = "debug")]
    async fn upload_sync(
        &mut self,
        _auth: &Authorization,
        _lock_ctx: &LockContext,
        _request: &UploadRequest,
    ) -> UploadResult {
        let path = match self.source_path() {
            Ok(path) => path,
            Err(e) => {
                error!("Cannot upload local file: {}", e);
                return UploadResult::failed("Internal error.");
            }
        };

        trace!(
            "Copying local file to local file storage (isCopy: {}) for {}",
            self.is_copy,
            self.anonym(self.base.root_file_path())
        );

        if self.is_copy {
            let uploading = self.base.root_file_path_uploading();
            let from = if exists(&uploading).await {
                uploading
            } else {
                self.base.root_file_path().to_path_buf()
            };
            if let Err(e) = fs::copy(&from, &path).await {
                error!(
                    "Copying [{}] to [{}] failed: {}",
                    self.anonym(&from),
                    self.anonym(&path),
                    e
                );
                return UploadResult::failed("Internal error.");
            }
        }

        match fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => {
                let modified = iso8601_micros(modified);
                trace!("New FileInfo modified time in storage {}", modified);
                self.base.document().set_last_modified_time(modified);
                UploadResult::ok()
            }
            Err(e) => {
                error!("Cannot stat [{}] after upload: {}", self.anonym(&path), e);
                UploadResult::failed("Internal error.")
            }
        }
    }
}
