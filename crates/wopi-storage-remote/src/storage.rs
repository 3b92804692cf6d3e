use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use wopi_storage_core::{
    file_info_from_json, AsyncUpload, AsyncUploadCallback, Authorization, LockContext,
    MetadataDetails, StorageBackend, StorageBase, StorageError, StorageMetadata, StorageSettings,
    UploadRequest, UploadResult, WopiFileInfo,
};

use crate::client::WopiClient;
use crate::upload::{build_upload_request, perform_upload, AsyncUploadController};

/// Backend for a document served by a WOPI host.
///
/// The URI addresses the file endpoint, `.../wopi/files/<id>`; the body is
/// read from and written to `<uri>/contents`.
#[derive(Debug)]
pub struct WopiStorage {
    base: StorageBase,
    client: WopiClient,
    /// Alternate download location reported by CheckFileInfo.
    file_url: Option<String>,
    uploads: AsyncUploadController,
}

fn reject_busy_upload(callback: AsyncUploadCallback) {
    warn!("Upload is already in progress");
    callback(AsyncUpload::error(UploadResult::failed(
        "Upload is already in progress.",
    )));
}

impl WopiStorage {
    pub fn new(
        uri: &Url,
        local_store_path: impl Into<PathBuf>,
        jail_path: impl Into<PathBuf>,
        settings: Arc<StorageSettings>,
        client: WopiClient,
    ) -> Self {
        Self {
            base: StorageBase::new(uri, local_store_path, jail_path, settings),
            client,
            file_url: None,
            uploads: AsyncUploadController::new(),
        }
    }

    pub fn file_url(&self) -> Option<&str> {
        self.file_url.as_deref()
    }

    /// How long the last upload took on the wire.
    pub fn save_duration(&self) -> Option<Duration> {
        self.uploads.save_duration()
    }

    fn anonym_path(&self, path: &Path) -> String {
        self.base.anonymizer().url(&path.to_string_lossy())
    }

    /// Stream the body at `uri` into `dest`, following redirects.
    async fn download(
        &self,
        auth: &Authorization,
        uri: &Url,
        dest: &Path,
    ) -> Result<(), StorageError> {
        self.base.ensure_disk_space(dest)?;

        let start = Instant::now();
        let (response, final_uri) = self
            .client
            .get_following_redirects(uri, auth, false, "WOPI::GetFile")
            .await?;
        let uri_anonym = self.client.loggable(&final_uri);

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(
                "WOPI::GetFile [{}] failed with Status Code: {}",
                uri_anonym, status
            );
            return Err(StorageError::Connection(format!(
                "WOPI::GetFile [{}] failed: {}",
                uri_anonym, body
            )));
        }

        let io_error = |e: std::io::Error| {
            StorageError::Io(format!(
                "Failed to write {}: {}",
                self.anonym_path(dest),
                e
            ))
        };
        let mut file = fs::File::create(dest).await.map_err(io_error)?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                StorageError::Connection(format!("WOPI::GetFile [{}] failed: {}", uri_anonym, e))
            })?;
            file.write_all(&chunk).await.map_err(io_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error)?;

        info!(
            "WOPI::GetFile downloaded {} bytes from [{}] -> [{}] in {:?}",
            written,
            uri_anonym,
            self.anonym_path(dest),
            start.elapsed()
        );
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for WopiStorage {
    fn base(&self) -> &StorageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StorageBase {
        &mut self.base
    }

    #[instrument(skip(self, auth, lock_ctx), level = "debug")]
    async fn fetch_metadata(
        &mut self,
        auth: &Authorization,
        lock_ctx: &mut LockContext,
    ) -> Result<StorageMetadata, StorageError> {
        let start = Instant::now();
        debug!("Getting info for wopi uri [{}]", self.base.uri_anonym());

        let (response, final_uri) = self
            .client
            .get_following_redirects(self.base.uri(), auth, true, "WOPI::CheckFileInfo")
            .await?;
        self.base.set_uri(&final_uri);
        let uri_anonym = self.base.uri_anonym();

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            StorageError::Connection(format!(
                "WOPI::CheckFileInfo [{}] failed: {}",
                uri_anonym, e
            ))
        })?;
        let elapsed = start.elapsed();

        if status != StatusCode::OK {
            error!(
                "WOPI::CheckFileInfo failed for URI [{}]: {}. Body: [{}]",
                uri_anonym, status, body
            );
            if status == StatusCode::FORBIDDEN {
                return Err(StorageError::Unauthorized(format!(
                    "Access denied, 403. WOPI::CheckFileInfo failed on: {}",
                    uri_anonym
                )));
            }
            return Err(StorageError::Connection(format!(
                "WOPI::CheckFileInfo failed: {}",
                body
            )));
        }

        let object = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(object)) => object,
            _ => {
                let logged = if self.base.anonymizer().is_enabled() {
                    "obfuscated"
                } else {
                    body.as_str()
                };
                error!(
                    "WOPI::CheckFileInfo ({:?}) failed or no valid JSON payload returned. \
                     Access denied. Original response: [{}]",
                    elapsed, logged
                );
                return Err(StorageError::Unauthorized(format!(
                    "Access denied. WOPI::CheckFileInfo failed on: {}",
                    uri_anonym
                )));
            }
        };

        let file_info = file_info_from_json(&object);
        self.base.set_file_info(file_info.clone());
        let anonymizer = *self.base.anonymizer();
        WopiFileInfo::map_filename(&anonymizer, &file_info.filename, self.base.uri().path());

        let wopi = WopiFileInfo::from_json(
            &object,
            &file_info,
            &anonymizer,
            self.base.settings().watermark_text.as_deref(),
        );
        debug!("WOPI::CheckFileInfo took {:?}", elapsed);

        if wopi.supports_locks {
            lock_ctx.init_supports_locks();
        }
        self.file_url = Some(wopi.file_url.clone()).filter(|url| !url.is_empty());

        Ok(StorageMetadata {
            file_info,
            details: MetadataDetails::Wopi(Box::new(wopi)),
        })
    }

    #[instrument(skip_all, level = "debug")]
    async fn materialize_local(
        &mut self,
        auth: &Authorization,
        _lock_ctx: &LockContext,
        template_uri: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        let filename = self.base.file_info().filename;
        if filename.is_empty() {
            return Err(StorageError::BadRequest(format!(
                "No file name known for {}; fetch the metadata first",
                self.base.uri_anonym()
            )));
        }

        let local_root = self.base.local_root_path();
        fs::create_dir_all(&local_root).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create {}: {}",
                self.anonym_path(&local_root),
                e
            ))
        })?;
        let root_file_path = local_root.join(&filename);
        self.base.set_root_file_path(&root_file_path);

        if let Some(template) = template_uri.filter(|t| !t.is_empty()) {
            let template_anonym = self.base.anonymizer().url(template);
            info!("WOPI::GetFile template source: {}", template_anonym);
            let uri = Url::parse(template).map_err(|e| {
                StorageError::BadRequest(format!("Invalid template URI {}: {}", template_anonym, e))
            })?;
            if let Err(e) = self.download(auth, &uri, &root_file_path).await {
                error!(
                    "Could not download template from [{}]. Error: {}",
                    template_anonym, e
                );
                return Err(e);
            }
        } else {
            let mut downloaded = false;
            if let Some(file_url) = self.file_url.clone() {
                let file_url_anonym = self.base.anonymizer().url(&file_url);
                info!("WOPI::GetFile using FileUrl: {}", file_url_anonym);
                let attempt = match Url::parse(&file_url) {
                    Ok(uri) => self.download(auth, &uri, &root_file_path).await,
                    Err(e) => Err(StorageError::BadRequest(e.to_string())),
                };
                match attempt {
                    Ok(()) => downloaded = true,
                    Err(e @ StorageError::SpaceLow(_)) => return Err(e),
                    Err(e) => error!(
                        "Could not download document from WOPI FileUrl [{}]. \
                         Will use default URL. Error: {}",
                        file_url_anonym, e
                    ),
                }
            }

            if !downloaded {
                let mut uri = self.base.uri().clone();
                let path = format!("{}/contents", uri.path());
                uri.set_path(&path);
                auth.authorize_uri(&mut uri);
                info!(
                    "WOPI::GetFile using default URI: {}",
                    self.client.loggable(&uri)
                );
                self.download(auth, &uri, &root_file_path).await?;
            }
        }

        self.base.set_downloaded(true);
        Ok(self.base.jailed_file_path(&filename))
    }

    #[instrument(skip(self, auth, lock_ctx), level = "debug")]
    async fn update_lock(
        &mut self,
        auth: &Authorization,
        lock_ctx: &mut LockContext,
        lock: bool,
    ) -> bool {
        lock_ctx.clear_failure_reason();
        if !lock_ctx.supports_locks() {
            return true;
        }

        let mut uri = self.base.uri().clone();
        auth.authorize_uri(&mut uri);
        let uri_anonym = self.client.loggable(&uri);
        let label = if lock { "WOPI::Lock" } else { "WOPI::Unlock" };
        debug!("{} requesting: {}", label, uri_anonym);

        let mut request = self
            .client
            .request(Method::POST, &uri, auth)
            .header("X-WOPI-Override", if lock { "LOCK" } else { "UNLOCK" })
            .header("X-WOPI-Lock", lock_ctx.lock_token());
        let extended_data = self.base.extended_data();
        if !extended_data.is_empty() {
            request = request
                .header("X-COOL-WOPI-ExtendedData", extended_data)
                .header("X-LOOL-WOPI-ExtendedData", extended_data);
        }
        let request = request.header(CONTENT_LENGTH, 0).body(Vec::<u8>::new());

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Cannot {} uri [{}]. Error: {}", label, uri_anonym, e);
                lock_ctx.record_failure("");
                return false;
            }
        };

        let status = response.status();
        let failure_reason = response
            .headers()
            .get("X-WOPI-LockFailureReason")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        info!("{} response: {} status {}", label, body, status);

        if status == StatusCode::OK {
            lock_ctx.record_lock(lock, Instant::now());
            return true;
        }

        match failure_reason.filter(|reason| !reason.is_empty()) {
            Some(reason) => {
                error!(
                    "Un-successful {} with status {}, failure reason: \"{}\" and response: {}",
                    label, status, reason, body
                );
                lock_ctx.record_failure(reason);
            }
            None => {
                error!(
                    "Un-successful {} with status {} and response: {}",
                    label, status, body
                );
                lock_ctx.record_failure("");
            }
        }
        false
    }

    #[instrument(skip_all, level = "debug")]
    async fn upload_sync(
        &mut self,
        auth: &Authorization,
        lock_ctx: &LockContext,
        request: &UploadRequest,
    ) -> UploadResult {
        let (builder, details) =
            match build_upload_request(&self.client, &self.base, auth, lock_ctx, request).await {
                Ok(prepared) => prepared,
                Err(result) => return result,
            };

        match perform_upload(builder, &details, self.base.anonymizer()).await {
            Ok((outcome, duration)) => {
                outcome.apply(&self.base.document());
                self.uploads.record_save_duration(duration);
                outcome.result
            }
            Err(result) => result,
        }
    }

    #[instrument(skip_all, level = "debug")]
    async fn upload_async(
        &mut self,
        auth: &Authorization,
        lock_ctx: &LockContext,
        request: &UploadRequest,
        callback: AsyncUploadCallback,
    ) {
        if self.uploads.is_running() {
            reject_busy_upload(callback);
            return;
        }

        let prepared = build_upload_request(&self.client, &self.base, auth, lock_ctx, request).await;
        let generation = match self.uploads.start(callback) {
            Ok(generation) => generation,
            Err(callback) => {
                reject_busy_upload(callback);
                return;
            }
        };

        let document = self.base.document();
        let (builder, details) = match prepared {
            Ok(prepared) => prepared,
            Err(result) => {
                self.uploads
                    .complete(generation, AsyncUpload::error(result), None, &document, None);
                return;
            }
        };

        let controller = self.uploads.clone();
        let anonymizer = *self.base.anonymizer();
        let task = tokio::spawn(async move {
            match perform_upload(builder, &details, &anonymizer).await {
                Ok((outcome, duration)) => controller.complete(
                    generation,
                    AsyncUpload::complete(outcome.result.clone()),
                    Some(&outcome),
                    &document,
                    Some(duration),
                ),
                Err(result) => controller.complete(
                    generation,
                    AsyncUpload::error(result),
                    None,
                    &document,
                    None,
                ),
            }
        });
        self.uploads.attach(generation, task);
    }

    fn query_async_upload_state(&self) -> AsyncUpload {
        self.uploads.state()
    }

    fn cancel_async_upload(&mut self) {
        self.uploads.cancel();
    }
}
