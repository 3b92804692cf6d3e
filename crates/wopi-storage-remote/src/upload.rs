//! PutFile / PutRelativeFile / RenameFile requests and their results.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use reqwest::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Method, RequestBuilder};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{error, info, trace, warn};
use url::Url;
use wopi_storage_core::{
    filename_from_url, Anonymizer, AsyncUpload, AsyncUploadCallback, AsyncUploadState,
    Authorization, LockContext, SharedDocumentState, StorageBase, UploadRequest, UploadResult, UploadResultKind,
};

use crate::client::WopiClient;

/// Status code a host puts in a 409 body when the document changed under us.
pub const DOC_CHANGED_STATUS_CODE: u64 = 1010;

fn is_direct(ch: char) -> bool {
    matches!(ch, '\t' | '\n' | '\r') || (' '..='}').contains(&ch) && ch != '+' && ch != '\\'
}

fn flush_shifted(out: &mut String, pending: &mut Vec<u16>) {
    if pending.is_empty() {
        return;
    }
    let bytes: Vec<u8> = pending.iter().flat_map(|unit| unit.to_be_bytes()).collect();
    out.push('+');
    out.push_str(&STANDARD_NO_PAD.encode(bytes));
    out.push('-');
    pending.clear();
}

/// Encode `input` as UTF-7 (RFC 2152), as WOPI expects for file names.
pub fn encode_utf7(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending: Vec<u16> = Vec::new();
    for ch in input.chars() {
        if ch == '+' {
            flush_shifted(&mut out, &mut pending);
            out.push_str("+-");
        } else if is_direct(ch) {
            flush_shifted(&mut out, &mut pending);
            out.push(ch);
        } else {
            let mut buf = [0u16; 2];
            pending.extend_from_slice(ch.encode_utf16(&mut buf));
        }
    }
    flush_shifted(&mut out, &mut pending);
    out
}

/// The name suggested to the host for save-as or rename.
///
/// Names that are not valid Unicode fall back to the extension alone, and
/// the host picks the name.
pub fn suggested_target(filename: &OsStr) -> String {
    match filename.to_str() {
        Some(name) => encode_utf7(name),
        None => {
            let extension = Path::new(filename)
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_default();
            let fallback = format!(".{}", extension);
            error!("Failed to convert file name to UTF-7, using '{}'", fallback);
            fallback
        }
    }
}

/// Everything about one upload that is needed to log and interpret it.
#[derive(Debug, Clone)]
pub struct UploadDetails {
    pub file_path_anonym: String,
    pub uri_anonym: String,
    pub size: u64,
    pub is_save_as: bool,
    pub is_rename: bool,
}

impl UploadDetails {
    pub fn label(&self) -> &'static str {
        if self.is_save_as {
            "WOPI::PutRelativeFile"
        } else if self.is_rename {
            "WOPI::RenameFile"
        } else {
            "WOPI::PutFile"
        }
    }
}

/// Build the upload request for `request`, streaming the body from disk.
///
/// Fails with the upload result to report when the file to upload is missing.
pub async fn build_upload_request(
    client: &WopiClient,
    base: &StorageBase,
    auth: &Authorization,
    lock_ctx: &LockContext,
    request: &UploadRequest,
) -> Result<(RequestBuilder, UploadDetails), UploadResult> {
    let anonymizer = base.anonymizer();
    let file_path: PathBuf = match request {
        UploadRequest::SaveAs { path, .. } => path.clone(),
        UploadRequest::Save | UploadRequest::Rename { .. } => base.root_file_path_uploading(),
    };
    let file_path_anonym = anonymizer.url(&file_path.to_string_lossy());

    let file = match tokio::fs::File::open(&file_path).await {
        Ok(file) => file,
        Err(e) => {
            error!(
                "Cannot access file [{}] to upload to wopi storage: {}",
                file_path_anonym, e
            );
            return Err(UploadResult::failed("File not found."));
        }
    };
    let size = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            error!("Cannot stat file [{}] to upload: {}", file_path_anonym, e);
            return Err(UploadResult::failed("File not found."));
        }
    };

    let mut uri: Url = base.uri().clone();
    if matches!(request, UploadRequest::Save) {
        let path = format!("{}/contents", uri.path());
        uri.set_path(&path);
    }
    auth.authorize_uri(&mut uri);

    let details = UploadDetails {
        file_path_anonym,
        uri_anonym: client.loggable(&uri),
        size,
        is_save_as: request.is_save_as(),
        is_rename: request.is_rename(),
    };
    info!(
        "Uploading {} bytes from [{}] to URI via WOPI [{}]",
        size, details.file_path_anonym, details.uri_anonym
    );

    let mut builder = client.request(Method::POST, &uri, auth);
    if !details.is_save_as && lock_ctx.supports_locks() {
        builder = builder.header("X-WOPI-Lock", lock_ctx.lock_token());
    }

    match request {
        UploadRequest::Save => {
            let flag = |value: bool| if value { "true" } else { "false" };
            builder = builder
                .header("X-WOPI-Override", "PUT")
                .header("X-COOL-WOPI-IsModifiedByUser", flag(base.is_user_modified()))
                .header("X-LOOL-WOPI-IsModifiedByUser", flag(base.is_user_modified()))
                .header("X-COOL-WOPI-IsAutosave", flag(base.is_autosave()))
                .header("X-LOOL-WOPI-IsAutosave", flag(base.is_autosave()))
                .header("X-COOL-WOPI-IsExitSave", flag(base.is_exit_save()))
                .header("X-LOOL-WOPI-IsExitSave", flag(base.is_exit_save()));
            if base.is_exit_save() {
                builder = builder.header(CONNECTION, "close");
            }
            if !base.extended_data().is_empty() {
                builder = builder
                    .header("X-COOL-WOPI-ExtendedData", base.extended_data())
                    .header("X-LOOL-WOPI-ExtendedData", base.extended_data());
            }
            if !base.force_save() {
                let timestamp = base.file_info().last_modified_time;
                builder = builder
                    .header("X-COOL-WOPI-Timestamp", timestamp.as_str())
                    .header("X-LOOL-WOPI-Timestamp", timestamp.as_str());
            }
        }
        UploadRequest::SaveAs { filename, .. } => {
            let target = suggested_target(filename);
            trace!(
                "Save as: suggested target is '{}'",
                anonymizer.url(&target)
            );
            builder = builder
                .header("X-WOPI-Override", "PUT_RELATIVE")
                .header("X-WOPI-Size", size.to_string())
                .header("X-WOPI-SuggestedTarget", target);
        }
        UploadRequest::Rename { filename } => {
            builder = builder
                .header("X-WOPI-Override", "RENAME_FILE")
                .header("X-WOPI-RequestedName", suggested_target(filename));
        }
    }

    let body = Body::wrap_stream(ReaderStream::new(file));
    builder = builder
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, size)
        .body(body);

    Ok((builder, details))
}

/// How a host response changes the upload result and the document state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub result: UploadResult,
    /// Set when a successful response carried a JSON body.
    pub last_modified_time: Option<String>,
}

impl UploadOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            result: UploadResult::failed(reason),
            last_modified_time: None,
        }
    }

    /// Record the new modification time and drop any pending forced save.
    pub fn apply(&self, document: &SharedDocumentState) {
        if let Some(time) = &self.last_modified_time {
            document.set_last_modified_time(time.clone());
            document.clear_force_save();
        }
    }
}

fn json_object(body: &str) -> Option<serde_json::Map<String, Value>> {
    match serde_json::from_str(body) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

fn json_str(object: &serde_json::Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn json_u64(object: &serde_json::Map<String, Value>, key: &str) -> u64 {
    match object.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Map an upload response onto an [`UploadOutcome`].
///
/// | status  | result                                            |
/// |---------|---------------------------------------------------|
/// | 200     | OK                                                |
/// | 413     | DISKFULL                                          |
/// | 401/403 | UNAUTHORIZED                                      |
/// | 409     | CONFLICT, or DOC_CHANGED with status code 1010    |
/// | other   | FAILED                                            |
pub fn interpret_upload_response(
    status: u16,
    body: &str,
    is_save_as: bool,
    is_rename: bool,
) -> UploadOutcome {
    let mut outcome = UploadOutcome {
        result: UploadResult::with_reason(UploadResultKind::Failed, body),
        last_modified_time: None,
    };

    match status {
        200 => {
            outcome.result = UploadResult::ok();
            match json_object(body) {
                Some(object) => {
                    outcome.last_modified_time = Some(json_str(&object, "LastModifiedTime"));
                    if is_save_as || is_rename {
                        outcome
                            .result
                            .set_save_as(json_str(&object, "Name"), json_str(&object, "Url"));
                    }
                }
                None => error!("Invalid or missing JSON in upload HTTP_OK response"),
            }
        }
        413 => outcome.result.kind = UploadResultKind::DiskFull,
        401 | 403 => outcome.result.kind = UploadResultKind::Unauthorized,
        409 => {
            outcome.result.kind = UploadResultKind::Conflict;
            match json_object(body) {
                Some(object) => {
                    if json_u64(&object, "COOLStatusCode") == DOC_CHANGED_STATUS_CODE
                        || json_u64(&object, "LOOLStatusCode") == DOC_CHANGED_STATUS_CODE
                    {
                        outcome.result.kind = UploadResultKind::DocChanged;
                    }
                }
                None => error!("Invalid or missing JSON in upload HTTP_CONFLICT response"),
            }
        }
        _ => {}
    }

    outcome
}

/// The response body with the new document name anonymized.
///
/// The name is mapped onto the file id taken from the returned URL, so the
/// same pseudonym is used for the file everywhere in the logs.
fn loggable_response(anonymizer: &Anonymizer, body: &str) -> String {
    if !anonymizer.is_enabled() {
        return body.to_string();
    }
    let Some(mut object) = json_object(body) else {
        return body.to_string();
    };

    let url = json_str(&object, "Url");
    let name = json_str(&object, "Name");
    if !url.is_empty() && !name.is_empty() {
        let path = Url::parse(&url)
            .map(|u| u.path().to_string())
            .unwrap_or(url);
        let file_id = filename_from_url(&path).to_string();
        anonymizer.map(&file_id, &file_id);
        anonymizer.map(filename_from_url(&name), &file_id);
        object.insert("Name".to_string(), Value::String(anonymizer.url(&name)));
    }
    Value::Object(object).to_string()
}

/// Send a prepared upload and interpret the response.
///
/// A transport failure yields `Err` with a FAILED result.
pub async fn perform_upload(
    request: RequestBuilder,
    details: &UploadDetails,
    anonymizer: &Anonymizer,
) -> Result<(UploadOutcome, Duration), UploadResult> {
    let start = std::time::Instant::now();
    let label = details.label();

    let response = request.send().await.map_err(|e| {
        error!(
            "Cannot upload file to WOPI storage uri [{}]: {}",
            details.uri_anonym, e
        );
        UploadResult::failed(format!("Upload failed: {}", e))
    })?;

    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            warn!("{} failed to read the response body: {}", label, e);
            String::new()
        }
    };
    let duration = start.elapsed();

    info!(
        "{} uploaded {} bytes in {:?} from [{}] -> [{}]: {}: {}",
        label,
        details.size,
        duration,
        details.file_path_anonym,
        details.uri_anonym,
        status,
        loggable_response(anonymizer, &body)
    );

    let outcome =
        interpret_upload_response(status.as_u16(), &body, details.is_save_as, details.is_rename);
    if !outcome.result.is_ok() {
        error!("{} failed with status {}: {}", label, status, outcome.result.kind);
    }
    Ok((outcome, duration))
}

#[derive(Default)]
struct ControllerState {
    /// Bumped by every start and every cancel; stale completions are dropped.
    generation: u64,
    current: AsyncUpload,
    callback: Option<AsyncUploadCallback>,
    task: Option<JoinHandle<()>>,
    save_duration: Option<Duration>,
}

/// Tracks the single asynchronous upload a backend may have in flight.
///
/// The callback of an upload is owned here until it fires, so it fires
/// exactly once: on completion, or on cancellation, whichever comes first.
#[derive(Clone, Default)]
pub struct AsyncUploadController {
    inner: Arc<Mutex<ControllerState>>,
}

impl std::fmt::Debug for AsyncUploadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AsyncUploadController")
            .field("generation", &state.generation)
            .field("current", &state.current)
            .finish()
    }
}

impl AsyncUploadController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> AsyncUpload {
        self.lock().current.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().current.state == AsyncUploadState::Running
    }

    /// Duration of the last completed upload.
    pub fn save_duration(&self) -> Option<Duration> {
        self.lock().save_duration
    }

    pub fn record_save_duration(&self, duration: Duration) {
        self.lock().save_duration = Some(duration);
    }

    /// Mark an upload as running and take ownership of its callback.
    ///
    /// Hands the callback back if another upload is already running.
    pub fn start(&self, callback: AsyncUploadCallback) -> Result<u64, AsyncUploadCallback> {
        let mut state = self.lock();
        if state.current.state == AsyncUploadState::Running {
            return Err(callback);
        }
        state.generation += 1;
        state.current = AsyncUpload::running();
        state.callback = Some(callback);
        state.task = None;
        Ok(state.generation)
    }

    /// Remember the task running upload `generation`, so it can be aborted.
    pub fn attach(&self, generation: u64, task: JoinHandle<()>) {
        let mut state = self.lock();
        if state.generation == generation && state.callback.is_some() {
            state.task = Some(task);
        } else if state.generation != generation {
            task.abort();
        }
    }

    /// Finish upload `generation` and fire its callback.
    ///
    /// Ignored if the upload was cancelled meanwhile.
    pub fn complete(
        &self,
        generation: u64,
        upload: AsyncUpload,
        outcome: Option<&UploadOutcome>,
        document: &SharedDocumentState,
        duration: Option<Duration>,
    ) {
        let callback = {
            let mut state = self.lock();
            if state.generation != generation {
                trace!("Dropping completion of cancelled upload {}", generation);
                return;
            }
            if let Some(outcome) = outcome {
                outcome.apply(document);
            }
            state.current = upload.clone();
            state.task = None;
            if duration.is_some() {
                state.save_duration = duration;
            }
            state.callback.take()
        };

        if let Some(callback) = callback {
            callback(upload);
        }
    }

    /// Abandon the running upload, if any. Its callback gets an error.
    pub fn cancel(&self) {
        let (callback, task) = {
            let mut state = self.lock();
            if state.current.state != AsyncUploadState::Running {
                return;
            }
            state.generation += 1;
            state.current = AsyncUpload::default();
            (state.callback.take(), state.task.take())
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(callback) = callback {
            callback(AsyncUpload::error(UploadResult::failed("Upload cancelled.")));
        }
    }
}
