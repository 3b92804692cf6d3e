//! Core types and traits for WOPI document storage backends.
//!
//! This crate holds what the local and remote backends share:
//! - `StorageBackend`: metadata, working copy, locking and upload operations
//! - `StorageBase`: document location, working paths and save intent
//! - `HostAuthorization`: which storage hosts may be used, and their aliases
//! - `LockContext`: per-session lock state and refresh policy
//! - `WopiFileInfo`: the parsed CheckFileInfo response
//! - `Anonymizer`: pseudonyms for identifiers written to the logs

mod anonymize;
mod auth;
mod error;
mod file_info;
mod host;
mod lock;
mod settings;
mod storage;
mod util;
mod wopi_info;

pub use anonymize::{anonymize, anonymize_url, filename_from_url, map_anonymized, Anonymizer};
pub use auth::{sanitize_uri, Authorization, ACCESS_TOKEN_PARAM};
pub use error::StorageError;
pub use file_info::{
    oneshot_callback, AsyncUpload, AsyncUploadCallback, AsyncUploadState, FileInfo, UploadResult,
    UploadResultKind,
};
pub use host::{authority_of, HostAuthorization, HostMatcher};
pub use lock::{LockContext, LockState, LOCK_TOKEN_PREFIX};
pub use settings::{
    AliasGroup, AliasGroupSettings, AliasMode, AnonymizationSettings, FilesystemSettings,
    HostEntry, NetSettings, SslSettings, StorageSettings, WopiSettings,
};
pub use storage::{
    ensure_disk_space, DocumentState, LocalFileInfo, MetadataDetails, SharedDocumentState,
    StorageBackend, StorageBase, StorageMetadata, UploadRequest, TO_UPLOAD_SUFFIX,
    UPLOADING_SUFFIX,
};
pub use util::{process_identifier, random_hex};
pub use wopi_info::{file_info_from_json, is_template, TriState, WopiFileInfo};
