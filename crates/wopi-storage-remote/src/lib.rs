//! Storage backend for documents served by a WOPI host.
//!
//! `WopiStorage` fetches metadata with CheckFileInfo, downloads the document
//! body, takes and refreshes the document lock, and uploads saves either in
//! place or as a background task with at most one upload in flight.

pub mod client;
pub mod storage;
pub mod upload;

pub use client::{WopiClient, REDIRECTION_LIMIT};
pub use storage::WopiStorage;
pub use upload::{encode_utf7, interpret_upload_response, AsyncUploadController, UploadOutcome};
