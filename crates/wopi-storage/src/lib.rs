//! Storage layer for documents opened through a WOPI host or the local
//! filesystem.
//!
//! [`StorageFactory`] picks the backend for a document location and checks
//! that remote hosts are trusted before any request is made. The backends
//! live in their own crates and are re-exported here.

pub mod factory;

pub use factory::{parse_location, StorageFactory};
pub use wopi_storage_core::*;
pub use wopi_storage_local::LocalStorage;
pub use wopi_storage_remote::{WopiClient, WopiStorage};
