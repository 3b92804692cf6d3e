//! Storage backend for documents on the local (or a mounted) filesystem.

pub mod local;

pub use local::LocalStorage;
