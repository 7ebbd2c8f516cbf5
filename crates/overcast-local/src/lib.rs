//! Overcast Local - local disk storage provider
//!
//! [`LocalStorage`] exposes a directory on disk through the core
//! `StorageProvider` port. Containers built on it carry absolute paths as
//! ids and root-relative logical paths.

mod storage;

pub use storage::LocalStorage;
