//! Port definitions (hexagonal architecture interfaces)
//!
//! - [`StorageProvider`] - listing, metadata and structural operations of one backend

pub mod storage_provider;

pub use storage_provider::{
    ChildEntry, ChildListing, EntryKind, Locality, Quota, SourceHandle, StorageProvider,
};
