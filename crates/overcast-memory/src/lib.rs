//! Overcast Memory - in-memory storage and transfer backend
//!
//! [`MemoryProvider`] implements both the core `StorageProvider` port and
//! the `TransferProvider` port over a node table held in memory. It is used
//! by the integration tests of the other crates and as a reference for new
//! backends.

mod provider;
mod store;

pub use provider::{CallCounts, MemoryProvider, MemoryProviderBuilder};
