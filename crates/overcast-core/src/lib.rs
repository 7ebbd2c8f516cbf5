//! Overcast Core - provider-agnostic storage model
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Container`, listener registries, `Operation`, `StorageError`
//! - **Use cases** - the operation lifecycle controller and the `TreeBuilder`
//! - **Port definitions** - the `StorageProvider` capability trait implemented per backend
//! - **Provider context** - the explicit per-backend handle shared by every container
//!
//! # Architecture
//!
//! Ports define trait interfaces that provider crates implement. Containers
//! reach their provider through the `ProviderContext` they were created
//! with; there is no global provider state.

pub mod config;
pub mod context;
pub mod domain;
pub mod logging;
pub mod ports;
pub mod usecases;

pub use config::Config;
pub use context::ProviderContext;
pub use domain::{Container, ContainerKind, ListenerHandle, Operation, OperationState, StorageError};
pub use usecases::TreeBuilder;
