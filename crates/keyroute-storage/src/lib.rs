//! KeyRoute Storage
//!
//! Backends for persisted quota state:
//! - Atomic JSON file store
//! - In-memory store for tests and ephemeral deployments

pub mod atomic_writer;
pub mod error;
pub mod file;
pub mod memory;

pub use error::{StorageError, StorageResult};
pub use file::FileQuotaStore;
pub use memory::MemoryQuotaStore;
