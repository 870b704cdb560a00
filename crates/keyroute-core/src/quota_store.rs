//! Quota snapshot persistence trait
//!
//! The `QuotaStore` trait abstracts where the routing engine's quota state is
//! kept between restarts. The engine itself never performs I/O; a background
//! task flushes snapshots through this trait.
//!
//! Implementations:
//! - `FileQuotaStore`: atomic JSON file
//! - `MemoryQuotaStore`: in-process store for tests

use async_trait::async_trait;

use crate::{Result, quota::QuotaSnapshot};

/// Load/save access to the persisted quota snapshot
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Load the last saved snapshot
    ///
    /// # Returns
    /// `None` when nothing has been saved yet.
    ///
    /// # Errors
    /// - `Error::Storage` if the backend cannot be read
    /// - `Error::Serialization` if the stored snapshot is malformed
    async fn load(&self) -> Result<Option<QuotaSnapshot>>;

    /// Replace the stored snapshot
    ///
    /// # Errors
    /// - `Error::Storage` if the backend cannot be written
    async fn save(&self, snapshot: &QuotaSnapshot) -> Result<()>;
}
