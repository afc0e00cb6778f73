pub mod sqlite;

pub use sqlite::{SqliteStore, StorageError};

use async_trait::async_trait;

use crate::models::{Measurement, TagDescriptor};

/// Contract between the ingestion pipeline and the relational store.
///
/// Implementations must be safe to share across concurrently processed files:
/// every call acquires its own connection or serializes internally.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// All tags that carry a tag code.
    async fn load_tags(&self) -> sqlite::Result<Vec<TagDescriptor>>;

    /// Upsert keyed on (timestamp, tag id) in a single all-or-nothing
    /// transaction. Existing values are overwritten.
    async fn upsert_measurements(&self, batch: &[Measurement]) -> sqlite::Result<u64>;

    /// Recompute one derived aggregate view.
    async fn refresh_view(&self, name: &str) -> sqlite::Result<()>;
}
