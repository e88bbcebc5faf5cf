//! Backing store for endpoints and their captured events.
//!
//! Every handler task shares one `Arc<dyn EventStore>`. Implementations must
//! make each mutation atomic at the endpoint level and must never serialize
//! traffic for unrelated endpoints.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{CapturedEvent, Endpoint};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub endpoints: u64,
    pub events: u64,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Fails with `Conflict` if the id is already taken.
    async fn insert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError>;

    /// All endpoints in creation order.
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, StoreError>;

    /// Remove an endpoint and every event referencing it. Returns `false` if
    /// the endpoint did not exist.
    async fn delete_endpoint(&self, id: &str) -> Result<bool, StoreError>;

    /// Persist an event and return it with its insertion `sequence` set.
    /// Fails with `NotFound` if the endpoint is absent or being deleted.
    async fn insert_event(&self, event: CapturedEvent) -> Result<CapturedEvent, StoreError>;

    /// Undo an `insert_event` whose follow-up step failed. Absent rows are
    /// not an error.
    async fn remove_event(&self, endpoint_id: &str, event_id: &str) -> Result<(), StoreError>;

    /// Atomically bump `request_count` and advance `last_request_at`.
    async fn touch_endpoint(&self, id: &str, at: DateTime<Utc>) -> Result<Endpoint, StoreError>;

    /// Events for one endpoint, newest first.
    async fn list_events(&self, endpoint_id: &str) -> Result<Vec<CapturedEvent>, StoreError>;

    /// Events across all endpoints, newest first.
    async fn list_all_events(&self) -> Result<Vec<CapturedEvent>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
