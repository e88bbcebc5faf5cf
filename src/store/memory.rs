use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{EventStore, StoreStats};
use crate::error::StoreError;
use crate::types::{CapturedEvent, Endpoint};

/// Per-endpoint state. The catalog lock is only held long enough to clone
/// the `Arc<Slot>`; all further work happens on the slot's own locks.
struct Slot {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    order: u64,
    request_count: AtomicU64,
    last_request_at: Mutex<Option<DateTime<Utc>>>,
    log: Mutex<EventLog>,
}

#[derive(Default)]
struct EventLog {
    events: Vec<CapturedEvent>,
    /// Set by delete under the log lock; late inserts see it and bail.
    removed: bool,
}

impl Slot {
    async fn snapshot(&self) -> Endpoint {
        Endpoint {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            last_request_at: *self.last_request_at.lock().await,
            request_count: self.request_count.load(Ordering::SeqCst),
        }
    }
}

/// In-process store. Also serves as the index behind `FileStore`.
pub struct MemoryStore {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    next_order: AtomicU64,
    next_sequence: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_order: AtomicU64::new(0),
            next_sequence: AtomicU64::new(1),
        }
    }

    async fn slot(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots.read().await.get(id).cloned()
    }

    pub(crate) async fn contains(&self, id: &str) -> bool {
        self.slots.read().await.contains_key(id)
    }

    pub(crate) fn allocate_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Append an event whose sequence is already assigned.
    pub(crate) async fn append(&self, event: CapturedEvent) -> Result<(), StoreError> {
        let slot = self
            .slot(&event.endpoint_id)
            .await
            .ok_or_else(|| StoreError::NotFound(event.endpoint_id.clone()))?;
        let mut log = slot.log.lock().await;
        if log.removed {
            return Err(StoreError::NotFound(event.endpoint_id));
        }
        log.events.push(event);
        Ok(())
    }

    /// Rebuild an endpoint from persisted rows; counters are derived from
    /// the events themselves.
    pub(crate) async fn restore(
        &self,
        endpoint: Endpoint,
        events: Vec<CapturedEvent>,
    ) -> Result<(), StoreError> {
        let last = events.iter().map(|e| e.received_at).max();
        if let Some(max_seq) = events.iter().map(|e| e.sequence).max() {
            self.next_sequence.fetch_max(max_seq + 1, Ordering::SeqCst);
        }
        let slot = Arc::new(Slot {
            id: endpoint.id.clone(),
            name: endpoint.name,
            created_at: endpoint.created_at,
            order: self.next_order.fetch_add(1, Ordering::SeqCst),
            request_count: AtomicU64::new(events.len() as u64),
            last_request_at: Mutex::new(last),
            log: Mutex::new(EventLog {
                events,
                removed: false,
            }),
        });
        let mut slots = self.slots.write().await;
        if slots.contains_key(&endpoint.id) {
            return Err(StoreError::Conflict(endpoint.id));
        }
        slots.insert(endpoint.id, slot);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        let slot = Arc::new(Slot {
            id: endpoint.id.clone(),
            name: endpoint.name,
            created_at: endpoint.created_at,
            order: self.next_order.fetch_add(1, Ordering::SeqCst),
            request_count: AtomicU64::new(endpoint.request_count),
            last_request_at: Mutex::new(endpoint.last_request_at),
            log: Mutex::new(EventLog::default()),
        });
        let mut slots = self.slots.write().await;
        if slots.contains_key(&endpoint.id) {
            return Err(StoreError::Conflict(endpoint.id));
        }
        slots.insert(endpoint.id, slot);
        Ok(())
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let mut slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        slots.sort_by_key(|s| s.order);
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.snapshot().await);
        }
        Ok(out)
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, StoreError> {
        match self.slot(id).await {
            Some(slot) => Ok(Some(slot.snapshot().await)),
            None => Ok(None),
        }
    }

    async fn delete_endpoint(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.slots.write().await.remove(id);
        match removed {
            Some(slot) => {
                let mut log = slot.log.lock().await;
                log.removed = true;
                log.events.clear();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_event(&self, mut event: CapturedEvent) -> Result<CapturedEvent, StoreError> {
        event.sequence = self.allocate_sequence();
        self.append(event.clone()).await?;
        Ok(event)
    }

    async fn remove_event(&self, endpoint_id: &str, event_id: &str) -> Result<(), StoreError> {
        if let Some(slot) = self.slot(endpoint_id).await {
            slot.log.lock().await.events.retain(|e| e.id != event_id);
        }
        Ok(())
    }

    async fn touch_endpoint(&self, id: &str, at: DateTime<Utc>) -> Result<Endpoint, StoreError> {
        let slot = self
            .slot(id)
            .await
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let count = slot.request_count.fetch_add(1, Ordering::SeqCst) + 1;
        let last = {
            let mut last = slot.last_request_at.lock().await;
            if last.map_or(true, |prev| at > prev) {
                *last = Some(at);
            }
            *last
        };
        Ok(Endpoint {
            id: slot.id.clone(),
            name: slot.name.clone(),
            created_at: slot.created_at,
            last_request_at: last,
            request_count: count,
        })
    }

    async fn list_events(&self, endpoint_id: &str) -> Result<Vec<CapturedEvent>, StoreError> {
        let slot = self
            .slot(endpoint_id)
            .await
            .ok_or_else(|| StoreError::NotFound(endpoint_id.to_string()))?;
        let mut events = slot.log.lock().await.events.clone();
        events.sort_by(CapturedEvent::newest_first);
        Ok(events)
    }

    async fn list_all_events(&self) -> Result<Vec<CapturedEvent>, StoreError> {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut events = Vec::new();
        for slot in slots {
            events.extend(slot.log.lock().await.events.iter().cloned());
        }
        events.sort_by(CapturedEvent::newest_first);
        Ok(events)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut events = 0u64;
        for slot in &slots {
            events += slot.log.lock().await.events.len() as u64;
        }
        Ok(StoreStats {
            endpoints: slots.len() as u64,
            events,
        })
    }
}
