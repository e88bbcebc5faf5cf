use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{HubError, StoreError};
use crate::metrics::Metrics;
use crate::store::EventStore;
use crate::types::Endpoint;

const ID_LEN: usize = 12;
const ID_ATTEMPTS: usize = 4;
const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// URL-safe endpoint token: 12 base62 digits of a random UUID.
pub fn generate_endpoint_id() -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut id = String::with_capacity(ID_LEN);
    for _ in 0..ID_LEN {
        id.push(BASE62[(n % 62) as usize] as char);
        n /= 62;
    }
    id
}

/// Endpoint lifecycle and counters.
#[derive(Clone)]
pub struct EndpointRegistry {
    store: Arc<dyn EventStore>,
    metrics: Arc<Metrics>,
}

impl EndpointRegistry {
    pub fn new(store: Arc<dyn EventStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    pub async fn create(&self, name: &str) -> Result<Endpoint, HubError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::Validation("name must not be empty".to_string()));
        }

        for _ in 0..ID_ATTEMPTS {
            let endpoint = Endpoint {
                id: generate_endpoint_id(),
                name: name.to_string(),
                created_at: Utc::now(),
                last_request_at: None,
                request_count: 0,
            };
            match self.store.insert_endpoint(endpoint.clone()).await {
                Ok(()) => {
                    self.metrics.endpoint_created();
                    info!("created endpoint {} ({})", endpoint.id, endpoint.name);
                    return Ok(endpoint);
                }
                Err(StoreError::Conflict(id)) => warn!("endpoint id collision on {id}, retrying"),
                Err(e) => return Err(e.into()),
            }
        }
        Err(HubError::Storage(StoreError::Conflict(
            "could not allocate a unique endpoint id".to_string(),
        )))
    }

    pub async fn list(&self) -> Result<Vec<Endpoint>, HubError> {
        Ok(self.store.list_endpoints().await?)
    }

    pub async fn get(&self, id: &str) -> Result<Endpoint, HubError> {
        self.store
            .get_endpoint(id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("Endpoint not found: {id}")))
    }

    /// Remove the endpoint and cascade to its events.
    pub async fn delete(&self, id: &str) -> Result<(), HubError> {
        if self.store.delete_endpoint(id).await? {
            info!("deleted endpoint {id}");
            Ok(())
        } else {
            Err(HubError::NotFound(format!("Endpoint not found: {id}")))
        }
    }

    /// Record one capture against the endpoint's counters.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<Endpoint, HubError> {
        Ok(self.store.touch_endpoint(id, at).await?)
    }
}
