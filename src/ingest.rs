use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use axum::extract::Query;
use chrono::Utc;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::fanout::Publisher;
use crate::metrics::Metrics;
use crate::registry::EndpointRegistry;
use crate::store::EventStore;
use crate::types::{CaptureReceipt, CapturedEvent};

/// Everything the transport handed us for one inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer: Option<SocketAddr>,
}

/// Turns inbound requests into stored events and fans them out.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn EventStore>,
    registry: EndpointRegistry,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<Metrics>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: EndpointRegistry,
        publisher: Arc<dyn Publisher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            metrics,
        }
    }

    /// Persist, count, then publish. Publishing happens only after the event
    /// is queryable, so a live viewer never sees an event history lacks.
    pub async fn capture(
        &self,
        endpoint_id: &str,
        request: InboundRequest,
    ) -> Result<CaptureReceipt, HubError> {
        if self.store.get_endpoint(endpoint_id).await?.is_none() {
            return Err(HubError::NotFound(format!("Endpoint not found: {endpoint_id}")));
        }

        let event = snapshot(endpoint_id, &request);
        let event = self.store.insert_event(event).await?;

        if let Err(e) = self.registry.touch(endpoint_id, event.received_at).await {
            // Undo the insert so the event and its counter land together.
            if let Err(undo) = self.store.remove_event(endpoint_id, &event.id).await {
                error!("failed to roll back event {} on {endpoint_id}: {undo}", event.id);
            }
            return Err(e);
        }
        self.metrics.webhook_captured();

        let receipt = CaptureReceipt {
            received: true,
            id: event.id.clone(),
            timestamp: event.received_at,
            endpoint_id: endpoint_id.to_string(),
        };

        debug!(
            "captured {} /w/{} from {} ({} bytes)",
            event.method,
            endpoint_id,
            event.source_ip,
            request.body.len()
        );

        let delivered = self.publisher.publish(Arc::new(event));
        if delivered > 0 {
            debug!("pushed {} to {delivered} live viewer(s)", receipt.id);
        }
        Ok(receipt)
    }
}

/// Build the immutable event record for one request.
pub fn snapshot(endpoint_id: &str, request: &InboundRequest) -> CapturedEvent {
    let (body, body_encoding) = CapturedEvent::encode_body(&request.body);
    CapturedEvent {
        id: Uuid::new_v4().to_string(),
        sequence: 0,
        endpoint_id: endpoint_id.to_string(),
        method: request.method.as_str().to_string(),
        headers: collect_headers(&request.headers),
        body,
        body_encoding,
        query_params: collect_query(&request.uri),
        source_ip: source_ip(&request.headers, request.peer),
        user_agent: header_str(&request.headers, "user-agent").map(str::to_string),
        received_at: Utc::now(),
    }
}

/// Lowercased names; repeated headers joined with ", " in arrival order.
pub fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}

/// Decode the query string; repeated keys joined with ",". Never fails.
pub fn collect_query(uri: &Uri) -> BTreeMap<String, String> {
    let pairs = match Query::<Vec<(String, String)>>::try_from_uri(uri) {
        Ok(Query(pairs)) => pairs,
        Err(e) => {
            warn!("ignoring undecodable query string: {e}");
            return BTreeMap::new();
        }
    };
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in pairs {
        out.entry(key)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

/// Forwarded-for first, then x-real-ip, then the socket peer.
pub fn source_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real) = header_str(headers, "x-real-ip").map(str::trim) {
        if !real.is_empty() {
            return real.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::fanout::SubscriptionManager;
    use crate::store::{MemoryStore, StoreStats};
    use crate::types::Endpoint;
    use async_trait::async_trait;
    use axum::http::{HeaderValue, StatusCode};
    use chrono::DateTime;

    struct Harness {
        store: Arc<MemoryStore>,
        registry: EndpointRegistry,
        fanout: Arc<SubscriptionManager>,
        ingestor: Ingestor,
    }

    fn harness() -> Harness {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(MemoryStore::new());
        let registry = EndpointRegistry::new(store.clone(), metrics.clone());
        let fanout = Arc::new(SubscriptionManager::new(64, metrics.clone()));
        let ingestor = Ingestor::new(store.clone(), registry.clone(), fanout.clone(), metrics);
        Harness {
            store,
            registry,
            fanout,
            ingestor,
        }
    }

    enum TouchFault {
        /// The counter write itself fails.
        Io,
        /// A delete lands between the event insert and the counter bump.
        DeletedMidway,
    }

    /// Delegates to a `MemoryStore` except that every touch fails.
    struct FaultyTouchStore {
        inner: MemoryStore,
        fault: TouchFault,
    }

    #[async_trait]
    impl EventStore for FaultyTouchStore {
        async fn insert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
            self.inner.insert_endpoint(endpoint).await
        }

        async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
            self.inner.list_endpoints().await
        }

        async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, StoreError> {
            self.inner.get_endpoint(id).await
        }

        async fn delete_endpoint(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_endpoint(id).await
        }

        async fn insert_event(&self, event: CapturedEvent) -> Result<CapturedEvent, StoreError> {
            self.inner.insert_event(event).await
        }

        async fn remove_event(&self, endpoint_id: &str, event_id: &str) -> Result<(), StoreError> {
            self.inner.remove_event(endpoint_id, event_id).await
        }

        async fn touch_endpoint(
            &self,
            id: &str,
            at: DateTime<Utc>,
        ) -> Result<Endpoint, StoreError> {
            match self.fault {
                TouchFault::Io => Err(StoreError::Io(std::io::Error::other("disk full"))),
                TouchFault::DeletedMidway => {
                    self.inner.delete_endpoint(id).await?;
                    self.inner.touch_endpoint(id, at).await
                }
            }
        }

        async fn list_events(&self, endpoint_id: &str) -> Result<Vec<CapturedEvent>, StoreError> {
            self.inner.list_events(endpoint_id).await
        }

        async fn list_all_events(&self) -> Result<Vec<CapturedEvent>, StoreError> {
            self.inner.list_all_events().await
        }

        async fn stats(&self) -> Result<StoreStats, StoreError> {
            self.inner.stats().await
        }
    }

    async fn failed_touch_capture(fault: TouchFault) -> (HubError, Arc<FaultyTouchStore>, usize) {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(FaultyTouchStore {
            inner: MemoryStore::new(),
            fault,
        });
        let registry = EndpointRegistry::new(store.clone(), metrics.clone());
        let fanout = Arc::new(SubscriptionManager::new(8, metrics.clone()));
        let ingestor = Ingestor::new(
            store.clone(),
            registry.clone(),
            fanout.clone(),
            metrics.clone(),
        );

        let ep = registry.create("flaky").await.unwrap();
        let mut viewer = fanout.connect();
        viewer.subscribe(&ep.id);

        let err = ingestor
            .capture(&ep.id, request(Method::POST, "/w/x", b"payload"))
            .await
            .unwrap_err();

        assert!(viewer.try_recv().is_none(), "a failed capture must not be pushed");
        assert_eq!(metrics.snapshot().webhook_requests_total, 0);
        assert!(store.list_all_events().await.unwrap().is_empty());
        let leftover = match store.get_endpoint(&ep.id).await.unwrap() {
            Some(ep) => ep.request_count as usize,
            None => 0,
        };
        (err, store, leftover)
    }

    fn request(method: Method, uri: &str, body: &'static [u8]) -> InboundRequest {
        InboundRequest {
            method,
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
            peer: Some("10.1.2.3:5555".parse().unwrap()),
        }
    }

    #[test]
    fn duplicate_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("X-Tag", HeaderValue::from_static("one"));
        headers.append("x-tag", HeaderValue::from_static("two"));
        headers.insert("Content-Type", HeaderValue::from_static("text/plain"));
        let out = collect_headers(&headers);
        assert_eq!(out.get("x-tag").map(String::as_str), Some("one, two"));
        assert_eq!(out.get("content-type").map(String::as_str), Some("text/plain"));
    }

    #[test]
    fn query_is_decoded_into_mapping() {
        let uri: Uri = "/w/abc?a=1&b=hello%20world&a=2&flag".parse().unwrap();
        let q = collect_query(&uri);
        assert_eq!(q.get("a").map(String::as_str), Some("1,2"));
        assert_eq!(q.get("b").map(String::as_str), Some("hello world"));
        assert_eq!(q.get("flag").map(String::as_str), Some(""));
        assert!(collect_query(&"/w/abc".parse().unwrap()).is_empty());
    }

    #[test]
    fn source_ip_prefers_forwarded_for() {
        let peer: Option<SocketAddr> = Some("192.168.0.9:1234".parse().unwrap());
        let mut headers = HeaderMap::new();
        assert_eq!(source_ip(&headers, peer), "192.168.0.9");
        assert_eq!(source_ip(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("172.16.0.1"));
        assert_eq!(source_ip(&headers, peer), "172.16.0.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(source_ip(&headers, peer), "203.0.113.7");
    }

    #[tokio::test]
    async fn capture_stores_counts_and_publishes() {
        let h = harness();
        let ep = h.registry.create("demo").await.unwrap();
        let mut viewer = h.fanout.connect();
        viewer.subscribe(&ep.id);

        let receipt = h
            .ingestor
            .capture(&ep.id, request(Method::POST, "/w/x?k=v", b"{\"a\":1}"))
            .await
            .unwrap();
        assert!(receipt.received);
        assert_eq!(receipt.endpoint_id, ep.id);

        let history = h.store.list_events(&ep.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, receipt.id);
        assert_eq!(history[0].method, "POST");
        assert_eq!(history[0].body, "{\"a\":1}");
        assert_eq!(history[0].source_ip, "10.1.2.3");
        assert_eq!(history[0].query_params.get("k").map(String::as_str), Some("v"));

        let ep = h.registry.get(&ep.id).await.unwrap();
        assert_eq!(ep.request_count, 1);
        assert_eq!(ep.last_request_at, Some(receipt.timestamp));

        let pushed = viewer.try_recv().unwrap();
        assert_eq!(pushed.id, receipt.id);
        assert!(viewer.try_recv().is_none());
    }

    #[tokio::test]
    async fn unknown_endpoint_writes_nothing() {
        let h = harness();
        let ep = h.registry.create("demo").await.unwrap();
        let mut viewer = h.fanout.connect();
        viewer.subscribe("nope");

        let err = h
            .ingestor
            .capture("nope", request(Method::GET, "/w/nope", b""))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
        assert!(h.store.list_all_events().await.unwrap().is_empty());
        assert_eq!(h.registry.get(&ep.id).await.unwrap().request_count, 0);
        assert!(viewer.try_recv().is_none());
    }

    #[tokio::test]
    async fn identical_requests_produce_distinct_events() {
        let h = harness();
        let ep = h.registry.create("demo").await.unwrap();
        let a = h.ingestor.capture(&ep.id, request(Method::PUT, "/w", b"x")).await.unwrap();
        let b = h.ingestor.capture(&ep.id, request(Method::PUT, "/w", b"x")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(h.store.list_events(&ep.id).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_captures_count_exactly() {
        const N: usize = 200;
        let h = harness();
        let ep = h.registry.create("busy").await.unwrap();

        let mut tasks = Vec::with_capacity(N);
        for _ in 0..N {
            let ingestor = h.ingestor.clone();
            let id = ep.id.clone();
            tasks.push(tokio::spawn(async move {
                ingestor
                    .capture(&id, request(Method::POST, "/w", b"{}"))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let ep = h.registry.get(&ep.id).await.unwrap();
        assert_eq!(ep.request_count, N as u64);
        let history = h.store.list_events(&ep.id).await.unwrap();
        assert_eq!(history.len(), N);
        assert!(history
            .windows(2)
            .all(|w| w[0].received_at >= w[1].received_at));
    }

    #[tokio::test]
    async fn failed_touch_rolls_back_the_event() {
        let (err, store, count) = failed_touch_capture(TouchFault::Io).await;
        assert!(matches!(err, HubError::Storage(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(count, 0);
        assert_eq!(store.stats().await.unwrap().endpoints, 1);
    }

    #[tokio::test]
    async fn delete_between_insert_and_touch_leaves_nothing() {
        let (err, store, count) = failed_touch_capture(TouchFault::DeletedMidway).await;
        assert!(matches!(err, HubError::NotFound(_)));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(count, 0);
        assert_eq!(
            store.stats().await.unwrap(),
            StoreStats {
                endpoints: 0,
                events: 0
            }
        );
    }
}
