use anyhow::Context as _;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, Request, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::error::HubError;
use crate::fanout::SubscriptionManager;
use crate::ingest::{InboundRequest, Ingestor};
use crate::live;
use crate::metrics::Metrics;
use crate::registry::EndpointRegistry;
use crate::store::EventStore;
use crate::types::{
    CaptureReceipt, CapturedEvent, CreateEndpointRequest, CreateEndpointResponse, DeleteResponse,
    Endpoint, EndpointView, HealthResponse,
};

/// Shared state for every handler.
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub registry: EndpointRegistry,
    pub ingestor: Ingestor,
    pub subscriptions: Arc<SubscriptionManager>,
    pub metrics: Arc<Metrics>,
    pub public_url: String,
}

impl AppState {
    /// Wire the registry, fanout and ingestion around one store.
    pub fn new(
        store: Arc<dyn EventStore>,
        public_url: impl Into<String>,
        subscriber_buffer: usize,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let registry = EndpointRegistry::new(store.clone(), metrics.clone());
        let subscriptions = Arc::new(SubscriptionManager::new(subscriber_buffer, metrics.clone()));
        let ingestor = Ingestor::new(
            store.clone(),
            registry.clone(),
            subscriptions.clone(),
            metrics.clone(),
        );
        Self {
            store,
            registry,
            ingestor,
            subscriptions,
            metrics,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn capture_url(&self, endpoint_id: &str) -> String {
        format!("{}/w/{endpoint_id}", self.public_url)
    }

    fn view(&self, endpoint: Endpoint) -> EndpointView {
        let url = self.capture_url(&endpoint.id);
        EndpointView { endpoint, url }
    }
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/endpoints", get(list_endpoints).post(create_endpoint))
        .route("/api/endpoints/{id}", get(get_endpoint).delete(delete_endpoint))
        .route("/api/endpoints/{id}/requests", get(list_requests))
        .route("/api/webhooks", get(list_webhooks))
        .route(
            "/w/{id}",
            any(capture_webhook).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(live::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), track_duration))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn start(config: &Config, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state, config.max_body_bytes);

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", config.bind))?;
    let local = listener.local_addr()?;
    info!(
        "webhookhub listening on {local}, capture URLs under {}/w/",
        config.public_url()
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")
}

async fn shutdown_signal() {
    wait_for_shutdown(tokio::signal::ctrl_c()).await
}

/// Resolves when `signal` fires. If the handler cannot be installed the
/// server keeps running and has to be stopped some other way.
async fn wait_for_shutdown<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => {
            error!("failed to install Ctrl-C handler, graceful shutdown disabled: {e}");
            std::future::pending::<()>().await;
        }
    }
}

async fn track_duration(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let response = next.run(req).await;
    state.metrics.observe_request(started.elapsed());
    response
}

// ─── Endpoint registry ───────────────────────────────────────────────────────

async fn create_endpoint(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateEndpointResponse>), HubError> {
    let req: CreateEndpointRequest = serde_json::from_slice(&body)
        .map_err(|e| HubError::Validation(format!("invalid request body: {e}")))?;
    let name = req
        .name
        .ok_or_else(|| HubError::Validation("missing required field: name".to_string()))?;

    let endpoint = state.registry.create(&name).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateEndpointResponse {
            url: state.capture_url(&endpoint.id),
            id: endpoint.id,
            name: endpoint.name,
            created_at: endpoint.created_at,
        }),
    ))
}

async fn list_endpoints(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<EndpointView>>, HubError> {
    let endpoints = state.registry.list().await?;
    Ok(Json(endpoints.into_iter().map(|e| state.view(e)).collect()))
}

async fn get_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<EndpointView>, HubError> {
    let endpoint = state.registry.get(&id).await?;
    Ok(Json(state.view(endpoint)))
}

async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, HubError> {
    state.registry.delete(&id).await?;
    state.subscriptions.drop_channel(&id);
    Ok(Json(DeleteResponse { success: true }))
}

// ─── History ─────────────────────────────────────────────────────────────────

async fn list_requests(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CapturedEvent>>, HubError> {
    Ok(Json(state.store.list_events(&id).await?))
}

/// Legacy alias: every event across all endpoints, same shape as above.
async fn list_webhooks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CapturedEvent>>, HubError> {
    Ok(Json(state.store.list_all_events().await?))
}

// ─── Capture ─────────────────────────────────────────────────────────────────

async fn capture_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CaptureReceipt>, HubError> {
    let request = InboundRequest {
        method,
        uri,
        headers,
        body,
        peer: peer.map(|Extension(ConnectInfo(addr))| addr),
    };
    Ok(Json(state.ingestor.capture(&id, request).await?))
}

// ─── Operational ─────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, HubError> {
    let stats = state.store.stats().await?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        endpoints: stats.endpoints,
        webhooks: stats.events,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, HubError> {
    let stats = state.store.stats().await?;
    let body = state
        .metrics
        .render(stats, state.subscriptions.connection_count());
    Ok((
        [("content-type", "text/plain; version=0.0.4")],
        body,
    ))
}
