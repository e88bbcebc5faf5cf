//! Capture inbound HTTP requests against generated endpoints, keep them as
//! durable history and push them live to subscribed viewers.

pub mod config;
pub mod error;
pub mod fanout;
pub mod http_server;
pub mod ingest;
pub mod live;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod types;

pub use error::{HubError, StoreError};
pub use http_server::AppState;
