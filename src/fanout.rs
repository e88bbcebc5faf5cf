//! Live fanout of captured events to subscribed viewer connections.
//!
//! Subscriptions live only in process memory: a map from endpoint id to the
//! set of connections watching it. Each connection owns a bounded queue;
//! `publish` never waits on a viewer. A full queue drops that one push, and a
//! closed queue releases the connection as if it had unsubscribed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::types::CapturedEvent;

pub type ConnectionId = u64;

/// Hands a stored event to whoever is watching its endpoint.
pub trait Publisher: Send + Sync {
    /// Returns the number of connections the event was queued for.
    fn publish(&self, event: Arc<CapturedEvent>) -> usize;
}

struct ConnectionEntry {
    tx: mpsc::Sender<Arc<CapturedEvent>>,
    endpoints: HashSet<String>,
}

#[derive(Default)]
struct Subscriptions {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: HashMap<String, HashSet<ConnectionId>>,
}

pub struct SubscriptionManager {
    inner: RwLock<Subscriptions>,
    next_id: AtomicU64,
    buffer: usize,
    metrics: Arc<Metrics>,
}

impl SubscriptionManager {
    pub fn new(buffer: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: RwLock::new(Subscriptions::default()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            metrics,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Subscriptions> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Subscriptions> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection with no subscriptions. Dropping the returned
    /// handle releases everything it subscribed to.
    pub fn connect(self: &Arc<Self>) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.write().connections.insert(
            id,
            ConnectionEntry {
                tx,
                endpoints: HashSet::new(),
            },
        );
        debug!("live connection {id} registered");
        Connection {
            id,
            rx,
            manager: Arc::clone(self),
        }
    }

    /// Idempotent. Returns `false` if the connection is no longer registered.
    pub fn subscribe(&self, connection: ConnectionId, endpoint_id: &str) -> bool {
        let mut subs = self.write();
        let Some(entry) = subs.connections.get_mut(&connection) else {
            return false;
        };
        entry.endpoints.insert(endpoint_id.to_string());
        subs.channels
            .entry(endpoint_id.to_string())
            .or_default()
            .insert(connection);
        true
    }

    /// Unsubscribing a pair that is not subscribed is a no-op.
    pub fn unsubscribe(&self, connection: ConnectionId, endpoint_id: &str) {
        let mut subs = self.write();
        if let Some(entry) = subs.connections.get_mut(&connection) {
            entry.endpoints.remove(endpoint_id);
        }
        if let Some(members) = subs.channels.get_mut(endpoint_id) {
            members.remove(&connection);
            if members.is_empty() {
                subs.channels.remove(endpoint_id);
            }
        }
    }

    /// Release every subscription held by the connection.
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut subs = self.write();
        let Some(entry) = subs.connections.remove(&connection) else {
            return;
        };
        for endpoint_id in entry.endpoints {
            if let Some(members) = subs.channels.get_mut(&endpoint_id) {
                members.remove(&connection);
                if members.is_empty() {
                    subs.channels.remove(&endpoint_id);
                }
            }
        }
        debug!("live connection {connection} released");
    }

    /// Release a channel whose endpoint no longer exists. Connections stay
    /// registered. Returns how many subscriptions were dropped.
    pub fn drop_channel(&self, endpoint_id: &str) -> usize {
        let mut subs = self.write();
        let Some(members) = subs.channels.remove(endpoint_id) else {
            return 0;
        };
        for id in &members {
            if let Some(entry) = subs.connections.get_mut(id) {
                entry.endpoints.remove(endpoint_id);
            }
        }
        debug!(
            "released {} live subscription(s) to deleted endpoint {endpoint_id}",
            members.len()
        );
        members.len()
    }

    pub fn subscriptions(&self, connection: ConnectionId) -> Vec<String> {
        let mut out: Vec<String> = self
            .read()
            .connections
            .get(&connection)
            .map(|e| e.endpoints.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn subscriber_count(&self, endpoint_id: &str) -> usize {
        self.read().channels.get(endpoint_id).map_or(0, HashSet::len)
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.read().channels.len()
    }
}

impl Publisher for SubscriptionManager {
    fn publish(&self, event: Arc<CapturedEvent>) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<Arc<CapturedEvent>>)> = {
            let subs = self.read();
            match subs.channels.get(&event.endpoint_id) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| subs.connections.get(id).map(|c| (*id, c.tx.clone())))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.metrics.live_delivery_dropped();
                    warn!(
                        "live connection {id} is not keeping up, dropped event {}",
                        event.id
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }
        for id in closed {
            warn!("live connection {id} went away, releasing its subscriptions");
            self.disconnect(id);
        }
        delivered
    }
}

/// A registered viewer connection. Receives every event published on the
/// channels it subscribes to while it is alive.
pub struct Connection {
    id: ConnectionId,
    rx: mpsc::Receiver<Arc<CapturedEvent>>,
    manager: Arc<SubscriptionManager>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn subscribe(&self, endpoint_id: &str) -> bool {
        self.manager.subscribe(self.id, endpoint_id)
    }

    pub fn unsubscribe(&self, endpoint_id: &str) {
        self.manager.unsubscribe(self.id, endpoint_id)
    }

    /// Next queued event. `None` once the connection has been released.
    pub async fn recv(&mut self) -> Option<Arc<CapturedEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<CapturedEvent>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.manager.disconnect(self.id);
    }
}
