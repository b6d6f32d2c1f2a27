//! Per-client fan-out of command envelopes to agent connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vibrant_core::{ClientId, ConnectionId};

use crate::metrics::BROADCAST_DROPS_TOTAL;

/// Outbound half of one agent transport connection.
pub struct AgentConnection {
    pub id: ConnectionId,
    pub client_id: ClientId,
    /// Send channel to the connection's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    pub connected_at: Instant,
    /// Count of messages dropped due to a full or closed channel.
    dropped_messages: AtomicU64,
}

impl AgentConnection {
    pub fn new(client_id: ClientId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: ConnectionId::new(),
            client_id,
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create a connection with a bounded outbound queue of `capacity`.
    pub fn channel(client_id: ClientId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(client_id, tx)), rx)
    }

    /// Queue a message without waiting.
    ///
    /// Returns `false` if the queue is full or the writer has gone away.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// What a single broadcast achieved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// All live connections of one client id.
pub struct FanOut {
    client_id: ClientId,
    members: RwLock<HashMap<ConnectionId, Arc<AgentConnection>>>,
}

impl FanOut {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Add a member. Connections of other clients are refused.
    pub fn add(&self, connection: Arc<AgentConnection>) -> bool {
        if connection.client_id != self.client_id {
            warn!(
                client_id = %self.client_id,
                conn_client_id = %connection.client_id,
                "refusing connection registered under another client id"
            );
            return false;
        }
        self.members
            .write()
            .insert(connection.id.clone(), connection)
            .is_none()
    }

    pub fn remove(&self, connection_id: &ConnectionId) -> bool {
        self.members.write().remove(connection_id).is_some()
    }

    pub fn count(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Offer `message` to every current member.
    ///
    /// Each member gets an independent `try_send`; a full or dead queue
    /// drops for that member only.
    pub fn broadcast(&self, message: &Arc<String>) -> BroadcastReport {
        let members = self.members.read();
        let mut report = BroadcastReport {
            recipients: members.len(),
            ..Default::default()
        };
        for conn in members.values() {
            if conn.send(Arc::clone(message)) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
                counter!(BROADCAST_DROPS_TOTAL).increment(1);
                warn!(
                    client_id = %self.client_id,
                    conn_id = %conn.id,
                    total_drops = conn.drop_count(),
                    "failed to queue command for connection (channel full or closed)"
                );
            }
        }
        report
    }
}

/// Client id plus its live connection count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FanOutSummary {
    pub client_id: ClientId,
    pub connections: usize,
}

/// Client id → [`FanOut`]. Created lazily by registration, looked up (never
/// created) by broadcast. Empty fan-outs are kept until [`prune_empty`].
///
/// [`prune_empty`]: FanOutRegistry::prune_empty
#[derive(Default)]
pub struct FanOutRegistry {
    fanouts: DashMap<ClientId, Arc<FanOut>>,
}

impl FanOutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, client_id: &ClientId) -> Arc<FanOut> {
        match self.fanouts.entry(client_id.clone()) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => {
                info!(client_id = %client_id, "created fanout");
                Arc::clone(e.insert(Arc::new(FanOut::new(client_id.clone()))).value())
            }
        }
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<FanOut>> {
        self.fanouts.get(client_id).map(|f| Arc::clone(f.value()))
    }

    /// Register a connection with its client's fan-out, creating it if needed.
    ///
    /// The add happens under the registry entry lock so a concurrent
    /// [`prune_empty`](Self::prune_empty) cannot drop the fan-out in between.
    /// Returns the client's member count afterwards.
    pub fn register(&self, connection: Arc<AgentConnection>) -> usize {
        let client_id = connection.client_id.clone();
        let fanout = self.fanouts.entry(client_id.clone()).or_insert_with(|| {
            info!(client_id = %client_id, "created fanout");
            Arc::new(FanOut::new(client_id.clone()))
        });
        let _ = fanout.add(connection);
        fanout.count()
    }

    /// Remove a connection from its client's fan-out. Returns `true` if it was
    /// a member.
    pub fn deregister(&self, connection: &AgentConnection) -> bool {
        self.get(&connection.client_id)
            .is_some_and(|f| f.remove(&connection.id))
    }

    /// Broadcast to `client_id`. `None` when no fan-out exists for it.
    pub fn broadcast(&self, client_id: &ClientId, message: &Arc<String>) -> Option<BroadcastReport> {
        let fanout = self.get(client_id)?;
        let report = fanout.broadcast(message);
        debug!(
            client_id = %client_id,
            recipients = report.recipients,
            delivered = report.delivered,
            "broadcast command"
        );
        Some(report)
    }

    /// Drop fan-outs with no members. Returns how many were removed.
    pub fn prune_empty(&self) -> usize {
        let before = self.fanouts.len();
        self.fanouts.retain(|_, f| !f.is_empty());
        before.saturating_sub(self.fanouts.len())
    }

    pub fn client_count(&self) -> usize {
        self.fanouts.len()
    }

    pub fn connection_count(&self) -> usize {
        self.fanouts.iter().map(|f| f.value().count()).sum()
    }

    /// Every known client with its connection count, sorted by client id.
    pub fn snapshot(&self) -> Vec<FanOutSummary> {
        let mut out: Vec<FanOutSummary> = self
            .fanouts
            .iter()
            .map(|f| FanOutSummary {
                client_id: f.key().clone(),
                connections: f.value().count(),
            })
            .collect();
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        out
    }
}
