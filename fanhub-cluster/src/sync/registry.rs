use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionState, Payload};
use crate::error::{Error, Result};

/// Identity of a registered connection, assigned by the accept layer
pub type ConnectionId = String;

/// Default size of the admission gate used by broadcast
pub const DEFAULT_BROADCAST_CONCURRENCY: usize = 100;

/// Capacity of the departure notice channel
pub(crate) const DEPARTURE_CHANNEL_CAPACITY: usize = 1024;

struct ConnectionEntry {
    id: ConnectionId,
    /// Distinguishes this registration from earlier ones under the same id
    generation: u64,
    origin: String,
    connection: Arc<dyn Connection>,
    connected_at: Instant,
    message_count: AtomicU64,
    /// Serializes writes so one caller's sequential sends keep their order
    write_lock: AsyncMutex<()>,
}

/// Identity map and origin index, always mutated together
#[derive(Default)]
struct RegistryIndex {
    entries: HashMap<ConnectionId, Arc<ConnectionEntry>>,
    by_origin: HashMap<String, HashSet<ConnectionId>>,
}

/// Point-in-time view of a registered connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub generation: u64,
    pub origin: String,
    pub state: ConnectionState,
    pub connected_at: Instant,
    pub message_count: u64,
}

/// Notice that a registration left the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub connection_id: ConnectionId,
    pub generation: u64,
}

impl ConnectionInfo {
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Result of a single send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// No connection is registered under the identity
    NotFound,
    /// The connection was dead or failed mid-write and has been removed
    Dropped,
}

/// Tally of a fan-out over many connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// Registry metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryMetrics {
    pub active_connections: usize,
    pub active_origins: usize,
    pub total_connections: u64,
    pub total_messages: u64,
}

/// Live registry of client connections on this node
///
/// Owns every connection handle. Lookups clone the entry out of the index so
/// no lock is held while writing to a connection.
#[derive(Clone)]
pub struct ConnectionRegistry {
    index: Arc<RwLock<RegistryIndex>>,
    broadcast_concurrency: usize,
    departures: broadcast::Sender<Departure>,
    total_connections: Arc<AtomicU64>,
    total_messages: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    /// Create a registry whose broadcasts admit at most `broadcast_concurrency`
    /// sends at once
    #[must_use]
    pub fn new(broadcast_concurrency: usize) -> Self {
        let (departures, _) = broadcast::channel(DEPARTURE_CHANNEL_CAPACITY);
        Self {
            index: Arc::new(RwLock::new(RegistryIndex::default())),
            broadcast_concurrency: broadcast_concurrency.max(1),
            departures,
            total_connections: Arc::new(AtomicU64::new(0)),
            total_messages: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new connection
    ///
    /// Fails if the identity is already registered; the existing connection
    /// is left untouched.
    pub fn add(
        &self,
        connection_id: impl Into<ConnectionId>,
        connection: Arc<dyn Connection>,
        origin: impl Into<String>,
    ) -> Result<()> {
        let connection_id = connection_id.into();
        let origin = origin.into();

        let origin_size = {
            let mut guard = self.index.write();
            let index = &mut *guard;
            if index.entries.contains_key(&connection_id) {
                None
            } else {
                let generation = self.total_connections.fetch_add(1, Ordering::Relaxed) + 1;
                let entry = Arc::new(ConnectionEntry {
                    id: connection_id.clone(),
                    generation,
                    origin: origin.clone(),
                    connection,
                    connected_at: Instant::now(),
                    message_count: AtomicU64::new(0),
                    write_lock: AsyncMutex::new(()),
                });
                index.entries.insert(connection_id.clone(), entry);
                let ids = index.by_origin.entry(origin.clone()).or_default();
                ids.insert(connection_id.clone());
                Some(ids.len())
            }
        };

        let Some(origin_size) = origin_size else {
            warn!(
                connection_id = %connection_id,
                origin = %origin,
                "Rejected duplicate connection registration"
            );
            return Err(Error::DuplicateConnection(connection_id));
        };

        info!(
            connection_id = %connection_id,
            origin = %origin,
            origin_connections = origin_size,
            total_connections = self.connection_count(),
            "Connection registered"
        );

        Ok(())
    }

    /// Unregister a connection and close it
    ///
    /// Idempotent: returns `false` when the identity is not registered.
    pub async fn remove(&self, connection_id: &str) -> bool {
        self.take(connection_id).await.is_some()
    }

    /// Remove and close a connection, returning the generation that left
    pub async fn take(&self, connection_id: &str) -> Option<u64> {
        let removed = {
            let mut guard = self.index.write();
            let index = &mut *guard;
            let entry = index.entries.remove(connection_id);
            if let Some(entry) = &entry {
                Self::unindex_origin(index, entry);
            }
            entry
        };

        let entry = removed?;
        self.finish_removal(&entry).await;
        Some(entry.generation)
    }

    /// Remove `entry` only if it is still the one registered under its
    /// identity. A failed send must not evict a newer connection that reused
    /// the identity in the meantime.
    async fn remove_entry(&self, entry: &Arc<ConnectionEntry>) -> bool {
        let removed = {
            let mut guard = self.index.write();
            let index = &mut *guard;
            let current = index
                .entries
                .get(&entry.id)
                .is_some_and(|registered| Arc::ptr_eq(registered, entry));
            if current {
                index.entries.remove(&entry.id);
                Self::unindex_origin(index, entry);
            }
            current
        };

        if removed {
            self.finish_removal(entry).await;
        }
        removed
    }

    fn unindex_origin(index: &mut RegistryIndex, entry: &ConnectionEntry) {
        let now_empty = index
            .by_origin
            .get_mut(&entry.origin)
            .is_some_and(|ids| {
                ids.remove(&entry.id);
                ids.is_empty()
            });
        if now_empty {
            index.by_origin.remove(&entry.origin);
        }
    }

    /// Close the connection of an entry that has already left the index
    async fn finish_removal(&self, entry: &ConnectionEntry) {
        // Nobody may be listening
        let _ = self.departures.send(Departure {
            connection_id: entry.id.clone(),
            generation: entry.generation,
        });

        let state = entry.connection.state();
        match state {
            ConnectionState::Open | ConnectionState::Closing => {
                if let Err(e) = entry.connection.close().await {
                    warn!(
                        connection_id = %entry.id,
                        state = %state,
                        error = %e,
                        "Failed to close connection gracefully"
                    );
                }
            }
            ConnectionState::Closed => {}
        }

        info!(
            connection_id = %entry.id,
            origin = %entry.origin,
            duration = ?entry.connected_at.elapsed(),
            message_count = entry.message_count.load(Ordering::Relaxed),
            "Connection unregistered"
        );
    }

    fn entry(&self, connection_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.index.read().entries.get(connection_id).cloned()
    }

    fn snapshot_entries(&self) -> Vec<Arc<ConnectionEntry>> {
        self.index.read().entries.values().cloned().collect()
    }

    /// Write one payload to one entry, removing the connection if it is dead
    async fn deliver(&self, entry: &Arc<ConnectionEntry>, payload: Payload) -> SendOutcome {
        let result = {
            let _write = entry.write_lock.lock().await;
            let state = entry.connection.state();
            if state == ConnectionState::Open {
                entry.connection.send(payload).await.map_err(|e| e.to_string())
            } else {
                Err(format!("connection is {state}"))
            }
        };

        match result {
            Ok(()) => {
                entry.message_count.fetch_add(1, Ordering::Relaxed);
                self.total_messages.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Delivered
            }
            Err(reason) => {
                warn!(
                    connection_id = %entry.id,
                    reason = %reason,
                    "Failed to send to connection, removing it"
                );
                self.remove_entry(entry).await;
                SendOutcome::Dropped
            }
        }
    }

    /// Send a payload to one connection
    ///
    /// Never fails: a dead connection is removed and reported as `Dropped`.
    pub async fn send(&self, connection_id: &str, payload: Payload) -> SendOutcome {
        match self.entry(connection_id) {
            Some(entry) => self.deliver(&entry, payload).await,
            None => {
                debug!(connection_id = %connection_id, "Send to unknown connection ignored");
                SendOutcome::NotFound
            }
        }
    }

    /// Like [`send`](Self::send), but gives up when `cancel` fires.
    ///
    /// A cancelled write may have left a partial frame behind, so the
    /// connection is removed.
    pub async fn send_cancellable(
        &self,
        connection_id: &str,
        payload: Payload,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        let Some(entry) = self.entry(connection_id) else {
            return SendOutcome::NotFound;
        };

        tokio::select! {
            outcome = self.deliver(&entry, payload) => outcome,
            () = cancel.cancelled() => {
                debug!(connection_id = %connection_id, "Send cancelled, removing connection");
                self.remove_entry(&entry).await;
                SendOutcome::Dropped
            }
        }
    }

    /// Broadcast to every registered connection with the default gate size
    pub async fn broadcast(&self, payload: Payload) -> BroadcastReport {
        self.broadcast_with(payload, self.broadcast_concurrency).await
    }

    /// Broadcast to every registered connection, at most `max_concurrency`
    /// sends in flight. Returns once every attempt has finished.
    pub async fn broadcast_with(&self, payload: Payload, max_concurrency: usize) -> BroadcastReport {
        let entries = self.snapshot_entries();
        let report = self.deliver_all(entries, &payload, max_concurrency).await;

        debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast complete"
        );

        report
    }

    /// Send one payload to the listed connections through the admission gate.
    /// Unknown identities are skipped.
    pub async fn send_many(
        &self,
        connection_ids: &[ConnectionId],
        payload: &Payload,
        max_concurrency: usize,
    ) -> BroadcastReport {
        let entries: Vec<_> = {
            let index = self.index.read();
            connection_ids
                .iter()
                .filter_map(|id| index.entries.get(id).cloned())
                .collect()
        };
        self.deliver_all(entries, payload, max_concurrency).await
    }

    async fn deliver_all(
        &self,
        entries: Vec<Arc<ConnectionEntry>>,
        payload: &Payload,
        max_concurrency: usize,
    ) -> BroadcastReport {
        let gate = Semaphore::new(max_concurrency.max(1));
        let gate = &gate;

        let attempts = entries.iter().map(|entry| async move {
            // The gate is never closed
            let Ok(_permit) = gate.acquire().await else {
                return SendOutcome::NotFound;
            };
            self.deliver(entry, payload.clone()).await
        });

        let outcomes = join_all(attempts).await;

        let mut report = BroadcastReport {
            attempted: outcomes.len(),
            ..BroadcastReport::default()
        };
        for outcome in outcomes {
            match outcome {
                SendOutcome::Delivered => report.delivered += 1,
                SendOutcome::Dropped => report.dropped += 1,
                SendOutcome::NotFound => {}
            }
        }
        report
    }

    /// Snapshot of the identities registered under `origin`
    #[must_use]
    pub fn connections_by_origin(&self, origin: &str) -> HashSet<ConnectionId> {
        self.index
            .read()
            .by_origin
            .get(origin)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every registered identity
    #[must_use]
    pub fn list_identities(&self) -> Vec<ConnectionId> {
        self.index.read().entries.keys().cloned().collect()
    }

    /// Generation of the current registration under `connection_id`
    #[must_use]
    pub fn generation_of(&self, connection_id: &str) -> Option<u64> {
        self.index
            .read()
            .entries
            .get(connection_id)
            .map(|entry| entry.generation)
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.index.read().entries.contains_key(connection_id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.index.read().entries.len()
    }

    #[must_use]
    pub fn origin_count(&self) -> usize {
        self.index.read().by_origin.len()
    }

    #[must_use]
    pub fn get_connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.entry(connection_id).map(|entry| ConnectionInfo {
            connection_id: entry.id.clone(),
            generation: entry.generation,
            origin: entry.origin.clone(),
            state: entry.connection.state(),
            connected_at: entry.connected_at,
            message_count: entry.message_count.load(Ordering::Relaxed),
        })
    }

    /// Receive the identity of every connection as it leaves the registry,
    /// whether removed explicitly or dropped after a failed send
    #[must_use]
    pub fn subscribe_departures(&self) -> broadcast::Receiver<Departure> {
        self.departures.subscribe()
    }

    #[must_use]
    pub fn metrics(&self) -> RegistryMetrics {
        let index = self.index.read();
        RegistryMetrics {
            active_connections: index.entries.len(),
            active_origins: index.by_origin.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
        }
    }

    /// Remove and close every connection. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut index = self.index.write();
            index.by_origin.clear();
            index.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        join_all(drained.iter().map(|entry| self.finish_removal(entry))).await;

        info!(closed = count, "Closed all connections");
        count
    }

    /// Both maps agree on membership
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let index = self.index.read();
        let indexed: usize = index.by_origin.values().map(HashSet::len).sum();
        indexed == index.entries.len()
            && index.by_origin.iter().all(|(origin, ids)| {
                !ids.is_empty()
                    && ids.iter().all(|id| {
                        index
                            .entries
                            .get(id)
                            .is_some_and(|entry| &entry.origin == origin)
                    })
            })
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CONCURRENCY)
    }
}
