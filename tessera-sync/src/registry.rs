//! Connection registry and broadcast fan-out.
//!
//! Each open channel is represented by a [`ConnectionHandle`]: its id plus
//! the sending side of that connection's bounded outbound queue. The
//! registry never owns a socket. The connection task drains the queue and
//! notices when the registry drops the last sender.
//!
//! Broadcast takes a snapshot of the members and `try_send`s one
//! pre-encoded frame to each. A full or closed queue counts as a failed
//! delivery; failed handles are removed and the rest still receive the frame.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Bytes;

/// Identity of one accepted connection. Unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Outbound queue is at capacity (slow reader).
    Full,
    /// Connection task has gone away.
    Closed,
}

/// Non-owning send access to one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end the connection task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::next(),
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: Bytes) -> Result<(), SendFailure> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the frame was queued for.
    pub delivered: usize,
    /// Recipients that failed and were removed.
    pub dropped: Vec<ConnectionId>,
}

/// The set of currently open connections.
pub struct ConnectionRegistry {
    members: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a handle. Re-adding the same id replaces the previous entry.
    pub async fn add(&self, handle: ConnectionHandle) {
        let mut members = self.members.write().await;
        members.insert(handle.id, handle);
    }

    /// Remove by identity. Absent ids are a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.members.write().await.remove(&id)
    }

    /// Members at this instant.
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Queue `frame` for every current member.
    ///
    /// Never waits on a recipient. Members whose queue is full or closed are
    /// removed; delivery to everyone else proceeds.
    pub async fn broadcast(&self, frame: Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for handle in self.snapshot().await {
            match handle.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    log::warn!("Dropping {} from registry: outbound {failure:?}", handle.id);
                    report.dropped.push(handle.id);
                }
            }
        }

        if !report.dropped.is_empty() {
            let mut members = self.members.write().await;
            for id in &report.dropped {
                members.remove(id);
            }
        }

        report
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
