//! Per-connection session logic, independent of the socket.
//!
//! ```text
//! Connecting ──open()──► Open ──close()/protocol error──► Closed
//!                         │
//!                         └─ handle_frame(): decode Intent
//!                              ├─ Add    → store.add    → Added
//!                              ├─ Update → store.set    → Updated | (dropped)
//!                              └─ Delete → store.delete → Deleted | (dropped)
//! ```
//!
//! Ordering: `open()` enqueues the snapshot and registers the handle while
//! holding the store lock, and every mutation enqueues its notification to
//! the registry before releasing that same lock. A connection therefore sees
//! its snapshot first and then exactly the mutations committed after it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Bytes;

use crate::protocol::{Intent, Notification, ProtocolError};
use crate::registry::{BroadcastReport, ConnectionHandle, ConnectionId, ConnectionRegistry, SendFailure};
use crate::stats::StatsCounters;
use crate::store::{RecordStore, StoreError};

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Session errors. Any of these ends the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Could not queue snapshot: outbound {0:?}")]
    Snapshot(SendFailure),
    #[error("Session is {0:?}, not open")]
    NotOpen(SessionState),
}

/// Shared server state a session operates on.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<RecordStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub stats: Arc<StatsCounters>,
}

impl SessionContext {
    pub fn new(store: Arc<RecordStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            registry,
            stats: Arc::new(StatsCounters::new()),
        }
    }
}

/// One instance per accepted connection.
pub struct SessionHandler {
    id: ConnectionId,
    state: SessionState,
    /// Held until `open()` moves it into the registry.
    handle: Option<ConnectionHandle>,
    ctx: SessionContext,
}

impl SessionHandler {
    /// Create a session and the outbound queue its connection task drains.
    pub fn new(ctx: SessionContext, outbound_capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (handle, rx) = ConnectionHandle::channel(outbound_capacity);
        let session = Self {
            id: handle.id(),
            state: SessionState::Connecting,
            handle: Some(handle),
            ctx,
        };
        (session, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Queue the snapshot for this connection only, then register it.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        let handle = match (self.state, self.handle.take()) {
            (SessionState::Connecting, Some(handle)) => handle,
            (state, handle) => {
                self.handle = handle;
                return Err(SessionError::NotOpen(state));
            }
        };

        let store = self.ctx.store.lock().await;
        let snapshot = Notification::Snapshot {
            records: store.list(),
        };
        let frame = Bytes::from(snapshot.encode()?);
        handle.try_send(frame).map_err(SessionError::Snapshot)?;
        self.ctx.registry.add(handle).await;
        drop(store);

        self.state = SessionState::Open;
        self.ctx.stats.connection_opened();
        log::info!("{} open", self.id);
        Ok(())
    }

    /// Decode one inbound binary payload and apply it.
    ///
    /// Returns the notification that was broadcast, or `None` if the intent
    /// targeted a record that no longer exists. A decode error leaves the
    /// store untouched; the caller is expected to close the connection.
    pub async fn handle_frame(&mut self, payload: &[u8]) -> Result<Option<Notification>, SessionError> {
        if self.state != SessionState::Open {
            return Err(SessionError::NotOpen(self.state));
        }
        let intent = match Intent::decode(payload) {
            Ok(intent) => intent,
            Err(e) => {
                self.ctx.stats.protocol_violation();
                return Err(e.into());
            }
        };
        Ok(self.apply(intent).await.map(|(notification, _)| notification))
    }

    /// Record a protocol violation that did not reach the decoder.
    pub fn reject_frame(&self, kind: &'static str) -> SessionError {
        self.ctx.stats.protocol_violation();
        SessionError::Protocol(ProtocolError::UnexpectedFrame(kind))
    }

    /// Mutate the store and fan the resulting notification out to every
    /// registered connection, this one included.
    pub async fn apply(&self, intent: Intent) -> Option<(Notification, BroadcastReport)> {
        let mut store = self.ctx.store.lock().await;

        let outcome = match intent {
            Intent::Add { text } => Ok(Notification::Added {
                record: store.add(text),
            }),
            Intent::Update { id, text } => store
                .set(id, text)
                .map(|record| Notification::Updated { record }),
            Intent::Delete { id } => store
                .delete(id)
                .map(|record| Notification::Deleted { record }),
        };

        let notification = match outcome {
            Ok(n) => n,
            Err(StoreError::NotFound(id)) => {
                log::debug!("{}: target {id} not found, intent dropped", self.id);
                self.ctx.stats.intent_dropped();
                return None;
            }
        };
        self.ctx.stats.intent_applied();

        let frame = match notification.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                log::error!("{}: failed to encode {} notification: {e}", self.id, notification.kind());
                return None;
            }
        };

        let report = self.ctx.registry.broadcast(frame).await;
        drop(store);

        self.ctx
            .stats
            .fanned_out(report.delivered, report.dropped.len());
        log::debug!(
            "{}: {} broadcast to {} connection(s)",
            self.id,
            notification.kind(),
            report.delivered
        );
        Some((notification, report))
    }

    /// Deregister. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_open = self.state == SessionState::Open;
        self.state = SessionState::Closed;
        self.handle = None;
        self.ctx.registry.remove(self.id).await;
        if was_open {
            self.ctx.stats.connection_closed();
            log::info!("{} closed", self.id);
        }
    }
}
