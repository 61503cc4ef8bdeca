//! Client-side reconciliation of notifications into a local view.
//!
//! [`LocalView::apply`] is the pure state transition. [`Reconciler`] wires it
//! to a [`ClientSession`]: one spawned task consumes the notification stream
//! and publishes every change through a `watch` channel, while intents are
//! sent independently of that task.
//!
//! Reconnecting is always explicit. When the stream ends the task finishes
//! and the view is left as it was until the next `connect()`.

use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::{
    ClientConfig, ClientSession, ConnectionError, IntentSender, NotificationStream,
};
use crate::protocol::{Intent, Notification, Record};

/// A notification referenced state the view did not expect.
///
/// Never fatal: the view is left unchanged and the next snapshot corrects
/// any drift.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnexpectedState {
    /// The server never reuses an id, so an `Added` for a present id is a
    /// protocol violation. The copy is not appended, which keeps the view
    /// unique by id like the store it mirrors.
    #[error("Added record {0} is already present")]
    DuplicateAdd(Uuid),
    #[error("Expected updated record {0} to exist")]
    MissingUpdate(Uuid),
    #[error("Expected deleted record {0} to exist")]
    MissingDelete(Uuid),
}

/// Ordered local mirror of the server's records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalView {
    records: Vec<Record>,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Apply one notification.
    pub fn apply(&mut self, notification: Notification) -> Result<(), UnexpectedState> {
        match notification {
            Notification::Snapshot { records } => {
                self.records = records;
            }
            Notification::Added { record } => {
                if self.position(record.id).is_some() {
                    return Err(UnexpectedState::DuplicateAdd(record.id));
                }
                self.records.push(record);
            }
            Notification::Updated { record } => {
                let index = self
                    .position(record.id)
                    .ok_or(UnexpectedState::MissingUpdate(record.id))?;
                self.records[index] = record;
            }
            Notification::Deleted { record } => {
                let index = self
                    .position(record.id)
                    .ok_or(UnexpectedState::MissingDelete(record.id))?;
                self.records.remove(index);
            }
        }
        Ok(())
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }
}

/// How a reconciliation session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Server closed the channel normally.
    Graceful,
    /// Stream terminated with an error.
    Failed(ConnectionError),
    /// Receive loop was cancelled before it finished.
    Cancelled,
}

/// Drives a view from a session's notification stream.
pub struct Reconciler {
    session: ClientSession,
    view: Arc<watch::Sender<LocalView>>,
    task: Option<JoinHandle<SessionEnd>>,
}

impl Reconciler {
    pub fn new(config: ClientConfig) -> Self {
        let (view, _) = watch::channel(LocalView::new());
        Self {
            session: ClientSession::new(config),
            view: Arc::new(view),
            task: None,
        }
    }

    /// Observe the view. Every applied notification marks it changed.
    pub fn subscribe(&self) -> watch::Receiver<LocalView> {
        self.view.subscribe()
    }

    /// Current records, in order.
    pub fn records(&self) -> Vec<Record> {
        self.view.borrow().records().to_vec()
    }

    /// Start a fresh session, replacing any previous one.
    ///
    /// Cancels the running receive loop, closes the old channel, discards the
    /// local view and opens a new channel whose first notification is a
    /// snapshot.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.view.send_modify(LocalView::clear);

        let connection = self.session.reconnect().await?;
        let stream = connection.receive()?;
        self.task = Some(tokio::spawn(reconcile(stream, self.view.clone())));
        Ok(())
    }

    /// Cancel the receive loop and release the channel.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.session.close();
    }

    /// Wait for the current receive loop to end.
    ///
    /// Returns `None` if no session has been started since the last
    /// `finished()` or `disconnect()`.
    pub async fn finished(&mut self) -> Option<SessionEnd> {
        let task = self.task.take()?;
        Some(task.await.unwrap_or(SessionEnd::Cancelled))
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// A sender for the live channel.
    pub fn sender(&self) -> Result<IntentSender, ConnectionError> {
        self.session
            .current()
            .map(|c| c.sender())
            .ok_or_else(|| ConnectionError::Connection("no open session".into()))
    }

    pub async fn add(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.send(Intent::add(text)).await
    }

    pub async fn update(&self, id: Uuid, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.send(Intent::update(id, text)).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ConnectionError> {
        self.send(Intent::delete(id)).await
    }

    async fn send(&self, intent: Intent) -> Result<(), ConnectionError> {
        self.sender()?.send(&intent).await
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn reconcile(mut stream: NotificationStream, view: Arc<watch::Sender<LocalView>>) -> SessionEnd {
    while let Some(item) = stream.next().await {
        let notification = match item {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Error receiving notifications: {e}");
                return SessionEnd::Failed(e);
            }
        };
        let kind = notification.kind();
        let mut unexpected = None;
        view.send_if_modified(|local| match local.apply(notification) {
            Ok(()) => true,
            Err(e) => {
                unexpected = Some(e);
                false
            }
        });
        match unexpected {
            Some(e) => log::warn!("Unexpected state applying {kind}: {e}"),
            None => log::trace!("Applied {kind}"),
        }
    }
    log::info!("Notification stream ended");
    SessionEnd::Graceful
}
