//! # tessera-sync: Real-time record synchronization
//!
//! Keeps one shared, ordered list of records consistent across any number of
//! WebSocket clients, with a single authoritative server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐       WebSocket        ┌───────────────┐
//! │ Reconciler   │ ── Intent (binary) ──► │ SyncServer    │
//! │ (per client) │ ◄── Notification ───── │ (central)     │
//! └──────┬───────┘                        └───────┬───────┘
//!        │                                        │
//!        ▼                                        ▼
//! ┌──────────────┐                        ┌───────────────┐
//! │ LocalView    │                        │ RecordStore   │
//! │ (mirror)     │                        │ (authority)   │
//! └──────────────┘                        └───────┬───────┘
//!                                                 │
//!                                     ┌───────────┴─────────┐
//!                                     │ ConnectionRegistry  │
//!                                     │ (fan-out, sender    │
//!                                     │  included)          │
//!                                     └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - `Record`, `Intent`, `Notification` and their JSON codec
//! - [`store`] - authoritative ordered store
//! - [`registry`] - open connections and non-blocking broadcast
//! - [`session`] - per-connection snapshot / decode / dispatch logic
//! - [`server`] - WebSocket accept loop driving one session per connection
//! - [`connection`] - client channel with a cancellable notification stream
//! - [`reconciler`] - applies notifications to a local view
//! - [`stats`] - server counters

pub mod protocol;
pub mod store;
pub mod registry;
pub mod session;
pub mod server;
pub mod connection;
pub mod reconciler;
pub mod stats;

// Re-exports for convenience
pub use protocol::{Intent, Notification, ProtocolError, Record};
pub use store::{RecordStore, StoreError, StoreGuard};
pub use registry::{BroadcastReport, ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use session::{SessionContext, SessionError, SessionHandler, SessionState};
pub use server::{ServerConfig, ServerError, SyncServer};
pub use connection::{
    ClientConfig, ClientConnection, ClientSession, ConnectionError, IntentSender,
    NotificationStream,
};
pub use reconciler::{LocalView, Reconciler, SessionEnd, UnexpectedState};
pub use stats::ServerStats;
