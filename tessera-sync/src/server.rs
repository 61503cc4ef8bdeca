//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── SessionHandler A ──┐
//!             ├── /channel ────┤                      ├── RecordStore (Mutex)
//! Client B ──┘                 └── SessionHandler B ──┤
//!                                                     └── ConnectionRegistry
//!                                                             │ try_send
//!                                          ┌──────────────────┼──────────────┐
//!                                          ▼                  ▼              ▼
//!                                      outbound A         outbound B      ...
//! ```
//!
//! Each accepted connection gets one task running a `select!` loop over the
//! socket's inbound frames and that connection's outbound queue. Only binary
//! frames carry intents; a text frame or an undecodable payload closes the
//! offending connection and nothing else.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::registry::ConnectionRegistry;
use crate::session::{SessionContext, SessionError, SessionHandler};
use crate::stats::ServerStats;
use crate::store::RecordStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path the WebSocket endpoint is served on
    pub channel_path: String,
    /// Frames buffered per connection before it is dropped as too slow
    pub outbound_capacity: usize,
    /// Texts the store is seeded with at startup, in order
    pub seed: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            channel_path: "/channel".to_string(),
            outbound_capacity: 256,
            seed: (1..=5).map(|i| format!("Item {i}")).collect(),
        }
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// The sync server. Owns the store and registry for its lifetime.
pub struct SyncServer {
    config: ServerConfig,
    ctx: SessionContext,
}

impl SyncServer {
    /// Create a server whose store is seeded from `config.seed`.
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(RecordStore::seeded(config.seed.iter().cloned()));
        Self::with_store(config, store)
    }

    /// Create a server around an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<RecordStore>) -> Self {
        let ctx = SessionContext::new(store, Arc::new(ConnectionRegistry::new()));
        Self { config, ctx }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        log::info!(
            "Sync server listening on ws://{local}{} ({} records)",
            self.config.channel_path,
            self.ctx.store.len().await
        );

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Drive one connection from handshake to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: SessionContext,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let channel_path = config.channel_path;
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == channel_path {
                Ok(resp)
            } else {
                let mut err = ErrorResponse::new(Some(format!("No channel at {}", req.uri().path())));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path)
            .await
            .map_err(ServerError::Handshake)?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (mut session, mut outbound) = SessionHandler::new(ctx, config.outbound_capacity);
        log::info!("WebSocket connection {} established from {addr}", session.id());

        if let Err(e) = session.open().await {
            session.close().await;
            return Err(e.into());
        }

        let result = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Err(e) = session.handle_frame(&data).await {
                                log::warn!("{}: closing on undecodable intent from {addr}: {e}", session.id());
                                break close(&mut ws_sender, CloseCode::Protocol, "undecodable intent").await;
                            }
                        }

                        Some(Ok(Message::Text(_))) => {
                            let e = session.reject_frame("text");
                            log::warn!("{}: closing, {e} from {addr}", session.id());
                            break close(&mut ws_sender, CloseCode::Unsupported, "binary frames only").await;
                        }

                        Some(Ok(Message::Close(frame))) => {
                            log::info!("{}: closed by {addr} ({frame:?})", session.id());
                            break Ok(());
                        }

                        None => {
                            log::info!("{}: stream ended from {addr}", session.id());
                            break Ok(());
                        }

                        Some(Err(e)) => {
                            log::error!("{}: WebSocket error from {addr}: {e}", session.id());
                            break Err(e.into());
                        }

                        // Ping/Pong are answered by tungstenite itself.
                        Some(Ok(_)) => {}
                    }
                }

                // Outgoing notification
                frame = outbound.recv() => {
                    match frame {
                        Some(data) => {
                            if let Err(e) = ws_sender.send(Message::Binary(data)).await {
                                log::error!("{}: send to {addr} failed: {e}", session.id());
                                break Err(e.into());
                            }
                        }
                        None => {
                            // The registry dropped our handle: the queue overflowed.
                            log::warn!("{}: outbound queue overflowed, dropping {addr}", session.id());
                            break close(&mut ws_sender, CloseCode::Policy, "too slow").await;
                        }
                    }
                }
            }
        };

        session.close().await;
        let _ = ws_sender.close().await;
        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.ctx.stats.snapshot()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The authoritative store.
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.ctx.store
    }

    /// The live connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }
}

async fn close<S>(ws_sender: &mut S, code: CloseCode, reason: &'static str) -> Result<(), ServerError>
where
    S: SinkExt<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_sender.send(Message::Close(Some(frame))).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.channel_path, "/channel");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(
            config.seed,
            vec!["Item 1", "Item 2", "Item 3", "Item 4", "Item 5"]
        );
    }

    #[tokio::test]
    async fn test_server_seeds_store() {
        let server = SyncServer::with_defaults();
        let texts: Vec<String> = server.store().list().await.into_iter().map(|r| r.text).collect();
        assert_eq!(texts, ServerConfig::default().seed);
        assert_eq!(server.bind_addr(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_server_with_injected_store() {
        let store = Arc::new(RecordStore::seeded(["only"]));
        let server = SyncServer::with_store(ServerConfig::default(), store.clone());
        assert!(Arc::ptr_eq(server.store(), &store));
        assert_eq!(server.store().len().await, 1);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats(), ServerStats::default());
        assert!(server.registry().is_empty().await);
    }
}
