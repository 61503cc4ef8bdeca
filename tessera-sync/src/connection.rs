//! Client connection manager.
//!
//! Provides:
//! - Channel lifecycle (open, close, replace within a [`ClientSession`])
//! - Intent sending that can be fired from any task ([`IntentSender`])
//! - A lazy, cancellable stream of decoded [`Notification`]s
//!
//! The write half lives behind a mutex shared by every sender clone. The
//! read half is owned by the [`NotificationStream`], which decodes only when
//! polled and checks the closed flag before every decode. Dropping the stream
//! releases the channel.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::{BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{Intent, Notification, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Channel could not be established or is in an invalid state.
    #[error("Connection error: {0}")]
    Connection(String),
    /// I/O failure on an established channel.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Payload did not match the notification shape.
    #[error("Decoding error: {0}")]
    Decoding(#[source] ProtocolError),
    /// Local serialization failure.
    #[error("Encoding error: {0}")]
    Encoding(#[source] ProtocolError),
    /// Remote went away without a normal close.
    #[error("Disconnected")]
    Disconnected,
    /// Channel was closed normally.
    #[error("Connection closed")]
    Closed,
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Full WebSocket URL of the channel endpoint
    pub url: String,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("ws://127.0.0.1:8080/channel")
    }
}

/// State shared by the senders and the notification stream of one channel.
struct Shared {
    sink: Mutex<SplitSink<WsStream, Message>>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and send a close frame in the background.
    ///
    /// Pending sends are not awaited: they observe the flag once they hold
    /// the sink and fail with `Closed`.
    fn close(self: &Arc<Self>, code: CloseCode) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.clone();
        runtime.spawn(async move {
            let mut sink = shared.sink.lock().await;
            let frame = CloseFrame {
                code,
                reason: "".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            let _ = sink.close().await;
        });
    }
}

/// Cloneable handle for sending intents on one channel.
#[derive(Clone)]
pub struct IntentSender {
    shared: Arc<Shared>,
}

impl IntentSender {
    /// Serialize `intent` and write it as one binary frame.
    pub async fn send(&self, intent: &Intent) -> Result<(), ConnectionError> {
        if self.shared.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let payload = intent.encode().map_err(ConnectionError::Encoding)?;

        let mut sink = self.shared.sink.lock().await;
        if self.shared.is_closed() {
            return Err(ConnectionError::Closed);
        }
        sink.send(Message::Binary(payload.into()))
            .await
            .map_err(classify_error)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// One duplex channel to the server.
pub struct ClientConnection {
    sender: IntentSender,
    source: Option<SplitStream<WsStream>>,
}

impl ClientConnection {
    /// Connect to `url` and complete the WebSocket handshake.
    pub async fn open(url: &str) -> Result<Self, ConnectionError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectionError::Connection(e.to_string()))?;
        let (sink, source) = ws_stream.split();
        log::info!("Connected to {url}");

        Ok(Self {
            sender: IntentSender {
                shared: Arc::new(Shared {
                    sink: Mutex::new(sink),
                    closed: AtomicBool::new(false),
                }),
            },
            source: Some(source),
        })
    }

    /// Send one intent.
    pub async fn send(&self, intent: &Intent) -> Result<(), ConnectionError> {
        self.sender.send(intent).await
    }

    /// A sender that can outlive this borrow, for fire-and-forget tasks.
    pub fn sender(&self) -> IntentSender {
        self.sender.clone()
    }

    /// Take the notification stream. Only one stream exists per channel.
    pub fn receive(&mut self) -> Result<NotificationStream, ConnectionError> {
        let source = self
            .source
            .take()
            .ok_or_else(|| ConnectionError::Connection("notification stream already taken".into()))?;
        Ok(NotificationStream::new(source, self.sender.shared.clone()))
    }

    /// Close gracefully without waiting for pending sends.
    pub fn close(&self) {
        self.sender.shared.close(CloseCode::Normal);
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.sender.shared.close(CloseCode::Away);
    }
}

/// Unbounded, order-preserving stream of notifications from one channel.
///
/// Yields `None` after a normal remote close. Abnormal termination yields
/// exactly one `Err` and then `None`. Once the stream has ended, or has been
/// dropped, the channel is closed and sends fail with `Closed`.
pub struct NotificationStream {
    inner: BoxStream<'static, Result<Notification, ConnectionError>>,
    shared: Arc<Shared>,
}

struct ReadState {
    source: SplitStream<WsStream>,
    shared: Arc<Shared>,
    done: bool,
}

impl NotificationStream {
    fn new(source: SplitStream<WsStream>, shared: Arc<Shared>) -> Self {
        let state = ReadState {
            source,
            shared: shared.clone(),
            done: false,
        };
        let inner = futures_util::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            match state.next_notification().await {
                Some(Ok(notification)) => Some((Ok(notification), state)),
                Some(Err(e)) => {
                    state.done = true;
                    state.shared.close(CloseCode::Normal);
                    Some((Err(e), state))
                }
                None => {
                    state.shared.close(CloseCode::Normal);
                    None
                }
            }
        })
        .boxed();
        Self { inner, shared }
    }
}

impl ReadState {
    async fn next_notification(&mut self) -> Option<Result<Notification, ConnectionError>> {
        loop {
            if self.shared.is_closed() {
                return Some(Err(ConnectionError::Closed));
            }
            let msg = self.source.next().await;
            // Cancelled while waiting: do not decode.
            if self.shared.is_closed() {
                return Some(Err(ConnectionError::Closed));
            }

            match msg {
                Some(Ok(Message::Binary(data))) => {
                    return Some(Notification::decode(&data).map_err(|e| {
                        log::warn!("Closing channel on undecodable notification: {e}");
                        self.shared.close(CloseCode::Protocol);
                        ConnectionError::Decoding(e)
                    }));
                }
                Some(Ok(Message::Text(_))) => {
                    log::warn!("Did not expect to receive a text frame, closing channel");
                    self.shared.close(CloseCode::Unsupported);
                    return Some(Err(ConnectionError::Decoding(ProtocolError::UnexpectedFrame(
                        "text",
                    ))));
                }
                Some(Ok(Message::Close(frame))) => return classify_close(frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(classify_error(e))),
                None => return Some(Err(ConnectionError::Disconnected)),
            }
        }
    }
}

impl Stream for NotificationStream {
    type Item = Result<Notification, ConnectionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.shared.close(CloseCode::Normal);
    }
}

/// A remote close frame ends the stream normally or carries an error.
fn classify_close(
    frame: Option<CloseFrame>,
) -> Option<Result<Notification, ConnectionError>> {
    let code = frame.map(|f| f.code);
    match code {
        None | Some(CloseCode::Normal) => None,
        Some(CloseCode::Away) => Some(Err(ConnectionError::Disconnected)),
        Some(other) => Some(Err(ConnectionError::Transport(format!(
            "closed by server with code {}",
            u16::from(other)
        )))),
    }
}

fn classify_error(e: tungstenite::Error) -> ConnectionError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::Closed
        }
        tungstenite::Error::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
            ConnectionError::Disconnected
        }
        tungstenite::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => ConnectionError::Disconnected,
            _ => ConnectionError::Transport(io.to_string()),
        },
        other => ConnectionError::Transport(other.to_string()),
    }
}

/// One logical client session: at most one live channel at a time.
pub struct ClientSession {
    config: ClientConfig,
    current: Option<ClientConnection>,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Close the current channel, if any, then open a fresh one.
    pub async fn reconnect(&mut self) -> Result<&mut ClientConnection, ConnectionError> {
        if let Some(previous) = self.current.take() {
            previous.close();
        }
        let connection = ClientConnection::open(&self.config.url).await?;
        Ok(self.current.insert(connection))
    }

    pub fn current(&self) -> Option<&ClientConnection> {
        self.current.as_ref()
    }

    /// Close and forget the current channel.
    pub fn close(&mut self) {
        if let Some(connection) = self.current.take() {
            connection.close();
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        assert_eq!(ClientConfig::default().url, "ws://127.0.0.1:8080/channel");
        assert_eq!(ClientConfig::new("ws://x/y").url, "ws://x/y");
    }

    #[test]
    fn test_classify_close_codes() {
        assert!(classify_close(None).is_none());
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        assert!(classify_close(Some(normal)).is_none());

        let away = CloseFrame {
            code: CloseCode::Away,
            reason: "".into(),
        };
        assert!(matches!(
            classify_close(Some(away)),
            Some(Err(ConnectionError::Disconnected))
        ));

        let protocol = CloseFrame {
            code: CloseCode::Protocol,
            reason: "bad".into(),
        };
        assert!(matches!(
            classify_close(Some(protocol)),
            Some(Err(ConnectionError::Transport(_)))
        ));
    }

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            classify_error(tungstenite::Error::ConnectionClosed),
            ConnectionError::Closed
        ));
        assert!(matches!(
            classify_error(tungstenite::Error::AlreadyClosed),
            ConnectionError::Closed
        ));
        assert!(matches!(
            classify_error(tungstenite::Error::Protocol(
                WsProtocolError::ResetWithoutClosingHandshake
            )),
            ConnectionError::Disconnected
        ));
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(matches!(
            classify_error(tungstenite::Error::Io(reset)),
            ConnectionError::Disconnected
        ));
        let other = std::io::Error::other("disk on fire");
        assert!(matches!(
            classify_error(tungstenite::Error::Io(other)),
            ConnectionError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_open_unreachable_is_connection_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = ClientConnection::open(&format!("ws://127.0.0.1:{port}/channel")).await;
        assert!(matches!(result, Err(ConnectionError::Connection(_))));
    }

    #[tokio::test]
    async fn test_session_starts_without_connection() {
        let session = ClientSession::new(ClientConfig::default());
        assert!(session.current().is_none());
        assert_eq!(session.config().url, "ws://127.0.0.1:8080/channel");
    }
}
