//! Client socket session
//!
//! Owns one websocket connection to the presence server. Outbound frames are
//! queued to a background I/O task; inbound frames land in a [`LatestFrame`]
//! mailbox that observers subscribe to. There is no reconnect: once closed, a
//! session stays closed and the caller connects again if it wants to.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::mailbox::LatestFrame;
use crate::server::{Action, ConnectionState, Frame, ProtocolError, ServerStats};

/// Default time allowed to establish a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur during client session operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Session is not open")]
    NotOpen,

    #[error("Session closed while waiting for {0}")]
    Closed(Action),

    #[error("Timed out waiting for {0}")]
    ResponseTimeout(Action),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Options for establishing a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single persistent connection to the presence server
pub struct ClientSession {
    endpoint: String,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::UnboundedSender<Message>,
    latest: Arc<LatestFrame>,
}

impl ClientSession {
    /// Connect with default options
    pub async fn connect(endpoint: &str) -> ClientResult<Self> {
        Self::connect_with(endpoint, SessionOptions::default()).await
    }

    /// Connect to `endpoint`, e.g. `ws://127.0.0.1:9000/ws/client`
    pub async fn connect_with(endpoint: &str, options: SessionOptions) -> ClientResult<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state);

        let ws_stream = match timeout(options.connect_timeout, connect_async(endpoint)).await {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => {
                transition(&state, ConnectionState::Closed);
                return Err(ClientError::Connect(e));
            }
            Err(_) => {
                transition(&state, ConnectionState::Closed);
                return Err(ClientError::ConnectTimeout(endpoint.to_string()));
            }
        };

        transition(&state, ConnectionState::Open);
        info!("Connected to {}", endpoint);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let latest = Arc::new(LatestFrame::new());
        tokio::spawn(run_io(
            ws_stream,
            outbound_rx,
            Arc::clone(&latest),
            Arc::clone(&state),
        ));

        Ok(Self {
            endpoint: endpoint.to_string(),
            state,
            outbound,
            latest,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the session is closed
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    /// Send a pre-serialized text frame
    ///
    /// Dropped silently if the session is not open.
    pub fn send(&self, payload: impl Into<String>) {
        if !self.is_open() {
            debug!("Session to {} is {}, dropping frame", self.endpoint, self.state());
            return;
        }
        if self.outbound.send(Message::Text(payload.into())).is_err() {
            debug!("I/O task for {} is gone, dropping frame", self.endpoint);
        }
    }

    /// Serialize and send a frame
    pub fn send_frame(&self, frame: &Frame) {
        match frame.to_json() {
            Ok(json) => self.send(json),
            Err(e) => warn!("Failed to encode {} frame: {}", frame.action, e),
        }
    }

    /// Most recent inbound frame
    pub fn latest(&self) -> Option<Frame> {
        self.latest.latest()
    }

    /// Receiver notified whenever a frame arrives
    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.latest.subscribe()
    }

    /// Ask for the active user count and wait for the answer
    pub async fn request_stats(&self, wait: Duration) -> ClientResult<ServerStats> {
        let frame = self.request(Action::ServerStats, wait).await?;
        Ok(ServerStats::from_frame(&frame)?)
    }

    /// Send a request and wait for the next frame carrying the same action
    ///
    /// Under latest-value semantics a response can be overwritten by a later
    /// frame before it is observed; the wait then continues until the next
    /// matching frame or the deadline.
    pub async fn request(&self, action: Action, wait: Duration) -> ClientResult<Frame> {
        if !self.is_open() {
            return Err(ClientError::NotOpen);
        }

        let mut frames = self.subscribe();
        frames.borrow_and_update();
        let mut state = self.watch_state();

        self.send_frame(&Frame::request(action));

        let response = async {
            loop {
                tokio::select! {
                    changed = frames.changed() => {
                        if changed.is_err() {
                            return Err(ClientError::Closed(action));
                        }
                        let frame = frames.borrow_and_update().clone();
                        if let Some(frame) = frame.filter(|f| f.is(action)) {
                            return Ok(frame);
                        }
                    }
                    _ = state.wait_for(|s| *s == ConnectionState::Closed) => {
                        return Err(ClientError::Closed(action));
                    }
                }
            }
        };

        timeout(wait, response)
            .await
            .map_err(|_| ClientError::ResponseTimeout(action))?
    }

    /// Close the connection
    pub fn close(&self) {
        if self.is_open() {
            let _ = self.outbound.send(Message::Close(None));
            transition(&self.state, ConnectionState::Closed);
        }
    }
}

fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            debug!("Session {} -> {}", current, next);
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Background task pumping frames between the socket and the session
async fn run_io(
    ws_stream: ClientStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    latest: Arc<LatestFrame>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                        Ok(frame) => {
                            latest.publish(frame);
                        }
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Server closed the session: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            queued = outbound_rx.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(e) = ws_sender.send(message).await {
                            warn!("Failed to send frame: {}", e);
                            break;
                        }
                    }
                    None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    transition(&state, ConnectionState::Closed);
    debug!("Session I/O task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind and drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = ClientSession::connect(&format!("ws://{}/ws/client", addr)).await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Accepts TCP but never answers the upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let options = SessionOptions {
            connect_timeout: Duration::from_millis(100),
        };
        let result = ClientSession::connect_with(&format!("ws://{}/ws/client", addr), options).await;
        assert!(matches!(result, Err(ClientError::ConnectTimeout(_))));
    }

    #[test]
    fn test_transition_is_one_way() {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        assert!(transition(&state, ConnectionState::Open));
        assert!(transition(&state, ConnectionState::Closed));
        assert!(!transition(&state, ConnectionState::Open));
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }
}
