//! WebSocket server implementation
//!
//! Provides a WebSocket server that listens on a configurable port, routes
//! each connection to its endpoint's registry and answers presence requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::endpoint::{Endpoint, Route};
use super::protocol::ConnectionState;
use crate::config::{ServerSettings, DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_SHUTDOWN_GRACE_SECS};
use crate::presence::{ConnectionRegistry, StatsPolicy, StatsPublisher};

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Delivery policy for `server_stats` responses
    pub policy: StatsPolicy,
    /// Announce the count on every connect and disconnect
    pub push_on_change: bool,
    /// Time allowed for the websocket handshake
    pub handshake_timeout: Duration,
    /// Time connections get to close after shutdown before being aborted
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            policy: StatsPolicy::default(),
            push_on_change: false,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }

    /// Build a configuration from the settings file
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self::new(settings.bind.clone(), settings.port)
            .with_policy(settings.policy)
            .with_push_on_change(settings.push_on_change)
            .with_handshake_timeout(settings.handshake_timeout())
            .with_shutdown_grace(settings.shutdown_grace())
    }

    pub fn with_policy(mut self, policy: StatsPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_push_on_change(mut self, push_on_change: bool) -> Self {
        self.push_on_change = push_on_change;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// One publisher per endpoint
#[derive(Clone)]
struct Publishers {
    client: Arc<StatsPublisher>,
    user: Arc<StatsPublisher>,
}

impl Publishers {
    fn new(config: &ServerConfig) -> Self {
        let make = |endpoint: Endpoint| {
            let registry = Arc::new(ConnectionRegistry::new(endpoint.label()));
            Arc::new(
                StatsPublisher::new(registry, config.policy)
                    .with_push_on_change(config.push_on_change && endpoint.announces_presence()),
            )
        };
        Self {
            client: make(Endpoint::Client),
            user: make(Endpoint::User),
        }
    }

    fn get(&self, endpoint: Endpoint) -> &Arc<StatsPublisher> {
        match endpoint {
            Endpoint::Client => &self.client,
            Endpoint::User => &self.user,
        }
    }
}

/// WebSocket server for presence clients
pub struct WebSocketServer {
    config: ServerConfig,
    publishers: Publishers,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let publishers = Publishers::new(&config);
        Self {
            config,
            publishers,
            shutdown_tx,
        }
    }

    /// Publisher serving the given endpoint
    pub fn publisher(&self, endpoint: Endpoint) -> &Arc<StatsPublisher> {
        self.publishers.get(endpoint)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.socket_addr()).await
    }

    /// Run the WebSocket server
    ///
    /// This will listen for incoming connections and handle them concurrently.
    /// The server will shut down gracefully when a shutdown signal is received.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            "WebSocket server listening on ws://{}{} and ws://{}{}",
            addr,
            Endpoint::Client.path(),
            addr,
            Endpoint::User.path()
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let publishers = self.publishers.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let handshake_timeout = self.config.handshake_timeout;

                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, publishers, shutdown_rx, handshake_timeout).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        for endpoint in Endpoint::ALL {
            let live = self.publisher(endpoint).registry().count().await;
            if live > 0 {
                info!("Closing {} live {} connections...", live, endpoint.label());
            }
        }

        // Every connection task sends its close frame and deregisters
        let grace = self.config.shutdown_grace;
        let drained = timeout(grace, async {
            while let Some(joined) = connections.join_next().await {
                if let Err(e) = joined {
                    error!("Connection task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting them",
                connections.len(),
                grace
            );
            connections.shutdown().await;
        }

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    publishers: Publishers,
    shutdown_rx: broadcast::Receiver<()>,
    handshake_timeout: Duration,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    // Upgrade to WebSocket, capturing the route from the request target
    let mut route = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        match Route::resolve(target) {
            Some(resolved) => {
                route = Some(resolved);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some(format!(
                    "no websocket endpoint at {}",
                    request.uri().path()
                )));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        }
    };
    let ws_stream = timeout(handshake_timeout, accept_hdr_async(stream, callback))
        .await
        .map_err(|_| anyhow!("handshake timed out after {:?}", handshake_timeout))??;
    let route = route.ok_or_else(|| anyhow!("handshake completed without a route"))?;

    let publisher = publishers.get(route.endpoint);
    let id = route.connection_id();
    let label = route.endpoint.label();
    let mut state = ConnectionState::Connecting;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (mut ws_sender, ws_receiver) = ws_stream.split();

    let registration = match publisher.connect(id, Some(peer_addr), outbound_tx).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!("[{}] refusing {} from {}: {}", label, id, peer_addr, e);
            let close = CloseFrame {
                code: CloseCode::Policy,
                reason: "connection id already in use".into(),
            };
            let _ = ws_sender.send(Message::Close(Some(close))).await;
            return Ok(());
        }
    };
    state = advance(state, ConnectionState::Open, label, id);
    info!(
        "[{}] connection {} open from {} ({} live)",
        label, id, peer_addr, registration.live
    );

    let result = connection_loop(
        id,
        peer_addr,
        publisher,
        ws_sender,
        ws_receiver,
        outbound_rx,
        shutdown_rx,
    )
    .await;

    publisher.disconnect(id, registration.token).await;
    advance(state, ConnectionState::Closed, label, id);
    info!("[{}] connection {} from {} closed", label, id, peer_addr);
    result
}

fn advance(
    current: ConnectionState,
    next: ConnectionState,
    label: &str,
    id: Uuid,
) -> ConnectionState {
    if current.can_transition_to(next) {
        debug!("[{}] connection {}: {} -> {}", label, id, current, next);
        next
    } else {
        warn!(
            "[{}] connection {}: ignoring transition {} -> {}",
            label, id, current, next
        );
        current
    }
}

type WsSender = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// Message handling loop for an open, registered connection
async fn connection_loop(
    id: Uuid,
    peer_addr: SocketAddr,
    publisher: &StatsPublisher,
    mut ws_sender: WsSender,
    mut ws_receiver: WsReceiver,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {}: {}", id, text);
                        publisher.on_message(id, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", id, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pong messages
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Client {} ({}) requested close", id, peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", id, e);
                        break;
                    }
                    None => {
                        debug!("Connection {} dropped by peer", id);
                        break;
                    }
                }
            }
            // Deliver frames queued through the registry
            queued = outbound_rx.recv() => {
                match queued {
                    Some(message) => ws_sender.send(message).await?,
                    None => {
                        debug!("Connection {} dropped from registry", id);
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received, closing connection {}", id);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.policy, StatsPolicy::Reply);
        assert!(!config.push_on_change);
    }

    #[test]
    fn test_server_config_from_settings() {
        let settings = Settings::from_toml(
            "[server]\nbind = \"0.0.0.0\"\nport = 8080\npolicy = \"broadcast\"\nhandshake_timeout_secs = 3\nshutdown_grace_secs = 1\n",
        )
        .unwrap();
        let config = ServerConfig::from_settings(&settings.server);
        assert_eq!(config.socket_addr(), "0.0.0.0:8080");
        assert_eq!(config.policy, StatsPolicy::Broadcast);
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn test_advance_rejects_reopen() {
        let id = Uuid::new_v4();
        let state = advance(ConnectionState::Connecting, ConnectionState::Open, "test", id);
        assert_eq!(state, ConnectionState::Open);
        let state = advance(state, ConnectionState::Closed, "test", id);
        assert_eq!(state, ConnectionState::Closed);
        let state = advance(state, ConnectionState::Open, "test", id);
        assert_eq!(state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_endpoints_have_separate_registries() {
        let server = WebSocketServer::new(ServerConfig::new("127.0.0.1".to_string(), 0));
        let client = server.publisher(Endpoint::Client);
        let user = server.publisher(Endpoint::User);

        let (tx, _rx) = mpsc::unbounded_channel();
        client.connect(Uuid::new_v4(), None, tx).await.unwrap();

        assert_eq!(client.registry().count().await, 1);
        assert_eq!(user.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_push_on_change_scoped_to_client_endpoint() {
        let server = WebSocketServer::new(
            ServerConfig::new("127.0.0.1".to_string(), 0).with_push_on_change(true),
        );

        for endpoint in Endpoint::ALL {
            let publisher = server.publisher(endpoint);
            let (tx, mut rx) = mpsc::unbounded_channel();
            publisher.connect(Uuid::new_v4(), None, tx).await.unwrap();
            assert_eq!(rx.try_recv().is_ok(), endpoint.announces_presence(), "{}", endpoint.label());
        }
    }
}
