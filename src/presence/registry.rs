//! Live-connection registry
//!
//! Maintains the set of open connections for one endpoint and delivers stats
//! frames to them. Every mutation and every stats delivery runs under the
//! write lock, so the count a frame carries is the size of the set at the
//! moment it was queued.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::server::{Frame, ServerStats};

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(Uuid),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Identifies one registration of a connection id
///
/// Ids can be requested by clients and reused once the previous holder is
/// gone; the token tells registrations of the same id apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionToken(u64);

/// Outcome of a successful [`ConnectionRegistry::add`]
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub token: ConnectionToken,
    /// Live connections right after the insert
    pub live: usize,
}

/// Outcome of a single-connection delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame queued
    Delivered,
    /// No such connection, or the frame could not be encoded
    NotSent,
    /// The connection's task had gone away and it was removed
    Removed,
}

/// Outbound half of a live connection
///
/// The connection task owns the socket; the registry only holds the sender
/// feeding that task, so delivering a frame never waits on socket I/O.
struct ConnectionHandle {
    token: ConnectionToken,
    peer_addr: Option<SocketAddr>,
    connected_at: Instant,
    tx: mpsc::UnboundedSender<Message>,
}

/// Registry of live connections for a single endpoint
pub struct ConnectionRegistry {
    /// Endpoint label used in log lines
    label: &'static str,
    next_token: AtomicU64,
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            next_token: AtomicU64::new(0),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Register a connection
    ///
    /// An id that is already live is refused and the existing entry is left
    /// untouched.
    pub async fn add(
        &self,
        id: Uuid,
        peer_addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<Message>,
    ) -> RegistryResult<Registration> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        let token = ConnectionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        connections.insert(
            id,
            ConnectionHandle {
                token,
                peer_addr,
                connected_at: Instant::now(),
                tx,
            },
        );
        let live = connections.len();
        info!("[{}] added connection {} ({} live)", self.label, id, live);
        Ok(Registration { token, live })
    }

    /// Deregister a connection, returning whether it was present
    ///
    /// Only the registration identified by `token` is removed; a newer holder
    /// of the same id is left alone.
    pub async fn remove(&self, id: Uuid, token: ConnectionToken) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&id) {
            Some(handle) if handle.token == token => {
                self.evict(&mut connections, id, "closed");
                true
            }
            _ => false,
        }
    }

    /// Number of live connections
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Check if a connection is live
    pub async fn contains(&self, id: Uuid) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Send the current stats to one connection
    ///
    /// A connection whose task has gone away is removed from the live set; the
    /// failure is only logged.
    pub async fn send_stats_to(&self, id: Uuid) -> Delivery {
        let mut connections = self.connections.write().await;
        let frame = Frame::server_stats(ServerStats::new(connections.len()));
        let Some(message) = self.encode(&frame) else {
            return Delivery::NotSent;
        };

        let Some(handle) = connections.get(&id) else {
            debug!("[{}] send to unknown connection {}", self.label, id);
            return Delivery::NotSent;
        };
        if handle.tx.send(message).is_ok() {
            return Delivery::Delivered;
        }

        self.evict(&mut connections, id, "gone");
        Delivery::Removed
    }

    /// Send the current stats to every live connection
    ///
    /// Dead connections are removed before the count is taken. If one dies
    /// during the sweep, the survivors are sent the corrected count, so the
    /// last frame each of them gets always matches the live set. Returns the
    /// number of connections the final frame was queued for.
    pub async fn broadcast_stats(&self) -> usize {
        let mut connections = self.connections.write().await;

        loop {
            let dead: Vec<Uuid> = connections
                .iter()
                .filter(|(_, handle)| handle.tx.is_closed())
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                self.evict(&mut connections, id, "gone");
            }

            let frame = Frame::server_stats(ServerStats::new(connections.len()));
            let Some(message) = self.encode(&frame) else {
                return 0;
            };

            let mut delivered = 0;
            for handle in connections.values() {
                if handle.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }

            if delivered == connections.len() {
                debug!("[{}] broadcast stats to {} connections", self.label, delivered);
                return delivered;
            }
        }
    }

    fn evict(&self, connections: &mut HashMap<Uuid, ConnectionHandle>, id: Uuid, reason: &str) {
        let Some(handle) = connections.remove(&id) else {
            return;
        };
        let peer = handle
            .peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "local".to_string());
        let message = format!(
            "[{}] removed connection {} from {} after {:?} ({}, {} live)",
            self.label,
            id,
            peer,
            handle.connected_at.elapsed(),
            reason,
            connections.len()
        );
        if reason == "gone" {
            warn!("{}", message);
        } else {
            info!("{}", message);
        }
    }

    fn encode(&self, frame: &Frame) -> Option<Message> {
        match frame.to_json() {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                error!("[{}] failed to encode {} frame: {}", self.label, frame.action, e);
                None
            }
        }
    }
}
