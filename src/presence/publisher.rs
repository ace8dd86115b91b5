//! Aggregate metrics publisher
//!
//! Answers `server_stats` requests with the endpoint's live connection count
//! and, when enabled, announces the count whenever a connection joins or
//! leaves.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use uuid::Uuid;

use super::registry::{
    ConnectionRegistry, ConnectionToken, Delivery, Registration, RegistryResult,
};
use crate::server::{Action, Frame};

/// Where a `server_stats` response is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StatsPolicy {
    /// Only the connection that asked
    #[default]
    Reply,
    /// Every live connection on the endpoint
    Broadcast,
}

/// Publishes metrics for one endpoint's registry
pub struct StatsPublisher {
    registry: Arc<ConnectionRegistry>,
    policy: StatsPolicy,
    push_on_change: bool,
}

impl StatsPublisher {
    /// Create a publisher using the given delivery policy
    pub fn new(registry: Arc<ConnectionRegistry>, policy: StatsPolicy) -> Self {
        Self {
            registry,
            policy,
            push_on_change: false,
        }
    }

    /// Announce the count to everyone after each connect and disconnect
    pub fn with_push_on_change(mut self, push_on_change: bool) -> Self {
        self.push_on_change = push_on_change;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new connection and announce it if configured to
    pub async fn connect(
        &self,
        id: Uuid,
        peer_addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<Message>,
    ) -> RegistryResult<Registration> {
        let registration = self.registry.add(id, peer_addr, tx).await?;
        if self.push_on_change {
            self.announce().await;
        }
        Ok(registration)
    }

    /// Deregister a connection and announce it if configured to
    ///
    /// Returns false if the registration was already gone, e.g. because a
    /// failed delivery removed it first.
    pub async fn disconnect(&self, id: Uuid, token: ConnectionToken) -> bool {
        let removed = self.registry.remove(id, token).await;
        if removed && self.push_on_change {
            self.announce().await;
        }
        removed
    }

    /// Handle one inbound text frame from `conn`
    ///
    /// Malformed frames are dropped without a response. Returns the action that
    /// was handled, if any.
    pub async fn on_message(&self, conn: Uuid, text: &str) -> Option<Action> {
        let frame = match Frame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[{}] dropping malformed frame from {}: {}", self.registry.label(), conn, e);
                return None;
            }
        };

        match frame.action() {
            Some(Action::ServerStats) => {
                self.publish_stats(conn).await;
                Some(Action::ServerStats)
            }
            None => {
                debug!(
                    "[{}] ignoring unknown action '{}' from {}",
                    self.registry.label(),
                    frame.action,
                    conn
                );
                None
            }
        }
    }

    /// Deliver the current snapshot according to the policy
    ///
    /// Returns the number of connections the frame was queued for.
    pub async fn publish_stats(&self, requester: Uuid) -> usize {
        match self.policy {
            StatsPolicy::Reply => match self.registry.send_stats_to(requester).await {
                Delivery::Delivered => 1,
                Delivery::NotSent => 0,
                Delivery::Removed => {
                    // The requester left without deregistering; its leave still counts
                    if self.push_on_change {
                        self.announce().await;
                    }
                    0
                }
            },
            // Dead connections found during the sweep are already reflected in
            // the count the survivors receive
            StatsPolicy::Broadcast => self.registry.broadcast_stats().await,
        }
    }

    /// Broadcast the current snapshot to every live connection
    pub async fn announce(&self) -> usize {
        self.registry.broadcast_stats().await
    }
}
