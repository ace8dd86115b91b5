//! Protocol message definitions
//!
//! Defines the frames exchanged between presence clients and the server.
//! Every frame is a JSON object of the form `{"action": ..., "data": ...}`
//! sent as a websocket text message.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Maximum accepted frame length (64KB)
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Maximum action tag length
pub const MAX_ACTION_LENGTH: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Actions
// ============================================================================

/// Known action tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Request/response for the active connection count
    ServerStats,
}

impl Action {
    /// Wire representation of the action tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ServerStats => "server_stats",
        }
    }

    /// Look up a known action by its wire tag
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "server_stats" => Some(Action::ServerStats),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Frames
// ============================================================================

/// A single tagged message
///
/// The action is kept as a raw string so that well-formed frames with tags
/// this build does not know about still decode; handlers decide what to do
/// with them via [`Frame::action`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    /// Action tag selecting the handler and payload shape
    pub action: String,
    /// Action-specific payload, omitted on the wire when null
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Frame {
    /// Create a frame carrying a payload
    pub fn new(action: Action, data: Value) -> Self {
        Self {
            action: action.as_str().to_string(),
            data,
        }
    }

    /// Create a payload-less request frame
    pub fn request(action: Action) -> Self {
        Self::new(action, Value::Null)
    }

    /// Create a `server_stats` response frame
    pub fn server_stats(stats: ServerStats) -> Self {
        Self::new(Action::ServerStats, stats.to_value())
    }

    /// The known action this frame carries, if any
    pub fn action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Check whether this frame carries the given action
    pub fn is(&self, action: Action) -> bool {
        self.action == action.as_str()
    }

    /// Parse and validate a frame from JSON text
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        if json.len() > MAX_FRAME_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "frame exceeds maximum length of {} bytes",
                MAX_FRAME_LENGTH
            )));
        }

        let value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidMessage(
                "frame must be a JSON object".to_string(),
            ));
        }

        let frame: Frame = serde_json::from_value(value)?;
        frame.validate()?;
        Ok(frame)
    }

    /// Validate frame contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.action.is_empty() {
            return Err(ProtocolError::ValidationError(
                "action cannot be empty".to_string(),
            ));
        }
        if self.action.len() > MAX_ACTION_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "action exceeds maximum length of {} characters",
                MAX_ACTION_LENGTH
            )));
        }
        Ok(())
    }

    /// Serialize the frame to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Aggregate metrics snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServerStats {
    /// Number of live connections on the endpoint
    pub active_users: usize,
}

impl ServerStats {
    pub fn new(active_users: usize) -> Self {
        Self { active_users }
    }

    fn to_value(self) -> Value {
        json!({ "active_users": self.active_users })
    }

    /// Decode the snapshot carried by a `server_stats` frame
    pub fn from_frame(frame: &Frame) -> ProtocolResult<Self> {
        if !frame.is(Action::ServerStats) {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected {} frame, got {}",
                Action::ServerStats,
                frame.action
            )));
        }
        Ok(serde_json::from_value(frame.data.clone())?)
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

/// Lifecycle of a single connection, on either side of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Handshake complete, frames flow
    Open,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Connecting, ConnectionState::Open)
                | (ConnectionState::Connecting, ConnectionState::Closed)
                | (ConnectionState::Open, ConnectionState::Closed)
        )
    }

    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Wire format
    // -------------------------------------------------------------------------

    #[test]
    fn test_stats_request_serialization() {
        let json = Frame::request(Action::ServerStats).to_json().unwrap();
        assert_eq!(json, r#"{"action":"server_stats"}"#);
    }

    #[test]
    fn test_stats_response_serialization() {
        let json = Frame::server_stats(ServerStats::new(1)).to_json().unwrap();
        assert_eq!(json, r#"{"action":"server_stats","data":{"active_users":1}}"#);
    }

    #[test]
    fn test_parse_stats_request() {
        let frame = Frame::from_json(r#"{"action": "server_stats"}"#).unwrap();
        assert_eq!(frame.action(), Some(Action::ServerStats));
        assert!(frame.data.is_null());
    }

    #[test]
    fn test_parse_stats_response() {
        let frame =
            Frame::from_json(r#"{"action":"server_stats","data":{"active_users":7}}"#).unwrap();
        let stats = ServerStats::from_frame(&frame).unwrap();
        assert_eq!(stats.active_users, 7);
    }

    #[test]
    fn test_unknown_action_still_decodes() {
        let frame = Frame::from_json(r#"{"action":"start_app","data":[1,2]}"#).unwrap();
        assert_eq!(frame.action(), None);
        assert!(!frame.is(Action::ServerStats));
    }

    // -------------------------------------------------------------------------
    // Malformed frames
    // -------------------------------------------------------------------------

    #[test]
    fn test_missing_action_rejected() {
        let result = Frame::from_json(r#"{"foo": 1}"#);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_non_json_rejected() {
        assert!(Frame::from_json("server_stats").is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        let result = Frame::from_json(r#"["server_stats"]"#);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("must be a JSON object"));
    }

    #[test]
    fn test_empty_action_rejected() {
        let result = Frame::from_json(r#"{"action": ""}"#);
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let padding = "x".repeat(MAX_FRAME_LENGTH);
        let json = format!(r#"{{"action":"server_stats","data":"{}"}}"#, padding);
        let result = Frame::from_json(&json);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum length"));
    }

    #[test]
    fn test_stats_from_wrong_action() {
        let frame = Frame {
            action: "other".to_string(),
            data: json!({ "active_users": 3 }),
        };
        assert!(ServerStats::from_frame(&frame).is_err());
    }

    #[test]
    fn test_stats_from_bad_payload() {
        let frame = Frame {
            action: "server_stats".to_string(),
            data: json!({ "active_users": -1 }),
        };
        assert!(ServerStats::from_frame(&frame).is_err());
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    #[test]
    fn test_connection_state_transitions() {
        use ConnectionState::*;

        assert!(Connecting.can_transition_to(Open));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closed));

        assert!(!Open.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Open.can_transition_to(Open));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Closed.is_open());
    }
}
