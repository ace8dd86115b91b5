//! Websocket endpoint routing
//!
//! Maps the handshake request target to an endpoint and the connection id the
//! client asked for.

use uuid::Uuid;

/// A websocket path with its own live-connection set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Anonymous browser clients
    Client,
    /// Signed-in users
    User,
}

impl Endpoint {
    pub const ALL: [Endpoint; 2] = [Endpoint::Client, Endpoint::User];

    /// Request path served by this endpoint
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Client => "/ws/client",
            Endpoint::User => "/ws/user",
        }
    }

    /// Query parameter carrying the connection id
    pub fn id_param(&self) -> &'static str {
        match self {
            Endpoint::Client => "client_id",
            Endpoint::User => "user_id",
        }
    }

    /// Short name used in log lines
    pub fn label(&self) -> &'static str {
        match self {
            Endpoint::Client => "client",
            Endpoint::User => "user",
        }
    }

    /// Whether joins and leaves on this endpoint are announced to its peers
    ///
    /// Only anonymous clients announce presence; signed-in users pull the
    /// count on request.
    pub fn announces_presence(&self) -> bool {
        matches!(self, Endpoint::Client)
    }

    /// Look up the endpoint serving `path`
    pub fn from_path(path: &str) -> Option<Self> {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        Self::ALL.into_iter().find(|e| e.path() == path)
    }
}

/// Resolved handshake target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub endpoint: Endpoint,
    /// Id requested through the query string, if present and well-formed
    pub requested_id: Option<Uuid>,
}

impl Route {
    /// Resolve a request target such as `/ws/client?client_id=<uuid>`
    pub fn resolve(target: &str) -> Option<Self> {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        let endpoint = Endpoint::from_path(path)?;

        let requested_id = query.and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == endpoint.id_param())
                .and_then(|(_, value)| Uuid::parse_str(value).ok())
        });

        Some(Self {
            endpoint,
            requested_id,
        })
    }

    /// The requested id, or a fresh one
    pub fn connection_id(&self) -> Uuid {
        self.requested_id.unwrap_or_else(Uuid::new_v4)
    }
}
