//! Session data model
//!
//! A `Session` is one logical connection to a broker. Its state is kept in a
//! `SessionStatus` shared between the `ConnectionManager` (request side) and
//! the sink the router binds for the transport (notification side), so a
//! connection loss reported from the transport's task is visible to the next
//! publish or subscribe.
//!
//! State machine:
//!
//! ```text
//! Uninitialized -> Connecting -> Connected -> Disconnecting -> Closed
//!                      |             |
//!                      +--> Closed   +--> Closed   (handshake failure / connection lost)
//! ```
//!
//! `Closed` is terminal; a new `connect` builds a new `Session`.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{BrokerSettings, ClientSettings};
use crate::transport::BrokerTransport;
use crate::utils::error::ConnectionError;

pub const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, Connecting)
                | (Connecting, Connected)
                | (Connecting, Closed)
                | (Connected, Disconnecting)
                | (Connected, Closed)
                | (Disconnecting, Closed)
        )
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Broker location, e.g. `tcp://broker.local:1883` or `broker:1883`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parses a broker URI. A missing scheme means `tcp`, a missing port
    /// means 1883. Only plain-TCP schemes (`tcp`, `mqtt`) are accepted.
    pub fn parse(address: &str) -> Result<Self, ConnectionError> {
        let invalid = |reason: &str| ConnectionError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        // "host:port" would otherwise parse as scheme "host"
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("tcp://{trimmed}")
        };

        let url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;

        let scheme = url.scheme().to_lowercase();
        if scheme != "tcp" && scheme != "mqtt" {
            return Err(invalid(&format!("unsupported scheme '{scheme}'")));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();

        Ok(Self {
            scheme,
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub address: BrokerAddress,
    pub client_id: String,
    pub credentials: Credentials,
    pub clean_start: bool,
    pub keep_alive: Duration,
}

impl ConnectOptions {
    pub fn new(address: &str, client_id: impl Into<String>) -> Result<Self, ConnectionError> {
        let client_id = client_id.into();
        if client_id.trim().is_empty() {
            return Err(ConnectionError::InvalidClientId);
        }

        Ok(Self {
            address: BrokerAddress::parse(address)?,
            client_id,
            credentials: Credentials::default(),
            clean_start: true,
            keep_alive: Duration::from_secs(60),
        })
    }

    pub fn from_settings(
        broker: &BrokerSettings,
        client: &ClientSettings,
    ) -> Result<Self, ConnectionError> {
        Ok(Self::new(&broker.address, broker.client_id.clone())?
            .with_credentials(broker.username.clone(), broker.password.clone())
            .with_clean_start(broker.clean_start)
            .with_keep_alive(Duration::from_secs(client.keep_alive_secs)))
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.credentials = Credentials { username, password };
        self
    }

    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Identity and state of one session, shared with the transport's sink.
#[derive(Debug)]
pub struct SessionStatus {
    id: Uuid,
    state: Mutex<SessionState>,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(SessionState::Uninitialized),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to `next` if the state machine allows it. Returns whether the
    /// transition happened.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.can_transition_to(next) {
            debug!(session = %self.id, from = %*state, to = %next, "session state change");
            *state = next;
            true
        } else {
            if *state != next {
                warn!(session = %self.id, from = %*state, to = %next, "refused session state change");
            }
            false
        }
    }

    /// Marks the session closed after an unsolicited disconnect. Returns
    /// false if the session was already closed.
    pub fn mark_lost(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            SessionState::Connecting | SessionState::Connected | SessionState::Disconnecting => {
                *state = SessionState::Closed;
                true
            }
            SessionState::Uninitialized | SessionState::Closed => false,
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live or finished session owned by the `ConnectionManager`.
pub(crate) struct Session {
    pub(crate) status: Arc<SessionStatus>,
    pub(crate) options: ConnectOptions,
    pub(crate) transport: Arc<dyn BrokerTransport>,
    pub(crate) created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(
        status: Arc<SessionStatus>,
        options: ConnectOptions,
        transport: Arc<dyn BrokerTransport>,
    ) -> Self {
        Self {
            status,
            options,
            transport,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.status.state()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.status.id())
            .field("state", &self.status.state())
            .field("address", &self.options.address.to_string())
            .field("client_id", &self.options.client_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}
