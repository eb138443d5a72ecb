//! The `error` module defines the error types used across `mqttlink`.
//!
//! `ConnectionError` is what callers of the `ConnectionManager` see. It keeps
//! the kind of failure and its cause together so nothing is reduced to a bare
//! boolean; callers that only care about success can still use `is_ok()`.
//!
//! `TransportError` is produced by `BrokerTransport` implementations and
//! `SpoolError` by the on-disk spool.

use std::time::Duration;

use thiserror::Error;

use crate::manager::session::SessionState;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake with {address} failed: {cause}")]
    HandshakeFailure {
        address: String,
        cause: TransportError,
    },

    #[error("session is not connected (state: {0})")]
    NotConnected(SessionState),

    #[error("{operation} failed: {cause}")]
    TransportFailure {
        operation: &'static str,
        cause: TransportError,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("client identifier must not be empty")]
    InvalidClientId,

    #[error("invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl ConnectionError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected(_))
    }

    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::HandshakeFailure { .. })
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether a fresh `connect` attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HandshakeFailure { .. } | Self::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("broker rejected {0}")]
    Rejected(String),

    #[error("transport is not open")]
    NotOpen,

    #[error("transport closed before the request completed")]
    Closed,

    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
