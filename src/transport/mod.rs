//! The `transport` module defines the boundary between the connection manager
//! and the wire protocol.
//!
//! A `BrokerTransport` opens a connection, publishes, subscribes and closes;
//! everything the broker sends unprompted comes back through the
//! `TransportSink` registered with `set_sink`. `MqttTransport` is the
//! rumqttc-backed implementation.

mod ack_tracker;
pub mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;

use crate::manager::message::{DeliveryToken, QoS};
use crate::manager::session::ConnectOptions;
use crate::utils::error::TransportError;

pub use mqtt::{MqttTransport, MqttTransportFactory};

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Registers the receiver of asynchronous notifications. Called before
    /// `open`.
    fn set_sink(&self, sink: Arc<dyn TransportSink>);

    /// Performs the handshake. Returns once the broker accepted the
    /// connection.
    async fn open(&self, options: &ConnectOptions) -> Result<(), TransportError>;

    /// Sends a message and waits for the confirmation its QoS calls for.
    async fn publish(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<(), TransportError>;

    /// Requests a subscription and waits for the broker's acknowledgment.
    async fn subscribe(&self, filter: &str, max_qos: QoS) -> Result<(), TransportError>;

    /// Graceful shutdown. No `connection_lost` is reported for it.
    async fn close(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Receiver of transport notifications. Implementations must not block: they
/// are called from the transport's network task.
pub trait TransportSink: Send + Sync {
    fn connection_lost(&self, cause: TransportError);

    fn message_arrived(&self, topic: &str, payload: &[u8], qos: QoS);

    fn delivery_complete(&self, token: DeliveryToken);
}

/// Builds a fresh transport for every session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerTransport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ConnectOptions) -> Result<Arc<dyn BrokerTransport>, TransportError> + Send + Sync,
{
    fn create(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerTransport>, TransportError> {
        self(options)
    }
}

#[cfg(test)]
pub(crate) mod test_helpers;


#[cfg(test)]
mod mqtt_tests;
