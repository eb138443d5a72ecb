//! # mqttlink
//!
//! `mqttlink` is an MQTT client connection manager built on tokio and
//! rumqttc. It keeps one session to a broker, serializes its lifecycle, and
//! dispatches inbound messages to in-process consumers.
//!
//! ## Core Modules
//!
//! - `manager`: `ConnectionManager`, the session state machine and the
//!   connect/publish/subscribe/disconnect operations.
//! - `router`: `CallbackRouter`, which turns transport notifications into
//!   deliveries to registered consumers.
//! - `transport`: the `BrokerTransport` boundary and its rumqttc
//!   implementation.
//! - `persistence`: the sled-backed spool of unacknowledged outbound messages.
//! - `config`: layered configuration from file and environment.
//! - `utils`: error types and logging setup.
//!
//! ## Example
//!
//! ```no_run
//! use mqttlink::{ConnectOptions, ConnectionManager, QoS, config};
//!
//! # async fn run() -> Result<(), mqttlink::ConnectionError> {
//! let settings = config::load_config()?;
//! let manager = ConnectionManager::with_mqtt(&settings)?;
//! let mut inbox = manager.router().register();
//!
//! manager.connect(ConnectOptions::new("tcp://127.0.0.1:1883", "id1")?).await?;
//! manager.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//! manager.publish("sensors/t1", QoS::AtLeastOnce, b"21.5").await?;
//!
//! if let Some(message) = inbox.recv().await {
//!     println!("{}: {}", message.topic, message.payload_str());
//! }
//! manager.release().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod persistence;
pub mod router;
pub mod transport;
pub mod utils;

pub use manager::{ConnectOptions, ConnectionManager, Message, QoS, RetryPolicy, SessionState};
pub use router::{CallbackRouter, ConsumerHandle};
pub use utils::error::{ConnectionError, TransportError};
