//! The `manager` module owns the connection to the broker.
//!
//! `ConnectionManager` drives a `Session` through its state machine and is
//! the only way to publish or subscribe. Inbound traffic is handed to the
//! `CallbackRouter` it owns.

pub mod engine;
pub mod message;
pub mod retry;
pub mod session;

pub use engine::ConnectionManager;
pub use message::{DeliveryToken, Message, QoS};
pub use retry::RetryPolicy;
pub use session::{BrokerAddress, ConnectOptions, Credentials, SessionState, SessionStatus};
