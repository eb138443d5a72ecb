//! The `router` module turns asynchronous transport notifications into
//! in-process delivery to registered consumers.
//!
//! Consumers are either channel-based (`ConsumerHandle`) or plain callbacks.
//! Each consumer sees messages in arrival order; there is no ordering between
//! distinct consumers.

pub mod callback_router;
pub mod consumer;

pub use callback_router::{CallbackRouter, SessionSink};
pub use consumer::{ConsumerHandle, ConsumerId};

use crate::manager::message::{DeliveryToken, QoS};
use crate::transport::TransportSink;
use crate::utils::error::TransportError;

impl TransportSink for SessionSink {
    fn connection_lost(&self, cause: TransportError) {
        self.router().on_connection_lost(self.session(), &cause);
    }

    fn message_arrived(&self, topic: &str, payload: &[u8], qos: QoS) {
        self.router().on_message_arrived(topic, payload, qos);
    }

    fn delivery_complete(&self, token: DeliveryToken) {
        self.router().on_delivery_complete(token);
    }
}
