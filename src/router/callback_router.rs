//! Callback router
//!
//! Adapts transport notifications into in-process delivery:
//! - `on_message_arrived` builds a `Message` and hands a clone to every
//!   consumer registered at that moment
//! - `on_connection_lost` closes the session the notification belongs to
//! - `on_delivery_complete` republishes acknowledged delivery tokens
//!
//! All three run on the transport's network task and never block it. The
//! registry lock is only held to take a snapshot; consumers are invoked
//! outside it, so a handler may register or unregister consumers itself.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::consumer::{Consumer, ConsumerHandle, ConsumerId, Delivery};
use crate::manager::message::{DeliveryToken, Message, QoS};
use crate::manager::session::SessionStatus;
use crate::utils::error::TransportError;

const DELIVERY_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct CallbackRouter {
    consumers: RwLock<HashMap<ConsumerId, Consumer>>,
    deliveries: broadcast::Sender<DeliveryToken>,
}

impl Default for CallbackRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRouter {
    pub fn new() -> Self {
        let (deliveries, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);
        Self {
            consumers: RwLock::new(HashMap::new()),
            deliveries,
        }
    }

    /// Registers a channel consumer. It receives every message arriving from
    /// now on, until it is unregistered or its handle is dropped.
    pub fn register(&self) -> ConsumerHandle {
        let (consumer, handle) = Consumer::channel();
        debug!(consumer = %consumer.id, "registered channel consumer");
        self.insert(consumer);
        handle
    }

    /// Registers a callback consumer. The handler runs on the transport's
    /// task, so it should be quick; a panic inside it is contained.
    pub fn register_handler<F>(&self, handler: F) -> ConsumerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let consumer = Consumer::handler(Arc::new(handler));
        let id = consumer.id.clone();
        debug!(consumer = %id, "registered handler consumer");
        self.insert(consumer);
        id
    }

    /// Returns whether the consumer was registered.
    pub fn unregister(&self, id: &ConsumerId) -> bool {
        let removed = self
            .consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some();
        if removed {
            debug!(consumer = %id, "unregistered consumer");
        }
        removed
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Tokens of outbound QoS 1/2 publishes the broker fully acknowledged.
    pub fn deliveries(&self) -> broadcast::Receiver<DeliveryToken> {
        self.deliveries.subscribe()
    }

    /// Binds the router to one session, producing the sink handed to that
    /// session's transport.
    pub fn bind(self: &Arc<Self>, session: Arc<SessionStatus>) -> Arc<SessionSink> {
        Arc::new(SessionSink {
            router: self.clone(),
            session,
        })
    }

    pub fn on_connection_lost(&self, session: &SessionStatus, cause: &TransportError) {
        error!(session = %session.id(), "connection lost: {cause}");
        if !session.mark_lost() {
            debug!(session = %session.id(), "connection loss reported for a closed session");
        }
    }

    pub fn on_message_arrived(&self, topic: &str, payload: &[u8], qos: QoS) {
        let message = Message::new(topic, payload.to_vec(), qos);
        debug!(topic = %topic, qos = %qos, bytes = payload.len(), "message arrived");

        let snapshot: Vec<Consumer> = self
            .consumers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut gone = Vec::new();
        for consumer in snapshot {
            match &consumer.delivery {
                Delivery::Channel(sender) => {
                    if sender.send(message.clone()).is_err() {
                        warn!(consumer = %consumer.id, "consumer handle dropped, removing it");
                        gone.push(consumer.id);
                    }
                }
                Delivery::Handler(handler) => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&message)));
                    if outcome.is_err() {
                        error!(consumer = %consumer.id, topic = %topic, "consumer panicked while handling message");
                    }
                }
            }
        }

        if !gone.is_empty() {
            let mut consumers = self.consumers.write().unwrap_or_else(|e| e.into_inner());
            for id in gone {
                consumers.remove(&id);
            }
        }
    }

    /// Hook for outbound acknowledgment tracking; only republishes the token.
    pub fn on_delivery_complete(&self, token: DeliveryToken) {
        debug!(token = %token, "delivery complete");
        // no listeners is fine
        let _ = self.deliveries.send(token);
    }

    fn insert(&self, consumer: Consumer) {
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(consumer.id.clone(), consumer);
    }
}

/// `TransportSink` of one session: routes through the shared router and
/// closes only its own session on connection loss.
#[derive(Debug)]
pub struct SessionSink {
    router: Arc<CallbackRouter>,
    session: Arc<SessionStatus>,
}

impl SessionSink {
    pub fn router(&self) -> &CallbackRouter {
        &self.router
    }

    pub fn session(&self) -> &SessionStatus {
        &self.session
    }
}
