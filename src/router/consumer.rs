use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::manager::message::Message;

pub type ConsumerId = String;

pub(crate) type HandlerFn = Arc<dyn Fn(&Message) + Send + Sync>;

/// How a registered consumer receives messages.
#[derive(Clone)]
pub(crate) enum Delivery {
    /// Queued onto the consumer's own channel.
    Channel(UnboundedSender<Message>),
    /// Called in place on the notifying thread.
    Handler(HandlerFn),
}

/// A consumer registered with the `CallbackRouter`.
#[derive(Clone)]
pub(crate) struct Consumer {
    pub id: ConsumerId,
    pub delivery: Delivery,
}

impl Consumer {
    pub(crate) fn channel() -> (Self, ConsumerHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = new_consumer_id();
        let consumer = Self {
            id: id.clone(),
            delivery: Delivery::Channel(sender),
        };
        (consumer, ConsumerHandle { id, receiver })
    }

    pub(crate) fn handler(handler: HandlerFn) -> Self {
        Self {
            id: new_consumer_id(),
            delivery: Delivery::Handler(handler),
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.delivery {
            Delivery::Channel(_) => "channel",
            Delivery::Handler(_) => "handler",
        };
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("delivery", &kind)
            .finish()
    }
}

fn new_consumer_id() -> ConsumerId {
    format!("consumer-{}", Uuid::new_v4())
}

/// Receiving end of a channel consumer. Messages arrive in the order the
/// transport reported them. Dropping the handle unregisters the consumer on
/// the next delivery.
#[derive(Debug)]
pub struct ConsumerHandle {
    id: ConsumerId,
    receiver: UnboundedReceiver<Message>,
}

impl ConsumerHandle {
    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    /// Waits for the next message. `None` once the consumer was unregistered
    /// and everything queued has been read.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}
