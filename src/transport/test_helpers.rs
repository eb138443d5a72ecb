//! In-memory transport used by the manager and router tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BrokerTransport, TransportFactory, TransportSink};
use crate::manager::message::QoS;
use crate::manager::session::ConnectOptions;
use crate::utils::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    SetSink,
    Open { client_id: String, clean_start: bool },
    Publish { topic: String, qos: QoS, payload: Vec<u8> },
    Subscribe { filter: String, max_qos: QoS },
    Close,
}

/// What the next transports built by a `MockFactory` should do.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockBehavior {
    pub fail_open: bool,
    pub fail_close: bool,
    pub fail_publish: bool,
    pub fail_subscribe: bool,
    /// `open` succeeds but the connection is gone by the time it returns.
    pub lose_during_open: bool,
    pub open_delay: Option<Duration>,
    pub publish_delay: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    behavior: MockBehavior,
    calls: Mutex<Vec<Call>>,
    sink: Mutex<Option<Arc<dyn TransportSink>>>,
    connected: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn sink(&self) -> Arc<dyn TransportSink> {
        self.sink.lock().unwrap().clone().expect("sink registered")
    }

    /// Simulates the network dropping: the transport reports the loss the
    /// way a real one would.
    pub(crate) fn drop_connection(&self, cause: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.sink()
            .connection_lost(TransportError::Other(cause.to_string()));
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    fn set_sink(&self, sink: Arc<dyn TransportSink>) {
        self.record(Call::SetSink);
        *self.sink.lock().unwrap() = Some(sink);
    }

    async fn open(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.record(Call::Open {
            client_id: options.client_id.clone(),
            clean_start: options.clean_start,
        });
        if let Some(delay) = self.behavior.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_open {
            return Err(TransportError::Other("connection refused".to_string()));
        }
        if self.behavior.lose_during_open {
            self.drop_connection("reset right after CONNACK");
            return Ok(());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<(), TransportError> {
        self.record(Call::Publish {
            topic: topic.to_string(),
            qos,
            payload: payload.to_vec(),
        });
        if let Some(delay) = self.behavior.publish_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_publish {
            return Err(TransportError::Other("publish not acknowledged".to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, max_qos: QoS) -> Result<(), TransportError> {
        self.record(Call::Subscribe {
            filter: filter.to_string(),
            max_qos,
        });
        if self.behavior.fail_subscribe {
            return Err(TransportError::Rejected(format!("subscription to '{filter}'")));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close);
        self.connected.store(false, Ordering::SeqCst);
        if self.behavior.fail_close {
            return Err(TransportError::Other("socket already gone".to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out `MockTransport`s and keeps them for inspection.
#[derive(Default)]
pub(crate) struct MockFactory {
    behavior: Mutex<MockBehavior>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_behavior(behavior: MockBehavior) -> Arc<Self> {
        let factory = Self::default();
        *factory.behavior.lock().unwrap() = behavior;
        Arc::new(factory)
    }

    pub(crate) fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub(crate) fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub(crate) fn last(&self) -> Arc<MockTransport> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a transport was created")
    }

    /// Calls seen by every transport created so far.
    pub(crate) fn all_calls(&self) -> Vec<Call> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .flat_map(|t| t.calls())
            .collect()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, _options: &ConnectOptions) -> Result<Arc<dyn BrokerTransport>, TransportError> {
        let transport = Arc::new(MockTransport::new(self.behavior.lock().unwrap().clone()));
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
