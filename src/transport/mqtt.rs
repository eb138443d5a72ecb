//! rumqttc-backed transport
//!
//! `open` drives the rumqttc event loop until CONNACK, then hands it to a
//! background task that keeps polling for the lifetime of the connection:
//! - incoming PUBLISH packets go to the sink as `message_arrived`
//! - outgoing PUBLISH/SUBSCRIBE events assign packet ids to queued waiters
//! - PUBACK/PUBCOMP and SUBACK complete those waiters
//! - a poll error ends the task and is reported as `connection_lost`, unless
//!   `close` initiated it
//!
//! The event loop is never polled again after an error, so rumqttc's own
//! reconnect never kicks in; reconnecting is the caller's decision.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ack_tracker::AckTracker;
use super::{BrokerTransport, TransportFactory, TransportSink};
use crate::config::ClientSettings;
use crate::manager::message::{DeliveryToken, Message, QoS};
use crate::manager::session::ConnectOptions;
use crate::persistence::Spool;
use crate::utils::error::TransportError;

/// rumqttc refuses keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// How long `close` waits for the event loop to flush the DISCONNECT.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

pub(crate) fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(
        options.client_id.clone(),
        options.address.host.clone(),
        options.address.port,
    );
    mqtt.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt.set_clean_session(options.clean_start);

    if !options.credentials.is_empty() {
        mqtt.set_credentials(
            options.credentials.username.clone().unwrap_or_default(),
            options.credentials.password.clone().unwrap_or_default(),
        );
    }
    mqtt
}

/// Shared between the transport handle and its event loop task.
struct Shared {
    tracker: AckTracker,
    sink: RwLock<Option<Arc<dyn TransportSink>>>,
    connected: AtomicBool,
    closing: AtomicBool,
}

impl Shared {
    fn sink(&self) -> Option<Arc<dyn TransportSink>> {
        self.sink.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct MqttTransport {
    shared: Arc<Shared>,
    // held across "queue waiter + hand request to rumqttc" to keep the
    // tracker's FIFO in step with the event loop
    client: Mutex<Option<AsyncClient>>,
    event_task: StdMutex<Option<JoinHandle<()>>>,
    channel_capacity: usize,
}

impl MqttTransport {
    pub fn new(spool: Option<Spool>, channel_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                tracker: AckTracker::new(spool),
                sink: RwLock::new(None),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
            client: Mutex::new(None),
            event_task: StdMutex::new(None),
            channel_capacity: channel_capacity.max(1),
        }
    }

    async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<bool, TransportError> {
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Rejected(format!(
                            "connection: {:?}",
                            ack.code
                        )));
                    }
                    return Ok(ack.session_present);
                }
                other => debug!(?other, "event before CONNACK"),
            }
        }
    }

    /// Re-sends spooled publishes of a previous session, or drops them when
    /// the broker was asked for a clean start.
    async fn resume_spool(&self, client: &AsyncClient, clean_start: bool) {
        let Some(spool) = self.shared.tracker.spool() else {
            return;
        };

        if clean_start {
            if let Err(e) = spool.clear() {
                warn!("failed to clear spool on clean start: {e}");
            }
            return;
        }

        let pending = spool.pending();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "re-sending spooled messages");

        for (key, record) in pending {
            let message: Message = record.into();
            // completion is not awaited: open must not block on old traffic
            let unsent = match self.shared.tracker.enqueue_publish(&message, Some(key)) {
                Ok((unsent, _completion)) => unsent,
                Err(e) => {
                    warn!(key = key.0, "failed to queue spooled message: {e}");
                    continue;
                }
            };
            match client
                .publish(message.topic, message.qos.into(), false, message.payload)
                .await
            {
                Ok(()) => unsent.sent(),
                Err(e) => warn!(key = key.0, "failed to re-send spooled message: {e}"),
            }
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, shared: Arc<Shared>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(sink) = shared.sink() {
                    sink.message_arrived(&publish.topic, &publish.payload, publish.qos.into());
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                complete_delivery(&shared, ack.pkid);
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                complete_delivery(&shared, comp.pkid);
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let refused = suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if refused {
                    Err(TransportError::Rejected(format!(
                        "subscription (packet {})",
                        suback.pkid
                    )))
                } else {
                    Ok(())
                };
                shared.tracker.subscribe_acknowledged(suback.pkid, result);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.tracker.publish_sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.tracker.subscribe_sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                if shared.closing.load(Ordering::SeqCst) {
                    debug!("event loop ended during close: {e}");
                } else if let Some(sink) = shared.sink() {
                    sink.connection_lost(TransportError::Connection(e));
                } else {
                    error!("connection lost with no sink registered: {e}");
                }
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.tracker.fail_all();
}

fn complete_delivery(shared: &Shared, pkid: u16) {
    if shared.tracker.publish_acknowledged(pkid) {
        if let Some(sink) = shared.sink() {
            sink.delivery_complete(DeliveryToken(pkid));
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    fn set_sink(&self, sink: Arc<dyn TransportSink>) {
        *self.shared.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    async fn open(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        let mut client_slot = self.client.lock().await;
        if self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Other("transport is already open".to_string()));
        }

        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(options), self.channel_capacity);

        let session_present = Self::wait_for_connack(&mut eventloop).await?;
        info!(
            address = %options.address,
            client_id = %options.client_id,
            session_present,
            "connected to broker"
        );

        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(run_event_loop(eventloop, self.shared.clone()));
        *self.event_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        self.resume_spool(&client, options.clean_start).await;
        *client_slot = Some(client);
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<(), TransportError> {
        let completion = {
            let client_slot = self.client.lock().await;
            let client = client_slot.as_ref().ok_or(TransportError::NotOpen)?;
            if !self.shared.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotOpen);
            }

            let message = Message::new(topic, payload.to_vec(), qos);
            // declared after the client guard so a cancelled send withdraws
            // the waiter before the lock is released
            let (unsent, completion) = self.shared.tracker.enqueue_publish(&message, None)?;
            client
                .publish(message.topic, qos.into(), false, message.payload)
                .await?;
            unsent.sent();
            completion
        };

        completion.await.map_err(|_| TransportError::Closed)?
    }

    async fn subscribe(&self, filter: &str, max_qos: QoS) -> Result<(), TransportError> {
        let completion = {
            let client_slot = self.client.lock().await;
            let client = client_slot.as_ref().ok_or(TransportError::NotOpen)?;
            if !self.shared.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotOpen);
            }

            let (unsent, completion) = self.shared.tracker.enqueue_subscribe();
            client.subscribe(filter, max_qos.into()).await?;
            unsent.sent();
            completion
        };

        completion.await.map_err(|_| TransportError::Closed)?
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let client = self.client.lock().await.take();
        let task = self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let result = match &client {
            Some(client) => client.disconnect().await.map_err(TransportError::from),
            None => Ok(()),
        };
        let client_sent_disconnect = client.is_some() && result.is_ok();

        match (task, client_sent_disconnect) {
            (Some(mut task), true) => {
                if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                    warn!("event loop did not stop in time, aborting it");
                    task.abort();
                }
            }
            // nothing will stop the loop on its own (open was cut short)
            (Some(task), false) => task.abort(),
            (None, _) => {}
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.tracker.fail_all();
        result
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

/// Creates one `MqttTransport` per session, all sharing one spool database.
#[derive(Clone)]
pub struct MqttTransportFactory {
    spool_db: Option<sled::Db>,
    channel_capacity: usize,
}

impl MqttTransportFactory {
    pub fn new(settings: &ClientSettings) -> Result<Self, TransportError> {
        let spool_db = match &settings.spool_dir {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                info!(dir = %dir.display(), "using message spool");
                Some(Spool::open_db(&dir)?)
            }
            None => None,
        };

        Ok(Self {
            spool_db,
            channel_capacity: settings.channel_capacity,
        })
    }
}

impl std::fmt::Debug for MqttTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransportFactory")
            .field("spool", &self.spool_db.as_ref().map(|_| "sled::Db"))
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl TransportFactory for MqttTransportFactory {
    fn create(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerTransport>, TransportError> {
        let spool = match &self.spool_db {
            Some(db) => Some(Spool::new(db.clone(), &options.client_id)?),
            None => None,
        };
        Ok(Arc::new(MqttTransport::new(spool, self.channel_capacity)))
    }
}
