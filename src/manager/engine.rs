//! Connection manager
//!
//! Owns the single `Session` to a broker and mediates every request-side
//! operation:
//! - `connect` builds a new session, wires the router to its transport and
//!   performs the handshake; `reconnect` does the same with the options of
//!   the current session
//! - `publish` / `subscribe` go through only while the session is Connected
//! - `disconnect` closes gracefully and is idempotent
//! - `release` tears everything down and never fails
//!
//! Concurrency notes:
//! - The session slot sits behind an async mutex. `connect`, `reconnect`,
//!   `disconnect` and `release` hold it for their whole duration, so at most
//!   one handshake is in flight and state changes never interleave.
//! - `publish` and `subscribe` hold it only to check the state and take a
//!   handle to the transport; the wait for the broker's acknowledgment
//!   happens outside the lock, so independent requests do not queue behind
//!   each other.
//! - Every transport call is bounded by a timeout from `ClientSettings`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::message::QoS;
use super::retry::RetryPolicy;
use super::session::{ConnectOptions, Session, SessionState, SessionStatus};
use crate::config::{ClientSettings, Settings};
use crate::router::CallbackRouter;
use crate::transport::{BrokerTransport, MqttTransportFactory, TransportFactory};
use crate::utils::error::{ConnectionError, TransportError};

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    router: Arc<CallbackRouter>,
    connect_timeout: Duration,
    operation_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, settings: &ClientSettings) -> Self {
        Self {
            factory,
            router: Arc::new(CallbackRouter::new()),
            connect_timeout: settings.connect_timeout(),
            operation_timeout: settings.operation_timeout(),
            session: Mutex::new(None),
        }
    }

    /// Manager talking MQTT through rumqttc, spooling to
    /// `client.spool_dir` when configured.
    pub fn with_mqtt(settings: &Settings) -> Result<Self, ConnectionError> {
        let factory = MqttTransportFactory::new(&settings.client).map_err(|cause| {
            ConnectionError::TransportFailure {
                operation: "spool setup",
                cause,
            }
        })?;
        Ok(Self::new(Arc::new(factory), &settings.client))
    }

    /// Registry of in-process consumers for inbound messages.
    pub fn router(&self) -> &Arc<CallbackRouter> {
        &self.router
    }

    /// State of the current session; `Uninitialized` when there is none.
    pub async fn state(&self) -> SessionState {
        self.session
            .lock()
            .await
            .as_ref()
            .map(Session::state)
            .unwrap_or(SessionState::Uninitialized)
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.session.lock().await.as_ref().map(|s| s.status.id())
    }

    /// Opens a new session, replacing (and closing) any previous one.
    ///
    /// The router is registered as the transport's sink before the
    /// handshake starts. On failure the new session ends up Closed and the
    /// cause is returned; nothing is retried.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), ConnectionError> {
        let mut slot = self.session.lock().await;
        self.open_session(&mut slot, options).await
    }

    /// Opens a new session with the options of the current one, closing it
    /// first if it is still live. Fails with `NotConnected(Uninitialized)`
    /// when there is no session to take the options from.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let mut slot = self.session.lock().await;
        let Some(options) = slot.as_ref().map(|s| s.options.clone()) else {
            return Err(ConnectionError::NotConnected(SessionState::Uninitialized));
        };
        info!(address = %options.address, "reconnecting");
        self.open_session(&mut slot, options).await
    }

    async fn open_session(
        &self,
        slot: &mut Option<Session>,
        options: ConnectOptions,
    ) -> Result<(), ConnectionError> {
        if let Some(previous) = slot.take() {
            if previous.state().is_connected() {
                info!(session = %previous.status.id(), "replacing live session");
                if let Err(e) = self.close_session(&previous).await {
                    warn!(session = %previous.status.id(), "closing replaced session failed: {e}");
                }
            }
        }

        let status = Arc::new(SessionStatus::new());
        let address = options.address.to_string();

        let transport = self.factory.create(&options).map_err(|cause| {
            error!(address = %address, "failed to create transport: {cause}");
            ConnectionError::HandshakeFailure {
                address: address.clone(),
                cause,
            }
        })?;
        transport.set_sink(self.router.bind(status.clone()));

        status.transition(SessionState::Connecting);
        *slot = Some(Session::new(status.clone(), options.clone(), transport.clone()));
        let options = &options;

        info!(
            session = %status.id(),
            address = %address,
            client_id = %options.client_id,
            clean_start = options.clean_start,
            "connecting"
        );

        match bounded("connect", self.connect_timeout, transport.open(options)).await {
            Ok(Ok(())) if transport.is_connected() && status.transition(SessionState::Connected) => {
                info!(session = %status.id(), address = %address, "connected");
                Ok(())
            }
            Ok(Ok(())) => {
                // lost between CONNACK and here
                status.transition(SessionState::Closed);
                let _ = transport.close().await;
                let cause = TransportError::Other("connection dropped during handshake".to_string());
                error!(address = %address, "connect failed: {cause}");
                Err(ConnectionError::HandshakeFailure { address, cause })
            }
            Ok(Err(cause)) => {
                status.transition(SessionState::Closed);
                error!(address = %address, "connect failed: {cause}");
                Err(ConnectionError::HandshakeFailure { address, cause })
            }
            Err(timeout) => {
                status.transition(SessionState::Closed);
                // drop whatever half-open connection the transport holds
                let _ = transport.close().await;
                error!(address = %address, "connect failed: {timeout}");
                Err(timeout)
            }
        }
    }

    /// `connect` with backoff: handshake failures and timeouts are retried
    /// per `policy`, any other error is returned at once.
    pub async fn connect_with_retry(
        &self,
        options: ConnectOptions,
        policy: &RetryPolicy,
    ) -> Result<(), ConnectionError> {
        let attempts = policy.attempts();
        let mut attempt = 1;
        loop {
            match self.connect(options.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = policy.delay_after(attempt);
                    warn!(attempt, attempts, ?delay, "connect attempt failed: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Publishes and waits for the confirmation `qos` calls for.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        let transport = self.connected_transport("publish").await?;

        debug!(topic = %topic, qos = %qos, bytes = payload.len(), "publishing");
        match bounded("publish", self.operation_timeout, transport.publish(topic, qos, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(cause)) => {
                warn!(topic = %topic, "publish failed: {cause}");
                Err(ConnectionError::TransportFailure {
                    operation: "publish",
                    cause,
                })
            }
            Err(timeout) => {
                warn!(topic = %topic, "{timeout}");
                Err(timeout)
            }
        }
    }

    /// Subscribes to `filter`; returns once the broker acknowledged.
    pub async fn subscribe(&self, filter: &str, max_qos: QoS) -> Result<(), ConnectionError> {
        let transport = self.connected_transport("subscribe").await?;

        debug!(filter = %filter, qos = %max_qos, "subscribing");
        match bounded("subscribe", self.operation_timeout, transport.subscribe(filter, max_qos)).await {
            Ok(Ok(())) => {
                info!(filter = %filter, qos = %max_qos, "subscribed");
                Ok(())
            }
            Ok(Err(cause)) => {
                warn!(filter = %filter, "subscribe failed: {cause}");
                Err(ConnectionError::TransportFailure {
                    operation: "subscribe",
                    cause,
                })
            }
            Err(timeout) => {
                warn!(filter = %filter, "{timeout}");
                Err(timeout)
            }
        }
    }

    /// Gracefully closes the session. A no-op unless Connected. The session
    /// ends Closed even when the transport's close fails.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(session) if session.state().is_connected() => self.close_session(session).await,
            _ => {
                debug!("disconnect without a live session");
                Ok(())
            }
        }
    }

    /// Tears down the session, if any, so the next `connect` starts from
    /// scratch. Failures are logged and swallowed.
    pub async fn release(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            if session.state().is_connected() {
                if let Err(e) = self.close_session(&session).await {
                    warn!(session = %session.status.id(), "ignoring disconnect failure during release: {e}");
                }
            }
            // a Connecting/Disconnecting session cannot exist outside the lock
            session.status.mark_lost();
            info!(session = %session.status.id(), "session released");
        }
    }

    async fn connected_transport(
        &self,
        operation: &'static str,
    ) -> Result<Arc<dyn BrokerTransport>, ConnectionError> {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(session) if session.state().is_connected() => Ok(session.transport.clone()),
            other => {
                let state = other.map(Session::state).unwrap_or(SessionState::Uninitialized);
                debug!(operation, state = %state, "refusing request on a session that is not connected");
                Err(ConnectionError::NotConnected(state))
            }
        }
    }

    async fn close_session(&self, session: &Session) -> Result<(), ConnectionError> {
        let status = &session.status;
        if !status.transition(SessionState::Disconnecting) {
            return Ok(());
        }
        info!(session = %status.id(), "disconnecting");

        let result = bounded("disconnect", self.operation_timeout, session.transport.close()).await;
        status.transition(SessionState::Closed);

        match result {
            Ok(Ok(())) => {
                info!(session = %status.id(), "disconnected");
                Ok(())
            }
            Ok(Err(cause)) => Err(ConnectionError::TransportFailure {
                operation: "disconnect",
                cause,
            }),
            Err(timeout) => Err(timeout),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("consumers", &self.router.consumer_count())
            .finish()
    }
}

async fn bounded<F, T>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, ConnectionError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ConnectionError::Timeout { operation, timeout })
}
