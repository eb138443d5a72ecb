//! Correlates requests with broker acknowledgments.
//!
//! rumqttc does not hand the packet id of a request back to the caller; it
//! reports it later as an outgoing event. Requests are written to the event
//! loop strictly in the order they were queued here (callers hold the request
//! lock across both steps), so the n-th outgoing PUBLISH or SUBSCRIBE event
//! belongs to the n-th queued waiter. From then on the waiter is keyed by
//! packet id until the matching PUBACK/PUBCOMP or SUBACK arrives.
//!
//! A queued waiter whose request never reached the client (the send failed,
//! or the caller gave up while rumqttc's request channel was full) must leave
//! the queue, or every later event would be matched one waiter off. `Unsent`
//! withdraws it by ticket when dropped before `sent` is called.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::manager::message::{Message, QoS};
use crate::persistence::{Spool, SpoolKey};
use crate::utils::error::TransportError;

pub(crate) type Responder = oneshot::Sender<Result<(), TransportError>>;
pub(crate) type Completion = oneshot::Receiver<Result<(), TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Publish,
    Subscribe,
}

#[derive(Debug)]
struct PendingPublish {
    ticket: u64,
    qos: QoS,
    responder: Responder,
    spool_key: Option<SpoolKey>,
    // replayed from the spool: withdrawing it must not delete the entry
    replayed: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    next_ticket: u64,
    queued_publishes: VecDeque<PendingPublish>,
    inflight_publishes: HashMap<u16, PendingPublish>,
    queued_subscribes: VecDeque<(u64, Responder)>,
    inflight_subscribes: HashMap<u16, Responder>,
}

impl TrackerState {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

#[derive(Debug)]
pub(crate) struct AckTracker {
    state: Mutex<TrackerState>,
    spool: Option<Spool>,
}

/// A queued request not yet accepted by the client. Dropping it without
/// calling `sent` takes the waiter back out of the queue.
#[must_use = "dropping an Unsent withdraws the queued request"]
pub(crate) struct Unsent<'a> {
    tracker: &'a AckTracker,
    kind: RequestKind,
    ticket: u64,
    armed: bool,
}

impl Unsent<'_> {
    /// The client took the request; its waiter now follows the event loop.
    pub(crate) fn sent(mut self) {
        self.armed = false;
    }
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.withdraw(self.kind, self.ticket);
        }
    }
}

impl AckTracker {
    pub(crate) fn new(spool: Option<Spool>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            spool,
        }
    }

    pub(crate) fn spool(&self) -> Option<&Spool> {
        self.spool.as_ref()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a publish about to be handed to the client. QoS 1/2 messages
    /// are spooled first unless they come from the spool already.
    pub(crate) fn enqueue_publish(
        &self,
        message: &Message,
        spool_key: Option<SpoolKey>,
    ) -> Result<(Unsent<'_>, Completion), TransportError> {
        let replayed = spool_key.is_some();
        let spool_key = match (spool_key, &self.spool) {
            (Some(key), _) => Some(key),
            (None, Some(spool)) if message.qos.requires_ack() => Some(spool.store(message)?),
            _ => None,
        };

        let (responder, completion) = oneshot::channel();
        let ticket = {
            let mut state = self.lock();
            let ticket = state.ticket();
            state.queued_publishes.push_back(PendingPublish {
                ticket,
                qos: message.qos,
                responder,
                spool_key,
                replayed,
            });
            ticket
        };
        Ok((self.unsent(RequestKind::Publish, ticket), completion))
    }

    /// The event loop wrote a PUBLISH with `pkid`. QoS 0 publishes complete
    /// here.
    pub(crate) fn publish_sent(&self, pkid: u16) {
        let mut state = self.lock();
        let Some(pending) = state.queued_publishes.pop_front() else {
            debug!(pkid, "outgoing publish without a queued waiter");
            return;
        };

        if pending.qos.requires_ack() {
            state.inflight_publishes.insert(pkid, pending);
        } else {
            let _ = pending.responder.send(Ok(()));
        }
    }

    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) arrived. Returns whether a waiter
    /// was completed.
    pub(crate) fn publish_acknowledged(&self, pkid: u16) -> bool {
        let pending = self.lock().inflight_publishes.remove(&pkid);
        match pending {
            Some(pending) => {
                self.forget_spooled(pending.spool_key);
                let _ = pending.responder.send(Ok(()));
                true
            }
            None => {
                debug!(pkid, "acknowledgment for unknown publish");
                false
            }
        }
    }

    pub(crate) fn enqueue_subscribe(&self) -> (Unsent<'_>, Completion) {
        let (responder, completion) = oneshot::channel();
        let ticket = {
            let mut state = self.lock();
            let ticket = state.ticket();
            state.queued_subscribes.push_back((ticket, responder));
            ticket
        };
        (self.unsent(RequestKind::Subscribe, ticket), completion)
    }

    pub(crate) fn subscribe_sent(&self, pkid: u16) {
        let mut state = self.lock();
        match state.queued_subscribes.pop_front() {
            Some((_, responder)) => {
                state.inflight_subscribes.insert(pkid, responder);
            }
            None => debug!(pkid, "outgoing subscribe without a queued waiter"),
        }
    }

    pub(crate) fn subscribe_acknowledged(&self, pkid: u16, result: Result<(), TransportError>) {
        let responder = self.lock().inflight_subscribes.remove(&pkid);
        match responder {
            Some(responder) => {
                let _ = responder.send(result);
            }
            None => debug!(pkid, "acknowledgment for unknown subscribe"),
        }
    }

    /// Fails every waiter. Spooled messages stay on disk for the next session.
    pub(crate) fn fail_all(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let publishes = state
            .queued_publishes
            .drain(..)
            .chain(state.inflight_publishes.drain().map(|(_, p)| p))
            .collect::<Vec<_>>();
        let subscribes = state
            .queued_subscribes
            .drain(..)
            .map(|(_, r)| r)
            .chain(state.inflight_subscribes.drain().map(|(_, r)| r))
            .collect::<Vec<_>>();
        drop(guard);

        for pending in publishes {
            let _ = pending.responder.send(Err(TransportError::Closed));
        }
        for responder in subscribes {
            let _ = responder.send(Err(TransportError::Closed));
        }
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self) -> usize {
        let state = self.lock();
        state.queued_publishes.len()
            + state.inflight_publishes.len()
            + state.queued_subscribes.len()
            + state.inflight_subscribes.len()
    }

    fn unsent(&self, kind: RequestKind, ticket: u64) -> Unsent<'_> {
        Unsent {
            tracker: self,
            kind,
            ticket,
            armed: true,
        }
    }

    fn withdraw(&self, kind: RequestKind, ticket: u64) {
        let mut state = self.lock();
        match kind {
            RequestKind::Publish => {
                let position = state
                    .queued_publishes
                    .iter()
                    .position(|p| p.ticket == ticket);
                let withdrawn = position.and_then(|i| state.queued_publishes.remove(i));
                drop(state);
                if let Some(pending) = withdrawn {
                    debug!(ticket, "withdrew publish that never reached the client");
                    if !pending.replayed {
                        self.forget_spooled(pending.spool_key);
                    }
                }
            }
            RequestKind::Subscribe => {
                let before = state.queued_subscribes.len();
                state.queued_subscribes.retain(|(t, _)| *t != ticket);
                if state.queued_subscribes.len() != before {
                    debug!(ticket, "withdrew subscribe that never reached the client");
                }
            }
        }
    }

    fn forget_spooled(&self, key: Option<SpoolKey>) {
        if let (Some(spool), Some(key)) = (&self.spool, key) {
            if let Err(e) = spool.remove(key) {
                warn!(key = key.0, "failed to remove spooled message: {e}");
            }
        }
    }
}
