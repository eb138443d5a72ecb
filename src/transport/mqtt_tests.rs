//! `MqttTransport` against a scripted broker on an ephemeral port.
//!
//! The broker side speaks just enough MQTT 3.1.1 for these tests: CONNACK,
//! PUBACK, PUBREC/PUBCOMP, SUBACK and plain QoS 0 PUBLISH.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tempfile::tempdir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::{BrokerTransport, MqttTransport, MqttTransportFactory};
use crate::config::ClientSettings;
use crate::manager::ConnectionManager;
use crate::manager::message::{Message, QoS};
use crate::manager::session::{ConnectOptions, SessionState, SessionStatus};
use crate::persistence::Spool;
use crate::router::CallbackRouter;
use crate::utils::error::{ConnectionError, TransportError};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum Packet {
    Connect,
    Publish {
        qos: u8,
        pkid: u16,
        topic: String,
        payload: Vec<u8>,
    },
    PubRel(u16),
    Subscribe {
        pkid: u16,
        filter: String,
    },
    Disconnect,
    Other,
}

async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Option<Packet> {
    let header = stream.read_u8().await.ok()?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.ok()?;
    Some(parse(header, &body))
}

fn u16_at(body: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([body[at], body[at + 1]])
}

fn parse(header: u8, body: &[u8]) -> Packet {
    match header >> 4 {
        1 => Packet::Connect,
        3 => {
            let qos = (header >> 1) & 0x03;
            let topic_end = 2 + usize::from(u16_at(body, 0));
            let topic = String::from_utf8_lossy(&body[2..topic_end]).into_owned();
            let (pkid, payload_start) = if qos > 0 {
                (u16_at(body, topic_end), topic_end + 2)
            } else {
                (0, topic_end)
            };
            Packet::Publish {
                qos,
                pkid,
                topic,
                payload: body[payload_start..].to_vec(),
            }
        }
        6 => Packet::PubRel(u16_at(body, 0)),
        8 => {
            let filter_end = 4 + usize::from(u16_at(body, 2));
            Packet::Subscribe {
                pkid: u16_at(body, 0),
                filter: String::from_utf8_lossy(&body[4..filter_end]).into_owned(),
            }
        }
        14 => Packet::Disconnect,
        _ => Packet::Other,
    }
}

fn ack(kind: u8, pkid: u16) -> Vec<u8> {
    let [hi, lo] = pkid.to_be_bytes();
    vec![kind, 0x02, hi, lo]
}

fn suback(pkid: u16, code: u8) -> Vec<u8> {
    let [hi, lo] = pkid.to_be_bytes();
    vec![0x90, 0x03, hi, lo, code]
}

// short packets only: the remaining length must fit in one byte
fn inbound_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8];
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

async fn listen(client_id: &str) -> (TcpListener, ConnectOptions) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let port = listener.local_addr().unwrap().port();
    let options = ConnectOptions::new(&format!("127.0.0.1:{port}"), client_id).unwrap();
    (listener, options)
}

/// Accepts one client and answers its CONNECT.
async fn accept(listener: &TcpListener, session_present: bool) -> TcpStream {
    let (mut stream, _) = listener.accept().await.expect("accept client");
    assert_eq!(read_packet(&mut stream).await, Some(Packet::Connect));
    stream
        .write_all(&[0x20, 0x02, u8::from(session_present), 0x00])
        .await
        .expect("write CONNACK");
    stream
}

/// Reads packets on a task of its own so the broker side can wait on other
/// things without cutting a packet in half.
fn split(stream: TcpStream) -> (mpsc::UnboundedReceiver<Packet>, OwnedWriteHalf) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(packet) = read_packet(&mut reader).await {
            if tx.send(packet).is_err() {
                break;
            }
        }
    });
    (rx, writer)
}

/// Acknowledges everything, refuses filters under `forbidden/` and answers a
/// subscription to `greetings` with one message. Every packet is reported on
/// `seen`.
async fn serve(
    mut packets: mpsc::UnboundedReceiver<Packet>,
    mut writer: OwnedWriteHalf,
    seen: mpsc::UnboundedSender<Packet>,
) {
    while let Some(packet) = packets.recv().await {
        let reply = match &packet {
            Packet::Publish { qos: 1, pkid, .. } => ack(0x40, *pkid),
            Packet::Publish { qos: 2, pkid, .. } => ack(0x50, *pkid),
            Packet::PubRel(pkid) => ack(0x70, *pkid),
            Packet::Subscribe { pkid, filter } if filter.starts_with("forbidden/") => {
                suback(*pkid, 0x80)
            }
            Packet::Subscribe { pkid, filter } => {
                let mut reply = suback(*pkid, 0x01);
                if filter == "greetings" {
                    reply.extend(inbound_publish("greetings", b"hello"));
                }
                reply
            }
            _ => Vec::new(),
        };
        let _ = seen.send(packet);
        if !reply.is_empty() && writer.write_all(&reply).await.is_err() {
            break;
        }
    }
}

fn spawn_broker(
    listener: TcpListener,
    session_present: bool,
) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedReceiver<Packet>) {
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let broker = tokio::spawn(async move {
        let stream = accept(&listener, session_present).await;
        let (packets, writer) = split(stream);
        serve(packets, writer, seen_tx).await;
    });
    (broker, seen)
}

fn bound_router(transport: &MqttTransport) -> (Arc<CallbackRouter>, Arc<SessionStatus>) {
    let router = Arc::new(CallbackRouter::new());
    let status = Arc::new(SessionStatus::new());
    assert!(status.transition(SessionState::Connecting));
    transport.set_sink(router.bind(status.clone()));
    (router, status)
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_publish_subscribe_and_inbound_messages() {
    let (listener, options) = listen("round-trip").await;
    let (broker, mut seen) = spawn_broker(listener, false);

    let transport = MqttTransport::new(None, 8);
    let (router, status) = bound_router(&transport);
    let mut inbox = router.register();
    let mut deliveries = router.deliveries();

    timeout(WAIT, transport.open(&options)).await.unwrap().unwrap();
    assert!(transport.is_connected());
    assert!(status.transition(SessionState::Connected));

    for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
        timeout(WAIT, transport.publish("sensors/t1", qos, b"21.5"))
            .await
            .unwrap()
            .unwrap();
    }

    // QoS 1 and QoS 2 publishes are confirmed with their packet ids
    let first = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
    assert_ne!(first, second);

    timeout(WAIT, transport.subscribe("greetings", QoS::AtLeastOnce))
        .await
        .unwrap()
        .unwrap();
    let message = timeout(WAIT, inbox.recv()).await.unwrap();
    assert_eq!(
        message,
        Some(Message::new("greetings", b"hello".to_vec(), QoS::AtMostOnce))
    );

    let refused = timeout(WAIT, transport.subscribe("forbidden/x", QoS::AtMostOnce))
        .await
        .unwrap();
    assert!(matches!(refused, Err(TransportError::Rejected(_))));

    timeout(WAIT, transport.close()).await.unwrap().unwrap();
    assert!(!transport.is_connected());
    timeout(WAIT, broker).await.unwrap().unwrap();

    let mut packets = Vec::new();
    while let Ok(packet) = seen.try_recv() {
        packets.push(packet);
    }
    let published: Vec<(u8, String, Vec<u8>)> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Publish {
                qos,
                topic,
                payload,
                ..
            } => Some((*qos, topic.clone(), payload.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        published,
        vec![
            (0, "sensors/t1".to_string(), b"21.5".to_vec()),
            (1, "sensors/t1".to_string(), b"21.5".to_vec()),
            (2, "sensors/t1".to_string(), b"21.5".to_vec()),
        ]
    );
    assert_eq!(packets.last(), Some(&Packet::Disconnect));
    // a requested close is not a lost connection
    assert_eq!(status.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_broker_dropping_the_socket_closes_the_session() {
    let (listener, options) = listen("dropped").await;
    let broker = tokio::spawn(async move {
        let mut stream = accept(&listener, false).await;
        read_packet(&mut stream).await
    });

    let settings = ClientSettings::default();
    let factory = MqttTransportFactory::new(&settings).unwrap();
    let manager = ConnectionManager::new(Arc::new(factory), &settings);

    manager.connect(options).await.unwrap();
    manager
        .publish("sensors/t1", QoS::AtMostOnce, b"last words")
        .await
        .unwrap();

    let received = timeout(WAIT, broker).await.unwrap().unwrap();
    assert!(matches!(received, Some(Packet::Publish { qos: 0, .. })));

    timeout(WAIT, async {
        while manager.state().await != SessionState::Closed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session closed after the broker went away");

    let err = manager
        .publish("sensors/t1", QoS::AtMostOnce, b"too late")
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::NotConnected(SessionState::Closed)));
}

#[tokio::test]
async fn test_resumed_session_replays_spool() {
    let dir = tempdir().unwrap();
    let spool = Spool::new(Spool::open_db(dir.path()).unwrap(), "resumer").unwrap();
    spool
        .store(&Message::new("backlog", b"pending".to_vec(), QoS::AtLeastOnce))
        .unwrap();

    let (listener, options) = listen("resumer").await;
    let options = options.with_clean_start(false);
    let (_broker, mut seen) = spawn_broker(listener, true);

    let transport = MqttTransport::new(Some(spool.clone()), 8);
    timeout(WAIT, transport.open(&options)).await.unwrap().unwrap();

    let replayed = timeout(WAIT, seen.recv()).await.unwrap();
    assert!(matches!(
        replayed,
        Some(Packet::Publish { qos: 1, ref topic, ref payload, .. })
            if topic == "backlog" && payload == b"pending"
    ));

    // removed once the broker acknowledged it
    eventually(|| spool.is_empty()).await;
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_clean_start_discards_spool() {
    let dir = tempdir().unwrap();
    let spool = Spool::new(Spool::open_db(dir.path()).unwrap(), "fresh").unwrap();
    spool
        .store(&Message::new("stale", b"old".to_vec(), QoS::AtLeastOnce))
        .unwrap();

    let (listener, options) = listen("fresh").await;
    let (_broker, _seen) = spawn_broker(listener, false);

    let transport = MqttTransport::new(Some(spool.clone()), 8);
    timeout(WAIT, transport.open(&options)).await.unwrap().unwrap();
    assert!(spool.is_empty());
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_abandoned_on_a_full_request_channel() {
    let (listener, options) = listen("backlog").await;
    let (release_tx, mut release_rx) = oneshot::channel::<()>();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    let _broker = tokio::spawn(async move {
        let stream = accept(&listener, false).await;
        let (mut packets, mut writer) = split(stream);

        // take publishes without acknowledging them until released
        let mut held = Vec::new();
        loop {
            tokio::select! {
                Some(packet) = packets.recv() => {
                    if let Packet::Publish { qos: 1, pkid, .. } = packet {
                        held.push(pkid);
                    }
                }
                _ = &mut release_rx => break,
            }
        }
        for pkid in held {
            writer.write_all(&ack(0x40, pkid)).await.unwrap();
        }
        serve(packets, writer, seen_tx).await;
    });

    // one free slot in the request channel: once rumqttc stops taking
    // requests (inflight window full) the next sender blocks
    let transport = MqttTransport::new(None, 1);
    timeout(WAIT, transport.open(&options)).await.unwrap().unwrap();

    let backlog = join_all((0..110).map(|_| {
        timeout(
            Duration::from_millis(300),
            transport.publish("backlog", QoS::AtLeastOnce, b"queued"),
        )
    }))
    .await;
    assert!(backlog.iter().all(|r| r.is_err()));

    release_tx.send(()).unwrap();

    let after = timeout(WAIT, transport.publish("after", QoS::AtMostOnce, b"x")).await;
    assert!(matches!(after, Ok(Ok(()))));
    let after_ack = timeout(WAIT, transport.publish("after", QoS::AtLeastOnce, b"y")).await;
    assert!(matches!(after_ack, Ok(Ok(()))));

    let mut topics = Vec::new();
    while let Ok(packet) = seen.try_recv() {
        if let Packet::Publish { topic, .. } = packet {
            topics.push(topic);
        }
    }
    assert!(topics.iter().any(|t| t == "after"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_close_after_open_was_cut_short_returns_promptly() {
    let dir = tempdir().unwrap();
    let spool = Spool::new(Spool::open_db(dir.path()).unwrap(), "cut-short").unwrap();
    // more than the inflight window plus the request channel can take
    for _ in 0..110 {
        spool
            .store(&Message::new("backlog", b"pending".to_vec(), QoS::AtLeastOnce))
            .unwrap();
    }

    let (listener, options) = listen("cut-short").await;
    let options = options.with_clean_start(false);
    let _broker = tokio::spawn(async move {
        let stream = accept(&listener, true).await;
        let (mut packets, _writer) = split(stream);
        // never acknowledges anything
        while packets.recv().await.is_some() {}
    });

    let transport = MqttTransport::new(Some(spool.clone()), 1);
    let cut_short = timeout(Duration::from_millis(500), transport.open(&options)).await;
    assert!(cut_short.is_err());

    let started = std::time::Instant::now();
    timeout(WAIT, transport.close()).await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!transport.is_connected());
    // nothing was acknowledged, so nothing left the spool
    assert_eq!(spool.len(), 110);
}
