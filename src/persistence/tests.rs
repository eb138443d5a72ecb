use super::Spool;
use crate::manager::message::{Message, QoS};

use tempfile::tempdir;

fn create_test_spool(dir: &std::path::Path, client_id: &str) -> Spool {
    let db = Spool::open_db(dir).unwrap();
    Spool::new(db, client_id).unwrap()
}

#[test]
fn test_store_and_load_message() {
    let dir = tempdir().unwrap();
    let spool = create_test_spool(dir.path(), "client-a");

    spool
        .store(&Message::new("sensors/1", b"hello".to_vec(), QoS::AtLeastOnce))
        .unwrap();

    let pending = spool.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1.topic, "sensors/1");
    assert_eq!(pending[0].1.payload, b"hello");
    assert_eq!(pending[0].1.qos, QoS::AtLeastOnce);
}

#[test]
fn test_pending_keeps_send_order() {
    let dir = tempdir().unwrap();
    let spool = create_test_spool(dir.path(), "client-a");

    for i in 0..5 {
        spool
            .store(&Message::new("t", format!("msg{i}"), QoS::ExactlyOnce))
            .unwrap();
    }

    let payloads: Vec<_> = spool
        .pending()
        .into_iter()
        .map(|(_, m)| String::from_utf8(m.payload).unwrap())
        .collect();
    assert_eq!(payloads, vec!["msg0", "msg1", "msg2", "msg3", "msg4"]);
}

#[test]
fn test_remove_acknowledged_message() {
    let dir = tempdir().unwrap();
    let spool = create_test_spool(dir.path(), "client-a");

    let first = spool
        .store(&Message::new("t", b"one".to_vec(), QoS::AtLeastOnce))
        .unwrap();
    spool
        .store(&Message::new("t", b"two".to_vec(), QoS::AtLeastOnce))
        .unwrap();

    spool.remove(first).unwrap();

    let pending = spool.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1.payload, b"two");
}

#[test]
fn test_clients_are_isolated() {
    let dir = tempdir().unwrap();
    let db = Spool::open_db(dir.path()).unwrap();
    let a = Spool::new(db.clone(), "client-a").unwrap();
    let b = Spool::new(db, "client-b").unwrap();

    a.store(&Message::new("t", b"a".to_vec(), QoS::AtLeastOnce))
        .unwrap();

    assert_eq!(a.len(), 1);
    assert!(b.is_empty());

    a.clear().unwrap();
    assert!(a.is_empty());
}

#[test]
fn test_new_spool_on_same_db_sees_pending() {
    let dir = tempdir().unwrap();
    let db = Spool::open_db(dir.path()).unwrap();

    let first = Spool::new(db.clone(), "client-a").unwrap();
    first
        .store(&Message::new("t", b"unacked".to_vec(), QoS::ExactlyOnce))
        .unwrap();
    drop(first);

    let second = Spool::new(db, "client-a").unwrap();
    let pending = second.pending();
    assert_eq!(pending.len(), 1);
    let message: Message = pending[0].1.clone().into();
    assert_eq!(message, Message::new("t", b"unacked".to_vec(), QoS::ExactlyOnce));
}
