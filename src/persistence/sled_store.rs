use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use crate::manager::message::{Message, QoS};
use crate::utils::error::SpoolError;

/// Key of a spooled message. Keys grow monotonically so iteration order is
/// send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpoolKey(pub u64);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SpooledMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub stored_at: i64,
}

impl From<SpooledMessage> for Message {
    fn from(spooled: SpooledMessage) -> Self {
        Message::new(spooled.topic, spooled.payload, spooled.qos)
    }
}

/// Unacknowledged QoS 1/2 publishes of one client identifier.
#[derive(Clone)]
pub struct Spool {
    db: Db,
    tree: Tree,
    client_id: String,
}

impl Spool {
    /// Opens the spool database under `dir`.
    pub fn open_db(dir: &Path) -> Result<Db, SpoolError> {
        Ok(sled::open(dir)?)
    }

    pub fn new(db: Db, client_id: &str) -> Result<Self, SpoolError> {
        let tree = db.open_tree(format!("outbound/{client_id}"))?;
        Ok(Self {
            db,
            tree,
            client_id: client_id.to_string(),
        })
    }

    pub fn store(&self, message: &Message) -> Result<SpoolKey, SpoolError> {
        let record = SpooledMessage {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            stored_at: Utc::now().timestamp_millis(),
        };
        let serialized = serde_json::to_vec(&record)?;

        let key = SpoolKey(self.db.generate_id()?);
        self.tree.insert(key.0.to_be_bytes(), serialized)?;
        self.tree.flush()?;
        debug!(client_id = %self.client_id, key = key.0, topic = %record.topic, "spooled message");
        Ok(key)
    }

    pub fn remove(&self, key: SpoolKey) -> Result<(), SpoolError> {
        self.tree.remove(key.0.to_be_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    /// Spooled messages in send order. Unreadable entries are skipped.
    pub fn pending(&self) -> Vec<(SpoolKey, SpooledMessage)> {
        self.tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, val)| {
                let key: [u8; 8] = key.as_ref().try_into().ok()?;
                let record: SpooledMessage = serde_json::from_slice(&val).ok()?;
                Some((SpoolKey(u64::from_be_bytes(key)), record))
            })
            .collect()
    }

    pub fn clear(&self) -> Result<(), SpoolError> {
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl std::fmt::Debug for Spool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spool")
            .field("db", &"sled::Db")
            .field("client_id", &self.client_id)
            .finish()
    }
}
