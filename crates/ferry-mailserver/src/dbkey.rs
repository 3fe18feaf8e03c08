//! Sortable archive keys.
//!
//! Layout: `timestamp (4, BE) || topic (4) || envelope hash (32)`. Byte
//! order of keys follows timestamp order, so a time range is a key range
//! and the key of the last returned record works as a pagination cursor.
use std::fmt;

use ferry_protocol::types::{HASH_LENGTH, TOPIC_LENGTH};
use ferry_protocol::{Envelope, Hash, TopicType};

use crate::error::StorageError;

const TIMESTAMP_LENGTH: usize = 4;

/// Total key length.
pub const DB_KEY_LENGTH: usize = TIMESTAMP_LENGTH + TOPIC_LENGTH + HASH_LENGTH;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DBKey([u8; DB_KEY_LENGTH]);

impl DBKey {
    pub fn new(timestamp: u32, topic: TopicType, hash: Hash) -> Self {
        let mut raw = [0u8; DB_KEY_LENGTH];
        raw[..TIMESTAMP_LENGTH].copy_from_slice(&timestamp.to_be_bytes());
        raw[TIMESTAMP_LENGTH..TIMESTAMP_LENGTH + TOPIC_LENGTH].copy_from_slice(topic.as_bytes());
        raw[TIMESTAMP_LENGTH + TOPIC_LENGTH..].copy_from_slice(hash.as_bytes());
        Self(raw)
    }

    /// Smallest key with this timestamp.
    pub fn lower_bound(timestamp: u32) -> Self {
        Self::new(timestamp, TopicType::default(), Hash::default())
    }

    /// Parse a stored key or a cursor.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StorageError> {
        <[u8; DB_KEY_LENGTH]>::try_from(bytes)
            .map(Self)
            .map_err(|_| StorageError::Corrupt(format!("db key must be {DB_KEY_LENGTH} bytes, got {}", bytes.len())))
    }

    pub fn timestamp(&self) -> u32 {
        let mut ts = [0u8; TIMESTAMP_LENGTH];
        ts.copy_from_slice(&self.0[..TIMESTAMP_LENGTH]);
        u32::from_be_bytes(ts)
    }

    pub fn topic(&self) -> TopicType {
        TopicType::from_prefix(&self.0[TIMESTAMP_LENGTH..])
    }

    pub fn envelope_hash(&self) -> Hash {
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&self.0[TIMESTAMP_LENGTH + TOPIC_LENGTH..]);
        Hash(hash)
    }

    pub fn as_bytes(&self) -> &[u8; DB_KEY_LENGTH] {
        &self.0
    }

    /// Cursor token handed to clients.
    pub fn cursor(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

/// Envelopes are archived under their sent time.
impl From<&Envelope> for DBKey {
    fn from(envelope: &Envelope) -> Self {
        DBKey::new(envelope.sent(), envelope.topic, envelope.hash())
    }
}

impl fmt::Debug for DBKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DBKey({}, {}, {})", self.timestamp(), self.topic(), self.envelope_hash())
    }
}
