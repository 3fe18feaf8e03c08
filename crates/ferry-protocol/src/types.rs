//! Core value types and protocol constants shared across the crate.
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire protocol version exchanged in the status handshake.
pub const PROTOCOL_VERSION: u64 = 1;

/// Topic length in bytes.
pub const TOPIC_LENGTH: usize = 4;

/// Bloom filter size in bytes.
pub const BLOOM_FILTER_SIZE: usize = 64;

/// Envelope hash length in bytes.
pub const HASH_LENGTH: usize = 32;

/// Fixed envelope overhead counted by the PoW size term.
pub const ENVELOPE_HEADER_LENGTH: usize = 20;

/// Default minimal PoW required by a node.
pub const DEFAULT_MIN_POW: f64 = 0.2;

/// Default envelope time-to-live in seconds.
pub const DEFAULT_TTL: u32 = 50;

/// Maximum clock skew tolerated between peers, in seconds.
pub const DEFAULT_SYNC_ALLOWANCE: u32 = 10;

/// Period of pool-wide and per-peer expiry sweeps.
pub const EXPIRATION_CYCLE: Duration = Duration::from_secs(1);

/// Period of per-peer broadcast.
pub const TRANSMISSION_CYCLE: Duration = Duration::from_millis(300);

/// Capacity of the local delivery queues.
pub const MESSAGE_QUEUE_LIMIT: usize = 1024;

/// Upper bound on topics a peer may advertise.
pub const MAX_TOPIC_INTEREST: usize = 10_000;

/// Upper bound on `limit` in a structured messages request.
pub const MAX_LIMIT_IN_MESSAGES_REQUEST: u32 = 1000;

/// Current UNIX time in seconds.
pub fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            /// Build from a slice of exactly the right length.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; $len]>::try_from(bytes).ok().map(Self)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{})", stringify!($name), hex::encode(self.0))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
                Self::from_slice(&buf).ok_or_else(|| {
                    serde::de::Error::invalid_length(buf.len(), &stringify!($len))
                })
            }
        }
    };
}

fixed_bytes!(
    /// 32-byte SHA-256 digest identifying an envelope or a batch.
    Hash,
    HASH_LENGTH
);

fixed_bytes!(
    /// 4-byte envelope topic.
    TopicType,
    TOPIC_LENGTH
);

impl Hash {
    /// SHA-256 of arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        Self(Sha256::digest(data).into())
    }
}

impl TopicType {
    /// Build a topic from the first four bytes of `bytes`, zero-padded.
    pub fn from_prefix(bytes: &[u8]) -> Self {
        let mut topic = [0u8; TOPIC_LENGTH];
        let n = bytes.len().min(TOPIC_LENGTH);
        topic[..n].copy_from_slice(&bytes[..n]);
        Self(topic)
    }
}
