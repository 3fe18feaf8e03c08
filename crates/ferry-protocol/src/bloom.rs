//! Bloom filters over 4-byte topics.
//!
//! Each topic sets three bits of a 512-bit vector. A filter `f` matches a
//! sample `s` when every bit of `s` is also set in `f`; an absent filter
//! matches everything.
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{TopicType, BLOOM_FILTER_SIZE};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bloom([u8; BLOOM_FILTER_SIZE]);

impl Bloom {
    /// Matches nothing.
    pub const fn empty() -> Self {
        Self([0u8; BLOOM_FILTER_SIZE])
    }

    /// Matches everything: the filter of a full node.
    pub const fn full() -> Self {
        Self([0xFF; BLOOM_FILTER_SIZE])
    }

    pub const fn from_bytes(bytes: [u8; BLOOM_FILTER_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a wire bloom. Only exactly `BLOOM_FILTER_SIZE` bytes are valid.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; BLOOM_FILTER_SIZE]>::try_from(bytes).ok().map(Self)
    }

    /// The three-bit sample for one topic.
    pub fn from_topic(topic: &TopicType) -> Self {
        let mut bloom = [0u8; BLOOM_FILTER_SIZE];
        let t = topic.as_bytes();
        for j in 0..3 {
            let mut index = usize::from(t[j]);
            if t[3] & (1 << j) != 0 {
                index += 256;
            }
            bloom[index / 8] |= 1 << (index % 8);
        }
        Self(bloom)
    }

    /// Aggregate filter for a set of topics.
    pub fn from_topics<'a>(topics: impl IntoIterator<Item = &'a TopicType>) -> Self {
        topics
            .into_iter()
            .fold(Self::empty(), |acc, t| acc.add(&Self::from_topic(t)))
    }

    pub fn as_bytes(&self) -> &[u8; BLOOM_FILTER_SIZE] {
        &self.0
    }

    pub fn is_full(&self) -> bool {
        self.0.iter().all(|b| *b == 0xFF)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// True when every bit of `sample` is set in `self`.
    pub fn matches(&self, sample: &Bloom) -> bool {
        self.0.iter().zip(sample.0.iter()).all(|(f, s)| f | s == *f)
    }

    /// Bitwise OR of two filters.
    pub fn add(&self, other: &Bloom) -> Bloom {
        let mut out = self.0;
        for (o, b) in out.iter_mut().zip(other.0.iter()) {
            *o |= b;
        }
        Self(out)
    }
}

/// Match a possibly-absent filter against a sample. Full-node filters
/// accept every sample without a bitwise check.
pub fn bloom_filter_match(filter: Option<&Bloom>, sample: &Bloom) -> bool {
    is_full_node(filter) || filter.map_or(false, |f| f.matches(sample))
}

/// A wire bloom of zero length or all ones denotes a full node.
pub fn is_full_node(bloom: Option<&Bloom>) -> bool {
    bloom.map_or(true, Bloom::is_full)
}

impl Default for Bloom {
    fn default() -> Self {
        Self::full()
    }
}

impl fmt::Debug for Bloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full() {
            f.write_str("Bloom(full)")
        } else {
            write!(f, "Bloom({})", hex::encode(self.0))
        }
    }
}

impl Serialize for Bloom {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Bloom {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Self::from_slice(&buf)
            .ok_or_else(|| serde::de::Error::invalid_length(buf.len(), &"64 bytes"))
    }
}
