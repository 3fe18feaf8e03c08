//! Handshake capability options.
//!
//! Options travel as an array of `[key, value]` pairs where each value is
//! its own msgpack blob. Decoders skip keys they do not know, so newer
//! peers can add options without breaking older ones. Keys are small
//! integers; the older string names are still accepted on decode.
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;

use crate::bloom::Bloom;
use crate::error::ProtocolError;
use crate::types::{TopicType, BLOOM_FILTER_SIZE, DEFAULT_MIN_POW, MAX_TOPIC_INTEREST, PROTOCOL_VERSION};

const KEY_POW_REQUIREMENT: u64 = 0;
const KEY_BLOOM_FILTER: u64 = 1;
const KEY_LIGHT_NODE: u64 = 2;
const KEY_CONFIRMATIONS: u64 = 3;
const KEY_RATE_LIMITS: u64 = 4;
const KEY_TOPIC_INTEREST: u64 = 5;

const LEGACY_NAMES: [(&str, u64); 6] = [
    ("pow-requirement", KEY_POW_REQUIREMENT),
    ("bloom-filter", KEY_BLOOM_FILTER),
    ("light-node-enabled", KEY_LIGHT_NODE),
    ("confirmations-enabled", KEY_CONFIRMATIONS),
    ("rate-limits", KEY_RATE_LIMITS),
    ("topic-interest", KEY_TOPIC_INTEREST),
];

/// Packet-rate limits a peer advertises (packets per second).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub ip_limits: u64,
    pub peer_id_limits: u64,
    pub topic_limits: u64,
}

impl RateLimits {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum OptionKey {
    Index(u64),
    Name(String),
}

impl OptionKey {
    fn index(&self) -> Option<u64> {
        match self {
            OptionKey::Index(i) => Some(*i),
            OptionKey::Name(name) => LEGACY_NAMES
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, i)| *i),
        }
    }
}

/// Capabilities exchanged in `status` and `statusUpdate` packets.
///
/// Every field is optional: a `status` packet is completed with
/// [`with_defaults`](Self::with_defaults), a `statusUpdate` only touches
/// what it carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusOptions {
    pub pow_requirement: Option<f64>,
    pub bloom_filter: Option<Vec<u8>>,
    pub light_node_enabled: Option<bool>,
    pub confirmations_enabled: Option<bool>,
    pub rate_limits: Option<RateLimits>,
    pub topic_interest: Option<Vec<TopicType>>,
}

impl StatusOptions {
    /// Fill in what an older peer left out.
    pub fn with_defaults(mut self) -> Self {
        self.pow_requirement.get_or_insert(DEFAULT_MIN_POW);
        self.light_node_enabled.get_or_insert(false);
        self.confirmations_enabled.get_or_insert(false);
        self.rate_limits.get_or_insert_with(RateLimits::default);
        if self.bloom_filter.is_none() && self.topic_interest.is_none() {
            self.bloom_filter = Some(Bloom::full().as_bytes().to_vec());
        }
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(pow) = self.pow_requirement {
            if pow.is_nan() || pow.is_infinite() || pow < 0.0 {
                return Err(ProtocolError::InvalidOptions {
                    reason: format!("invalid pow requirement {pow}"),
                });
            }
        }
        if let Some(bloom) = &self.bloom_filter {
            if !bloom.is_empty() && bloom.len() != BLOOM_FILTER_SIZE {
                return Err(ProtocolError::InvalidOptions {
                    reason: format!("wrong bloom filter size {}", bloom.len()),
                });
            }
        }
        if let Some(topics) = &self.topic_interest {
            if topics.len() > MAX_TOPIC_INTEREST {
                return Err(ProtocolError::InvalidOptions {
                    reason: format!("too many topics of interest: {}", topics.len()),
                });
            }
        }
        Ok(())
    }

    fn to_entries(&self) -> Result<Vec<(OptionKey, ByteBuf)>, rmp_serde::encode::Error> {
        fn entry<T: Serialize>(key: u64, value: &T) -> Result<(OptionKey, ByteBuf), rmp_serde::encode::Error> {
            Ok((OptionKey::Index(key), ByteBuf::from(rmp_serde::to_vec(value)?)))
        }

        let mut entries = Vec::new();
        if let Some(pow) = self.pow_requirement {
            entries.push(entry(KEY_POW_REQUIREMENT, &pow.to_bits())?);
        }
        if let Some(bloom) = &self.bloom_filter {
            entries.push(entry(KEY_BLOOM_FILTER, &serde_bytes::Bytes::new(bloom))?);
        }
        if let Some(light) = self.light_node_enabled {
            entries.push(entry(KEY_LIGHT_NODE, &light)?);
        }
        if let Some(confirmations) = self.confirmations_enabled {
            entries.push(entry(KEY_CONFIRMATIONS, &confirmations)?);
        }
        if let Some(limits) = &self.rate_limits {
            entries.push(entry(KEY_RATE_LIMITS, limits)?);
        }
        if let Some(topics) = &self.topic_interest {
            entries.push(entry(KEY_TOPIC_INTEREST, topics)?);
        }
        Ok(entries)
    }

    fn from_entries(entries: Vec<(OptionKey, ByteBuf)>) -> Result<Self, rmp_serde::decode::Error> {
        let mut opts = Self::default();
        for (key, value) in entries {
            let Some(index) = key.index() else {
                tracing::trace!(?key, "skipping unknown status option");
                continue;
            };
            match index {
                KEY_POW_REQUIREMENT => {
                    let bits: u64 = rmp_serde::from_slice(&value)?;
                    opts.pow_requirement = Some(f64::from_bits(bits));
                }
                KEY_BLOOM_FILTER => {
                    let bloom: ByteBuf = rmp_serde::from_slice(&value)?;
                    opts.bloom_filter = Some(bloom.into_vec());
                }
                KEY_LIGHT_NODE => opts.light_node_enabled = Some(rmp_serde::from_slice(&value)?),
                KEY_CONFIRMATIONS => opts.confirmations_enabled = Some(rmp_serde::from_slice(&value)?),
                KEY_RATE_LIMITS => opts.rate_limits = Some(rmp_serde::from_slice(&value)?),
                KEY_TOPIC_INTEREST => opts.topic_interest = Some(rmp_serde::from_slice(&value)?),
                other => tracing::trace!(key = other, "skipping unknown status option"),
            }
        }
        Ok(opts)
    }
}

impl Serialize for StatusOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_entries().map_err(S::Error::custom)?.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StatusOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<(OptionKey, ByteBuf)>::deserialize(deserializer)?;
        Self::from_entries(entries).map_err(D::Error::custom)
    }
}

/// Payload of the `status` packet.
pub fn encode_status(options: &StatusOptions) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec(&(PROTOCOL_VERSION, options))?)
}

/// Decode a `status` payload into the peer's version and options.
pub fn decode_status(payload: &[u8]) -> Result<(u64, StatusOptions), ProtocolError> {
    let (version, options): (u64, StatusOptions) =
        rmp_serde::from_slice(payload).map_err(|e| ProtocolError::Handshake {
            reason: format!("failed to decode status packet: {e}"),
        })?;
    Ok((version, options))
}

pub fn encode_options(options: &StatusOptions) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec(options)?)
}

pub fn decode_options(payload: &[u8]) -> Result<StatusOptions, ProtocolError> {
    rmp_serde::from_slice(payload).map_err(|e| ProtocolError::InvalidOptions {
        reason: e.to_string(),
    })
}
