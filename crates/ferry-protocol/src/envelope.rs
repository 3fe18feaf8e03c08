use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bloom::Bloom;
use crate::error::ProtocolError;
use crate::types::{Hash, TopicType, ENVELOPE_HEADER_LENGTH};

/// The unit of dissemination.
///
/// Serialized as a MessagePack array `[expiry, ttl, topic, data, nonce]`.
/// `data` is opaque here: sealing and opening live in [`crate::message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// UNIX seconds after which the envelope is dropped (`sent + ttl`).
    pub expiry: u32,
    /// Time-to-live in seconds.
    pub ttl: u32,
    pub topic: TopicType,
    /// Encrypted, padded, optionally signed payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Proof-of-work solution.
    pub nonce: u64,
}

impl Envelope {
    /// New unsealed envelope sent at `now`.
    pub fn new(ttl: u32, topic: TopicType, data: Vec<u8>, now: u32) -> Self {
        Self {
            expiry: now.saturating_add(ttl),
            ttl,
            topic,
            data,
            nonce: 0,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let env: Self = rmp_serde::from_slice(data)?;
        if env.expiry < env.ttl {
            return Err(ProtocolError::Deserialization(format!(
                "expiry {} precedes ttl {}",
                env.expiry, env.ttl
            )));
        }
        Ok(env)
    }

    /// Identity of the envelope: SHA-256 over its serialized form.
    pub fn hash(&self) -> Hash {
        let encoded = rmp_serde::to_vec(self)
            .expect("msgpack encoding of plain integer and byte fields into a Vec cannot fail");
        Hash::digest(&encoded)
    }

    /// Moment the envelope was created.
    pub fn sent(&self) -> u32 {
        self.expiry.saturating_sub(self.ttl)
    }

    /// Size used by the PoW formula and the max-size check.
    pub fn size(&self) -> usize {
        ENVELOPE_HEADER_LENGTH + self.data.len()
    }

    pub fn bloom(&self) -> Bloom {
        Bloom::from_topic(&self.topic)
    }

    /// Proof of work: `2^leading_zero_bits / (size * ttl)`.
    pub fn pow(&self) -> f64 {
        self.pow_with_credit(0)
    }

    /// PoW with `credit` seconds added to the TTL, used for envelopes that
    /// arrive slightly ahead of our clock.
    pub fn pow_with_credit(&self, credit: u32) -> f64 {
        let mut preimage = self.pow_preimage();
        preimage.extend_from_slice(&self.nonce.to_be_bytes());
        let zeros = leading_zero_bits(&Sha256::digest(&preimage));
        let ttl = u64::from(self.ttl) + u64::from(credit);
        2f64.powi(zeros as i32) / self.size() as f64 / ttl.max(1) as f64
    }

    /// Mine a nonce reaching `target` PoW, spending at most `work_time`.
    ///
    /// A non-positive target skips mining. Keeps the best nonce found even
    /// when the target is missed.
    pub fn seal(&mut self, target: f64, work_time: Duration) -> Result<(), ProtocolError> {
        if target <= 0.0 {
            return Ok(());
        }
        let target_bits = self.pow_to_first_bit(target);
        let mut buf = self.pow_preimage();
        let nonce_at = buf.len();
        buf.extend_from_slice(&[0u8; 8]);

        let deadline = Instant::now() + work_time;
        let mut best_bits = 0u32;
        let mut nonce = 0u64;
        while Instant::now() < deadline {
            for _ in 0..1024 {
                buf[nonce_at..].copy_from_slice(&nonce.to_be_bytes());
                let bits = leading_zero_bits(&Sha256::digest(&buf));
                if bits > best_bits {
                    best_bits = bits;
                    self.nonce = nonce;
                    if best_bits >= target_bits {
                        return Ok(());
                    }
                }
                nonce = nonce.wrapping_add(1);
            }
        }
        Err(ProtocolError::PowTargetNotReached {
            seconds: work_time.as_secs(),
        })
    }

    fn pow_to_first_bit(&self, pow: f64) -> u32 {
        let x = pow * self.size() as f64 * f64::from(self.ttl.max(1));
        let bits = x.log2().ceil();
        if bits < 1.0 {
            1
        } else {
            bits as u32
        }
    }

    /// Fields covered by the PoW, without the nonce.
    fn pow_preimage(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.data.len());
        buf.extend_from_slice(&self.expiry.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());
        buf.extend_from_slice(self.topic.as_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut zeros = 0;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}
