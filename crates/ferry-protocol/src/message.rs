//! Sealing application payloads into envelopes and opening them again.
//!
//! Plaintext layout before encryption:
//!
//! ```text
//! flags (1) || payload length (4, BE) || payload || padding || [pubkey (32) || signature (64)]
//! ```
//!
//! Bit 0 of `flags` marks a signed message. The signature covers every byte
//! before the public key. Without caller-supplied padding the plaintext is
//! padded with random bytes to a multiple of [`PADDING_BLOCK`].
use std::time::Duration;

use crate::crypto::{self, EncryptedPayload, SIGNATURE_LENGTH, SYM_KEY_LENGTH};
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::types::{Hash, TopicType, DEFAULT_TTL};

/// Plaintext length granularity.
pub const PADDING_BLOCK: usize = 256;

const FLAG_SIGNED: u8 = 0x01;
const HEADER_LENGTH: usize = 5;
const SIGNATURE_TRAILER: usize = 32 + SIGNATURE_LENGTH;

/// Who can read a sealed message.
#[derive(Clone, PartialEq, Eq)]
pub enum Destination {
    /// Anyone holding the shared key.
    Symmetric([u8; SYM_KEY_LENGTH]),
    /// The holder of the Ed25519 identity `public_key`.
    Asymmetric { public_key: [u8; 32] },
}

/// Key used on the receiving side.
#[derive(Clone, PartialEq, Eq)]
pub enum OpeningKey {
    Symmetric([u8; SYM_KEY_LENGTH]),
    /// Ed25519 seed of the recipient identity.
    Asymmetric { seed: [u8; 32] },
}

impl OpeningKey {
    /// Stable identity used to share one decryption across filters with the
    /// same key.
    pub fn fingerprint(&self) -> Hash {
        match self {
            OpeningKey::Symmetric(key) => Hash::digest(key),
            OpeningKey::Asymmetric { seed } => Hash(crypto::public_key(seed)),
        }
    }
}

impl std::fmt::Debug for OpeningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpeningKey::Symmetric(_) => f.write_str("OpeningKey::Symmetric(..)"),
            OpeningKey::Asymmetric { seed } => {
                write!(f, "OpeningKey::Asymmetric({})", hex::encode(crypto::public_key(seed)))
            }
        }
    }
}

/// Everything needed to wrap a payload into an envelope.
#[derive(Clone)]
pub struct MessageParams {
    pub topic: TopicType,
    pub ttl: u32,
    pub payload: Vec<u8>,
    /// Explicit padding. Empty means random padding to the block size.
    pub padding: Vec<u8>,
    /// Ed25519 seed to sign with, if any.
    pub src: Option<[u8; 32]>,
    pub dst: Destination,
    /// Target PoW; `0.0` disables mining.
    pub pow: f64,
    /// Mining budget.
    pub work_time: Duration,
}

impl MessageParams {
    pub fn new(topic: TopicType, payload: Vec<u8>, dst: Destination) -> Self {
        Self {
            topic,
            ttl: DEFAULT_TTL,
            payload,
            padding: Vec::new(),
            src: None,
            dst,
            pow: 0.0,
            work_time: Duration::from_secs(1),
        }
    }
}

/// A decrypted message delivered to a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub hash: Hash,
    pub topic: TopicType,
    pub payload: Vec<u8>,
    pub padding: Vec<u8>,
    /// Signer's Ed25519 public key when the signature verified.
    pub src: Option<[u8; 32]>,
    /// Fingerprint of the key that opened the message.
    pub key_fingerprint: Hash,
    pub pow: f64,
    pub sent: u32,
    pub ttl: u32,
    /// Delivered directly by a trusted peer instead of gossip.
    pub p2p: bool,
}

/// Build, encrypt and seal an envelope sent at `now`.
pub fn wrap(params: &MessageParams, now: u32) -> Result<Envelope, ProtocolError> {
    let payload_len = u32::try_from(params.payload.len())
        .map_err(|_| ProtocolError::Crypto("payload too large".into()))?;

    let mut plain = Vec::with_capacity(PADDING_BLOCK);
    plain.push(if params.src.is_some() { FLAG_SIGNED } else { 0 });
    plain.extend_from_slice(&payload_len.to_be_bytes());
    plain.extend_from_slice(&params.payload);

    if params.padding.is_empty() {
        let trailer = if params.src.is_some() { SIGNATURE_TRAILER } else { 0 };
        let unpadded = plain.len() + trailer;
        let pad = (PADDING_BLOCK - unpadded % PADDING_BLOCK) % PADDING_BLOCK;
        let mut random = vec![0u8; pad];
        crypto::random_bytes(&mut random);
        plain.extend_from_slice(&random);
    } else {
        plain.extend_from_slice(&params.padding);
    }

    if let Some(seed) = &params.src {
        let signature = crypto::sign(&plain, seed);
        plain.extend_from_slice(&crypto::public_key(seed));
        plain.extend_from_slice(&signature);
    }

    let data = match &params.dst {
        Destination::Symmetric(key) => crypto::encrypt_symmetric(&plain, key)?,
        Destination::Asymmetric { public_key } => {
            crypto::encrypt_asymmetric(&plain, public_key)?.to_bytes()?
        }
    };

    let mut envelope = Envelope::new(params.ttl, params.topic, data, now);
    envelope.seal(params.pow, params.work_time)?;
    Ok(envelope)
}

impl Envelope {
    /// Decrypt and parse with `key`. Fails on a wrong key, a malformed
    /// plaintext, or a bad signature.
    pub fn open(&self, key: &OpeningKey) -> Result<ReceivedMessage, ProtocolError> {
        let plain = match key {
            OpeningKey::Symmetric(k) => crypto::decrypt_symmetric(&self.data, k)?,
            OpeningKey::Asymmetric { seed } => {
                let payload = EncryptedPayload::from_bytes(&self.data)?;
                crypto::decrypt_asymmetric(&payload, seed)?
            }
        };

        if plain.len() < HEADER_LENGTH {
            return Err(ProtocolError::Crypto("plaintext too short".into()));
        }
        let signed = plain[0] & FLAG_SIGNED != 0;
        let (body, src) = if signed {
            if plain.len() < HEADER_LENGTH + SIGNATURE_TRAILER {
                return Err(ProtocolError::Crypto("missing signature".into()));
            }
            let (body, trailer) = plain.split_at(plain.len() - SIGNATURE_TRAILER);
            let (pk, sig) = trailer.split_at(32);
            let pk: [u8; 32] = pk
                .try_into()
                .map_err(|_| ProtocolError::Crypto("bad public key".into()))?;
            let sig: [u8; SIGNATURE_LENGTH] = sig
                .try_into()
                .map_err(|_| ProtocolError::Crypto("bad signature".into()))?;
            if !crypto::verify(body, &sig, &pk) {
                return Err(ProtocolError::Crypto("signature verification failed".into()));
            }
            (body, Some(pk))
        } else {
            (plain.as_slice(), None)
        };

        let len_bytes: [u8; 4] = body[1..HEADER_LENGTH]
            .try_into()
            .map_err(|_| ProtocolError::Crypto("bad length prefix".into()))?;
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        let rest = &body[HEADER_LENGTH..];
        if payload_len > rest.len() {
            return Err(ProtocolError::Crypto(format!(
                "payload length {payload_len} exceeds plaintext {}",
                rest.len()
            )));
        }
        let (payload, padding) = rest.split_at(payload_len);

        Ok(ReceivedMessage {
            hash: self.hash(),
            topic: self.topic,
            payload: payload.to_vec(),
            padding: padding.to_vec(),
            src,
            key_fingerprint: key.fingerprint(),
            pow: self.pow(),
            sent: self.sent(),
            ttl: self.ttl,
            p2p: false,
        })
    }
}
