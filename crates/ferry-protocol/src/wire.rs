//! Packet codes and msgpack payloads exchanged after the handshake.
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::envelope::Envelope;
use crate::error::{EnvelopeError, ProtocolError};
use crate::types::{Hash, TopicType, BLOOM_FILTER_SIZE, HASH_LENGTH, MAX_LIMIT_IN_MESSAGES_REQUEST};

// ── Packet codes ─────────────────────────────────────────────────────

pub const STATUS_CODE: u8 = 0;
pub const MESSAGES_CODE: u8 = 1;
pub const POW_REQUIREMENT_CODE: u8 = 2;
pub const BLOOM_FILTER_EX_CODE: u8 = 3;
pub const BATCH_ACKNOWLEDGED_CODE: u8 = 11;
pub const MESSAGE_RESPONSE_CODE: u8 = 12;
pub const RATE_LIMITING_CODE: u8 = 20;
pub const STATUS_UPDATE_CODE: u8 = 22;
pub const P2P_SYNC_REQUEST_CODE: u8 = 123;
pub const P2P_SYNC_RESPONSE_CODE: u8 = 124;
pub const P2P_REQUEST_COMPLETE_CODE: u8 = 125;
pub const P2P_REQUEST_CODE: u8 = 126;
pub const P2P_MESSAGE_CODE: u8 = 127;

/// Only supported version of the `messageResponse` payload.
pub const MESSAGE_RESPONSE_VERSION: u32 = 1;

// ── Envelope batches ─────────────────────────────────────────────────

/// Encode envelopes as a msgpack array of binary blobs.
pub fn encode_batch<'a>(envelopes: impl IntoIterator<Item = &'a Envelope>) -> Result<Vec<u8>, ProtocolError> {
    let blobs = envelopes
        .into_iter()
        .map(|e| e.to_bytes().map(ByteBuf::from))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rmp_serde::to_vec(&blobs)?)
}

/// Encode already-serialized envelopes without decoding them.
pub fn encode_raw_batch(raw: &[Vec<u8>]) -> Result<Vec<u8>, ProtocolError> {
    let blobs: Vec<&serde_bytes::Bytes> = raw.iter().map(|r| serde_bytes::Bytes::new(r)).collect();
    Ok(rmp_serde::to_vec(&blobs)?)
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<Envelope>, ProtocolError> {
    let blobs: Vec<ByteBuf> = rmp_serde::from_slice(payload)?;
    blobs.iter().map(|b| Envelope::from_bytes(b)).collect()
}

/// Hash identifying a batch payload in confirmations.
pub fn batch_hash(payload: &[u8]) -> Hash {
    Hash::digest(payload)
}

// ── Confirmations ────────────────────────────────────────────────────

/// Reply to a `messages` batch: its hash plus one entry per rejected envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub hash: Hash,
    pub errors: Vec<EnvelopeError>,
}

/// Version tag around an opaque response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResponse {
    pub version: u32,
    pub response: ByteBuf,
}

impl VersionedResponse {
    pub fn new(response: &MessagesResponse) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: MESSAGE_RESPONSE_VERSION,
            response: ByteBuf::from(rmp_serde::to_vec(response)?),
        })
    }

    pub fn decode_v1(&self) -> Result<MessagesResponse, ProtocolError> {
        Ok(rmp_serde::from_slice(&self.response)?)
    }
}

// ── Historic requests ────────────────────────────────────────────────

/// Structured request for archived envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Request id, echoed in the completion. 32 bytes.
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    pub from: u32,
    pub to: u32,
    /// Zero means the server default.
    pub limit: u32,
    #[serde(with = "serde_bytes")]
    pub cursor: Vec<u8>,
    /// Empty or exactly 64 bytes.
    #[serde(with = "serde_bytes")]
    pub bloom: Vec<u8>,
    pub topics: Vec<TopicType>,
}

impl MessagesRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidRequest {
            reason: reason.to_string(),
        };
        if self.id.len() != HASH_LENGTH {
            return Err(invalid("invalid id, expected 32 bytes"));
        }
        if self.from > self.to {
            return Err(invalid("from is greater than to"));
        }
        if self.limit > MAX_LIMIT_IN_MESSAGES_REQUEST {
            return Err(ProtocolError::InvalidRequest {
                reason: format!("limit exceeds {MAX_LIMIT_IN_MESSAGES_REQUEST}"),
            });
        }
        if !self.bloom.is_empty() && self.bloom.len() != BLOOM_FILTER_SIZE {
            return Err(ProtocolError::InvalidRequest {
                reason: format!("wrong bloom size {}", self.bloom.len()),
            });
        }
        if self.bloom.is_empty() && self.topics.is_empty() {
            return Err(invalid("bloom or topics must be non-empty"));
        }
        Ok(())
    }

    pub fn request_id(&self) -> Hash {
        Hash::from_slice(&self.id).unwrap_or_default()
    }
}

/// Payload of a `p2pRequest` packet.
#[derive(Debug, Clone, PartialEq)]
pub enum P2pRequest {
    /// Encrypted request envelope.
    Envelope(Envelope),
    Structured(MessagesRequest),
}

impl P2pRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            P2pRequest::Envelope(e) => e.to_bytes(),
            P2pRequest::Structured(r) => Ok(rmp_serde::to_vec(r)?),
        }
    }

    /// Try the envelope form first, then the structured one.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let envelope_err = match Envelope::from_bytes(payload) {
            Ok(e) => return Ok(P2pRequest::Envelope(e)),
            Err(e) => e,
        };
        match rmp_serde::from_slice::<MessagesRequest>(payload) {
            Ok(r) => Ok(P2pRequest::Structured(r)),
            Err(e) => {
                tracing::debug!("p2p request is neither an envelope ({envelope_err}) nor a messages request ({e})");
                Err(ProtocolError::InvalidRequest {
                    reason: "invalid p2p request message".into(),
                })
            }
        }
    }
}

/// Outcome reported by a mail server in `p2pRequestComplete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestCompletion {
    Completed {
        request_id: Hash,
        /// Last envelope sent, zero when nothing matched.
        last_envelope_hash: Hash,
        /// Continuation cursor; empty when the range is exhausted.
        #[serde(with = "serde_bytes")]
        cursor: Vec<u8>,
    },
    Failed {
        request_id: Hash,
        error: String,
    },
}

impl RequestCompletion {
    pub fn request_id(&self) -> Hash {
        match self {
            RequestCompletion::Completed { request_id, .. } | RequestCompletion::Failed { request_id, .. } => {
                *request_id
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

// ── Mail server sync ─────────────────────────────────────────────────

/// One mail server asking another for its archive over `[lower, upper]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMailRequest {
    pub lower: u32,
    pub upper: u32,
    /// Empty for everything, otherwise 64 bytes.
    #[serde(with = "serde_bytes")]
    pub bloom: Vec<u8>,
    pub limit: u32,
    /// Resume after this archive key; empty to start at `lower`.
    #[serde(with = "serde_bytes")]
    pub cursor: Vec<u8>,
}

impl SyncMailRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |reason: String| ProtocolError::InvalidRequest { reason };
        if self.limit == 0 {
            return Err(invalid("limit must be positive".into()));
        }
        if self.limit > MAX_LIMIT_IN_MESSAGES_REQUEST {
            return Err(invalid(format!("limit exceeds {MAX_LIMIT_IN_MESSAGES_REQUEST}")));
        }
        if self.lower > self.upper {
            return Err(invalid(format!("lower ({}) is greater than upper ({})", self.lower, self.upper)));
        }
        if !self.bloom.is_empty() && self.bloom.len() != BLOOM_FILTER_SIZE {
            return Err(invalid(format!("wrong bloom size {}", self.bloom.len())));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// A page of a sync. The last page has `finished` set, or a non-empty
/// `error`, and carries the cursor for the next sync request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// msgpack-encoded envelopes, as archived.
    pub envelopes: Vec<ByteBuf>,
    #[serde(with = "serde_bytes")]
    pub cursor: Vec<u8>,
    pub finished: bool,
    pub error: String,
}

impl SyncResponse {
    pub fn page(raw: Vec<Vec<u8>>) -> Self {
        Self {
            envelopes: raw.into_iter().map(ByteBuf::from).collect(),
            ..Default::default()
        }
    }

    pub fn finished(cursor: Vec<u8>) -> Self {
        Self {
            cursor,
            finished: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    /// True for the page that ends the sync.
    pub fn is_last(&self) -> bool {
        self.finished || !self.error.is_empty()
    }

    pub fn decode_envelopes(&self) -> Result<Vec<Envelope>, ProtocolError> {
        self.envelopes.iter().map(|b| Envelope::from_bytes(b)).collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
