use serde::{Deserialize, Serialize};

use crate::types::Hash;

/// Protocol-level errors for ferry.
///
/// Wraps transport errors and adds envelope, handshake and crypto variants.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] ferry_transport::TransportError),

    #[error("envelope rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("invalid options: {reason}")]
    InvalidOptions { reason: String },

    #[error("invalid filter: {reason}")]
    InvalidFilter { reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid setting: {reason}")]
    InvalidSetting { reason: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("failed to reach the PoW target within {seconds}s of work")]
    PowTargetNotReached { seconds: u64 },

    #[error("received invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("rate limit exceeded: {reason}")]
    RateLimited { reason: String },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("oversize message received: {size} bytes (max {max})")]
    Oversize { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("node is shut down")]
    Shutdown,
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Why admission control refused an envelope.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error("envelope from future: sent {sent}, now {now}")]
    FromFuture { sent: u32, now: u32 },

    #[error("very old envelope: expired {expiry}, now {now}")]
    VeryOld { expiry: u32, now: u32 },

    #[error("huge messages are not allowed: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },

    #[error("envelope with low PoW received: PoW={pow:.6}, required {required:.6}")]
    LowPow { pow: f64, required: f64 },

    #[error("envelope does not match the node filter: topic {topic}")]
    FilterMismatch { topic: String },
}

impl AdmissionError {
    /// Clock-skew problems are noise, not a reason to drop the peer.
    pub fn is_time_sync(&self) -> bool {
        matches!(
            self,
            AdmissionError::FromFuture { .. } | AdmissionError::VeryOld { .. }
        )
    }

    pub fn code(&self) -> EnvelopeErrorCode {
        match self {
            AdmissionError::FromFuture { .. } | AdmissionError::VeryOld { .. } => {
                EnvelopeErrorCode::TimeSync
            }
            AdmissionError::Oversized { .. } => EnvelopeErrorCode::Oversized,
            AdmissionError::LowPow { .. } => EnvelopeErrorCode::LowPow,
            AdmissionError::FilterMismatch { .. } => EnvelopeErrorCode::FilterMismatch,
        }
    }
}

/// Numeric error codes carried in delivery confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", from = "u32")]
pub enum EnvelopeErrorCode {
    Unknown,
    TimeSync,
    LowPow,
    FilterMismatch,
    Oversized,
}

impl From<EnvelopeErrorCode> for u32 {
    fn from(code: EnvelopeErrorCode) -> u32 {
        match code {
            EnvelopeErrorCode::Unknown => 1,
            EnvelopeErrorCode::TimeSync => 2,
            EnvelopeErrorCode::LowPow => 3,
            EnvelopeErrorCode::FilterMismatch => 4,
            EnvelopeErrorCode::Oversized => 5,
        }
    }
}

impl From<u32> for EnvelopeErrorCode {
    fn from(code: u32) -> Self {
        match code {
            2 => EnvelopeErrorCode::TimeSync,
            3 => EnvelopeErrorCode::LowPow,
            4 => EnvelopeErrorCode::FilterMismatch,
            5 => EnvelopeErrorCode::Oversized,
            _ => EnvelopeErrorCode::Unknown,
        }
    }
}

/// Per-envelope failure reported back to the sender of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub hash: Hash,
    pub code: EnvelopeErrorCode,
    pub description: String,
}

impl EnvelopeError {
    pub fn new(hash: Hash, err: &AdmissionError) -> Self {
        Self {
            hash,
            code: err.code(),
            description: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_sync_errors_are_recoverable() {
        assert!(AdmissionError::FromFuture { sent: 20, now: 1 }.is_time_sync());
        assert!(AdmissionError::VeryOld { expiry: 1, now: 50 }.is_time_sync());
        assert!(!AdmissionError::LowPow {
            pow: 0.1,
            required: 0.2
        }
        .is_time_sync());
    }

    #[test]
    fn error_codes_roundtrip_through_u32() {
        for code in [
            EnvelopeErrorCode::Unknown,
            EnvelopeErrorCode::TimeSync,
            EnvelopeErrorCode::LowPow,
            EnvelopeErrorCode::FilterMismatch,
            EnvelopeErrorCode::Oversized,
        ] {
            assert_eq!(EnvelopeErrorCode::from(u32::from(code)), code);
        }
        assert_eq!(EnvelopeErrorCode::from(99), EnvelopeErrorCode::Unknown);
    }

    #[test]
    fn display_admission_wraps() {
        let err = ProtocolError::from(AdmissionError::Oversized { size: 10, max: 5 });
        assert_eq!(
            err.to_string(),
            "envelope rejected: huge messages are not allowed: 10 bytes (max 5)"
        );
    }

    #[test]
    fn envelope_error_carries_code() {
        let err = AdmissionError::LowPow {
            pow: 0.01,
            required: 1.0,
        };
        let e = EnvelopeError::new(Hash([1; 32]), &err);
        assert_eq!(e.code, EnvelopeErrorCode::LowPow);
        assert!(e.description.contains("low PoW"));
    }
}
