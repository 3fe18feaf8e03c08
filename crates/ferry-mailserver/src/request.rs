//! Historic request decoding and validation.
//!
//! Three shapes reach the server: a structured [`MessagesRequest`], and an
//! encrypted envelope whose payload is either a msgpack
//! [`MessagesRequestPayload`] or the legacy binary layout
//! `lower (4, BE) || upper (4, BE) || bloom (64) || limit (4, BE) || cursor (40)`
//! where everything after `upper` is optional. All of them resolve to a
//! [`HistoricRequest`], as does a [`SyncMailRequest`] from another mail
//! server.
use std::collections::HashSet;

use ferry_protocol::types::BLOOM_FILTER_SIZE;
use ferry_protocol::{Bloom, Hash, MessagesRequest, SyncMailRequest, TopicType};
use serde::{Deserialize, Serialize};

use crate::dbkey::{DBKey, DB_KEY_LENGTH};
use crate::error::MailServerError;
use crate::storage::{CursorQuery, TopicMatcher};

/// Widest time range a single request may cover.
pub const MAX_QUERY_RANGE: u32 = 24 * 60 * 60;

/// Added to "now" when a request leaves its upper bound open.
pub const TTL_SAFE_THRESHOLD: u32 = 60;

const LEGACY_RANGE_END: usize = 8;
const LEGACY_BLOOM_END: usize = LEGACY_RANGE_END + BLOOM_FILTER_SIZE;
const LEGACY_LIMIT_END: usize = LEGACY_BLOOM_END + 4;
const LEGACY_CURSOR_END: usize = LEGACY_LIMIT_END + DB_KEY_LENGTH;

/// Body of an encrypted request envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesRequestPayload {
    pub lower: u32,
    /// Zero means "now".
    pub upper: u32,
    /// Empty or exactly 64 bytes.
    #[serde(with = "serde_bytes")]
    pub bloom: Vec<u8>,
    /// Takes precedence over `bloom` when non-empty.
    pub topics: Vec<TopicType>,
    /// Zero means the server maximum.
    pub limit: u32,
    #[serde(with = "serde_bytes")]
    pub cursor: Vec<u8>,
    /// Send each bundle as one packet instead of one packet per envelope.
    pub batch: bool,
}

impl MessagesRequestPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MailServerError> {
        rmp_serde::to_vec(self).map_err(|e| MailServerError::invalid(format!("encode payload: {e}")))
    }

    /// Legacy binary encoding. Topics and `batch` are not representable.
    pub fn to_legacy_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_CURSOR_END);
        out.extend_from_slice(&self.lower.to_be_bytes());
        out.extend_from_slice(&self.upper.to_be_bytes());
        if self.bloom.is_empty() && self.limit == 0 && self.cursor.is_empty() {
            return out;
        }
        if self.bloom.len() == BLOOM_FILTER_SIZE {
            out.extend_from_slice(&self.bloom);
        } else {
            out.extend_from_slice(Bloom::full().as_bytes());
        }
        out.extend_from_slice(&self.limit.to_be_bytes());
        out.extend_from_slice(&self.cursor);
        out
    }

    /// Parse the legacy binary layout.
    pub fn from_legacy_bytes(payload: &[u8]) -> Result<Self, MailServerError> {
        if payload.len() < LEGACY_RANGE_END {
            return Err(MailServerError::invalid(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }
        let lower = read_u32(&payload[0..4]);
        let upper = read_u32(&payload[4..8]);
        let bloom = payload
            .get(LEGACY_RANGE_END..LEGACY_BLOOM_END)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let limit = payload.get(LEGACY_BLOOM_END..LEGACY_LIMIT_END).map(read_u32).unwrap_or(0);
        let cursor = payload
            .get(LEGACY_LIMIT_END..LEGACY_CURSOR_END)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        Ok(Self {
            lower,
            upper,
            bloom,
            topics: Vec::new(),
            limit,
            cursor,
            batch: false,
        })
    }

    /// msgpack first, then the legacy layout.
    pub fn decode(payload: &[u8]) -> Result<Self, MailServerError> {
        match rmp_serde::from_slice::<Self>(payload) {
            Ok(p) => Ok(p),
            Err(_) => Self::from_legacy_bytes(payload),
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn parse_cursor(cursor: &[u8]) -> Result<Option<DBKey>, MailServerError> {
    if cursor.is_empty() {
        return Ok(None);
    }
    DBKey::from_slice(cursor)
        .map(Some)
        .map_err(|_| MailServerError::invalid(format!("cursor must be {DB_KEY_LENGTH} bytes, got {}", cursor.len())))
}

/// A validated request, ready to be turned into a [`CursorQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricRequest {
    pub id: Hash,
    /// Inclusive, seconds.
    pub lower: u32,
    /// Inclusive, seconds.
    pub upper: u32,
    pub matcher: TopicMatcher,
    pub limit: u32,
    pub cursor: Option<DBKey>,
    pub batch: bool,
}

impl HistoricRequest {
    /// Validate a decrypted payload. Legacy payloads with a short bloom
    /// match everything.
    pub fn from_payload(
        id: Hash,
        payload: MessagesRequestPayload,
        now: u32,
        max_limit: u32,
    ) -> Result<Self, MailServerError> {
        let upper = if payload.upper == 0 {
            now.saturating_add(TTL_SAFE_THRESHOLD)
        } else {
            payload.upper
        };
        let matcher = if !payload.topics.is_empty() {
            TopicMatcher::Topics(payload.topics.into_iter().collect())
        } else if payload.bloom.is_empty() {
            TopicMatcher::Bloom(Bloom::full())
        } else {
            let bloom = Bloom::from_slice(&payload.bloom).ok_or_else(|| {
                MailServerError::invalid(format!("wrong bloom size {}", payload.bloom.len()))
            })?;
            TopicMatcher::Bloom(bloom)
        };
        Self::checked(id, payload.lower, upper, matcher, payload.limit, &payload.cursor, payload.batch, max_limit)
    }

    /// Validate a structured request.
    pub fn from_messages_request(request: &MessagesRequest, max_limit: u32) -> Result<Self, MailServerError> {
        request.validate()?;
        let matcher = if !request.topics.is_empty() {
            TopicMatcher::Topics(request.topics.iter().copied().collect::<HashSet<_>>())
        } else {
            let bloom = Bloom::from_slice(&request.bloom).ok_or_else(|| {
                MailServerError::invalid(format!("wrong bloom size {}", request.bloom.len()))
            })?;
            TopicMatcher::Bloom(bloom)
        };
        Self::checked(
            request.request_id(),
            request.from,
            request.to,
            matcher,
            request.limit,
            &request.cursor,
            true,
            max_limit,
        )
    }

    /// Validate a sync request. A sync may span any range and always
    /// travels in batches.
    pub fn from_sync_request(request: &SyncMailRequest, max_limit: u32) -> Result<Self, MailServerError> {
        request.validate()?;
        if request.upper == u32::MAX {
            return Err(MailServerError::invalid(format!(
                "query range is invalid: upper ({}) has no exclusive end key",
                request.upper
            )));
        }
        if request.limit > max_limit {
            return Err(MailServerError::invalid(format!("limit {} exceeds {max_limit}", request.limit)));
        }
        let matcher = if request.bloom.is_empty() {
            TopicMatcher::Bloom(Bloom::full())
        } else {
            let bloom = Bloom::from_slice(&request.bloom).ok_or_else(|| {
                MailServerError::invalid(format!("wrong bloom size {}", request.bloom.len()))
            })?;
            TopicMatcher::Bloom(bloom)
        };
        Ok(Self {
            id: Hash::digest(&request.to_bytes()?),
            lower: request.lower,
            upper: request.upper,
            matcher,
            limit: request.limit,
            cursor: parse_cursor(&request.cursor)?,
            batch: true,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn checked(
        id: Hash,
        lower: u32,
        upper: u32,
        matcher: TopicMatcher,
        limit: u32,
        cursor: &[u8],
        batch: bool,
        max_limit: u32,
    ) -> Result<Self, MailServerError> {
        if upper < lower {
            return Err(MailServerError::invalid(format!(
                "query range is invalid: lower ({lower}) > upper ({upper})"
            )));
        }
        if upper == u32::MAX {
            return Err(MailServerError::invalid(format!(
                "query range is invalid: upper ({upper}) has no exclusive end key"
            )));
        }
        if upper - lower > MAX_QUERY_RANGE {
            return Err(MailServerError::invalid(format!(
                "query range too big, max is {MAX_QUERY_RANGE}s"
            )));
        }
        if limit > max_limit {
            return Err(MailServerError::invalid(format!("limit {limit} exceeds {max_limit}")));
        }
        let empty = match &matcher {
            TopicMatcher::Bloom(bloom) => bloom.is_empty(),
            TopicMatcher::Topics(topics) => topics.is_empty(),
        };
        if empty {
            return Err(MailServerError::invalid("empty filter"));
        }
        let cursor = parse_cursor(cursor)?;
        Ok(Self {
            id,
            lower,
            upper,
            matcher,
            limit: if limit == 0 { max_limit } else { limit },
            cursor,
            batch,
        })
    }

    /// Query covering `[lower, upper]`, fetching one record past the limit
    /// to learn whether another page exists.
    pub fn query(&self) -> CursorQuery {
        CursorQuery {
            start: DBKey::lower_bound(self.lower),
            end: DBKey::lower_bound(self.upper + 1),
            cursor: self.cursor,
            matcher: self.matcher.clone(),
            limit: self.limit as usize + 1,
        }
    }
}
