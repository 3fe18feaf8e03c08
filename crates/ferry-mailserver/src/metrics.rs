use ferry_metrics::{Counter, Histogram};
use serde::Serialize;

/// Metrics for the archive and historic delivery.
#[derive(Debug, Default, Serialize)]
#[non_exhaustive]
pub struct MailServerMetrics {
    pub envelopes_archived: Counter,
    pub archive_errors: Counter,
    /// Envelopes refused by a full or stopped archive queue.
    pub archive_dropped: Counter,
    pub requests_received: Counter,
    /// Requests dropped before any reply: bad PoW, decryption, validation.
    pub requests_invalid: Counter,
    pub requests_rate_limited: Counter,
    pub requests_completed: Counter,
    /// Requests answered with a failure completion.
    pub requests_failed: Counter,
    pub requests_cancelled: Counter,
    /// Sync requests from other mail servers, before rate limiting.
    pub sync_requests: Counter,
    pub sync_completed: Counter,
    pub sync_failed: Counter,
    pub envelopes_delivered: Counter,
    pub bundles_sent: Counter,
    pub bundle_size: Histogram,
    pub envelopes_pruned: Counter,
    pub storage_panics: Counter,
}
