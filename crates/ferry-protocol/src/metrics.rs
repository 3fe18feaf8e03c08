use ferry_metrics::{Counter, Gauge, Histogram};
use serde::Serialize;

/// Metrics for the envelope dissemination engine.
#[derive(Debug, Default, Serialize)]
#[non_exhaustive]
pub struct NodeMetrics {
    /// Envelopes handed to admission control, any source.
    pub envelopes_received: Counter,
    /// Envelopes that passed validation, from peers.
    pub envelopes_validated: Counter,
    /// Envelopes inserted into the pool for the first time.
    pub envelopes_cached: Counter,
    /// Envelopes that were already pooled.
    pub envelopes_cache_hits: Counter,
    pub envelopes_rejected_future: Counter,
    pub envelopes_rejected_very_old: Counter,
    /// Recently expired envelopes dropped without error.
    pub envelopes_dropped_expired: Counter,
    pub envelopes_rejected_oversized: Counter,
    pub envelopes_rejected_low_pow: Counter,
    pub envelopes_rejected_no_match: Counter,
    /// Envelopes removed by the expiry sweep.
    pub envelopes_expired: Counter,
    /// Malformed packets that got a peer disconnected.
    pub packets_invalid: Counter,
    pub envelope_size: Histogram,
    pub pool_size: Gauge,
    pub peers: Gauge,
    /// Times the delivery queue hit its capacity.
    pub queue_overflows: Counter,
}

/// Metrics for the per-peer packet rate limiter.
#[derive(Debug, Default, Serialize)]
#[non_exhaustive]
pub struct RateLimiterMetrics {
    pub packets_allowed: Counter,
    pub ip_limit_exceeded: Counter,
    pub peer_id_limit_exceeded: Counter,
    /// Peers dropped for exceeding the tolerance.
    pub peers_dropped: Counter,
}
