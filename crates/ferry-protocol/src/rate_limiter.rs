//! Per-peer packet rate limiting.
//!
//! [`PeerRateLimiter::decorate`] sits between the connection and the
//! message loop. Every inbound packet is charged against a token bucket
//! for the peer's IP and one for its id; when a bucket is empty the
//! configured handlers decide whether the peer is merely counted or
//! dropped. Packets are always forwarded in order unless a handler fails.
use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use ferry_transport::{msg_pipe, MsgPipeEnd, MsgReadWriter, PeerId, RemotePeer};
use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PeerRateLimiterConfig;
use crate::error::ProtocolError;
use crate::metrics::RateLimiterMetrics;
use crate::peer::Peer;

const BUCKET_CACHE_SIZE: usize = 4096;
const RELAY_BUFFER: usize = 16;

/// Reaction to a peer exceeding a limit. Returning an error drops the peer.
pub trait RateLimiterHandler: Send + Sync {
    fn exceed_ip_limit(&self, peer: &RemotePeer) -> Result<(), ProtocolError>;
    fn exceed_peer_limit(&self, peer: &RemotePeer) -> Result<(), ProtocolError>;
}

/// Only counts violations.
pub struct MetricsRateLimiterHandler {
    metrics: Arc<RateLimiterMetrics>,
}

impl MetricsRateLimiterHandler {
    pub fn new(metrics: Arc<RateLimiterMetrics>) -> Self {
        Self { metrics }
    }
}

impl RateLimiterHandler for MetricsRateLimiterHandler {
    fn exceed_ip_limit(&self, _peer: &RemotePeer) -> Result<(), ProtocolError> {
        self.metrics.ip_limit_exceeded.inc();
        Ok(())
    }

    fn exceed_peer_limit(&self, _peer: &RemotePeer) -> Result<(), ProtocolError> {
        self.metrics.peer_id_limit_exceeded.inc();
        Ok(())
    }
}

/// Drops a peer once it has exceeded a limit `tolerance` times.
/// A tolerance of zero never drops.
pub struct DropPeerRateLimiterHandler {
    tolerance: u64,
    violations: Mutex<LruCache<PeerId, u64>>,
}

impl DropPeerRateLimiterHandler {
    pub fn new(tolerance: u64) -> Self {
        Self {
            tolerance,
            violations: Mutex::new(LruCache::new(cache_size())),
        }
    }

    fn record(&self, peer: &RemotePeer, kind: &str) -> Result<(), ProtocolError> {
        let mut violations = self.violations.lock().unwrap_or_else(|e| e.into_inner());
        let count = violations.get_or_insert_mut(peer.id, || 0);
        *count += 1;
        if self.tolerance > 0 && *count >= self.tolerance {
            return Err(ProtocolError::RateLimited {
                reason: format!("{kind} limit exceeded {count} times"),
            });
        }
        Ok(())
    }
}

impl RateLimiterHandler for DropPeerRateLimiterHandler {
    fn exceed_ip_limit(&self, peer: &RemotePeer) -> Result<(), ProtocolError> {
        self.record(peer, "ip")
    }

    fn exceed_peer_limit(&self, peer: &RemotePeer) -> Result<(), ProtocolError> {
        self.record(peer, "peer id")
    }
}

/// Token bucket refilled continuously at `rate` tokens per second, holding
/// at most `rate` tokens.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn full(rate: u64, now: Instant) -> Self {
        Self {
            tokens: rate as f64,
            last: now,
        }
    }

    /// Take one token; false when the bucket is empty.
    fn take(&mut self, rate: u64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

fn cache_size() -> NonZeroUsize {
    NonZeroUsize::new(BUCKET_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN)
}

pub struct PeerRateLimiter {
    limit_per_sec_ip: u64,
    limit_per_sec_peer_id: u64,
    whitelisted_ips: HashSet<IpAddr>,
    whitelisted_peer_ids: HashSet<PeerId>,
    ip_buckets: Mutex<LruCache<IpAddr, TokenBucket>>,
    peer_buckets: Mutex<LruCache<PeerId, TokenBucket>>,
    handlers: Vec<Arc<dyn RateLimiterHandler>>,
    metrics: Arc<RateLimiterMetrics>,
}

impl PeerRateLimiter {
    /// Build a limiter. Unparseable whitelist entries are logged and skipped.
    pub fn new(
        config: &PeerRateLimiterConfig,
        metrics: Arc<RateLimiterMetrics>,
        handlers: Vec<Arc<dyn RateLimiterHandler>>,
    ) -> Self {
        let whitelisted_ips = config
            .whitelisted_ips
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!(ip = %s, "ignoring invalid whitelisted ip: {e}");
                    None
                }
            })
            .collect();
        let whitelisted_peer_ids = config
            .whitelisted_peer_ids
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(peer = %s, "ignoring invalid whitelisted peer id: {e}");
                    None
                }
            })
            .collect();

        Self {
            limit_per_sec_ip: config.limit_per_sec_ip,
            limit_per_sec_peer_id: config.limit_per_sec_peer_id,
            whitelisted_ips,
            whitelisted_peer_ids,
            ip_buckets: Mutex::new(LruCache::new(cache_size())),
            peer_buckets: Mutex::new(LruCache::new(cache_size())),
            handlers,
            metrics,
        }
    }

    pub fn limit_per_sec_ip(&self) -> u64 {
        self.limit_per_sec_ip
    }

    pub fn limit_per_sec_peer_id(&self) -> u64 {
        self.limit_per_sec_peer_id
    }

    /// True when the packet from `ip` exceeds the IP limit.
    fn throttle_ip(&self, ip: Option<IpAddr>) -> bool {
        let Some(ip) = ip else { return false };
        if self.limit_per_sec_ip == 0 || self.whitelisted_ips.contains(&ip) {
            return false;
        }
        let now = Instant::now();
        let mut buckets = self.ip_buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.get_or_insert_mut(ip, || TokenBucket::full(self.limit_per_sec_ip, now));
        !bucket.take(self.limit_per_sec_ip, now)
    }

    /// True when the packet from `id` exceeds the peer-id limit.
    fn throttle_peer(&self, id: PeerId) -> bool {
        if self.limit_per_sec_peer_id == 0 || self.whitelisted_peer_ids.contains(&id) {
            return false;
        }
        let now = Instant::now();
        let mut buckets = self.peer_buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.get_or_insert_mut(id, || TokenBucket::full(self.limit_per_sec_peer_id, now));
        !bucket.take(self.limit_per_sec_peer_id, now)
    }

    /// Charge one inbound packet from `remote`, running handlers on excess.
    pub fn check(&self, remote: &RemotePeer) -> Result<(), ProtocolError> {
        let mut exceeded = false;
        if self.throttle_ip(remote.ip) {
            exceeded = true;
            for handler in &self.handlers {
                handler.exceed_ip_limit(remote)?;
            }
        }
        if self.throttle_peer(remote.id) {
            exceeded = true;
            for handler in &self.handlers {
                handler.exceed_peer_limit(remote)?;
            }
        }
        if !exceeded {
            self.metrics.packets_allowed.inc();
        }
        Ok(())
    }

    /// Run `run_loop` behind the limiter.
    ///
    /// The loop gets one end of an in-memory pipe; two relays copy packets
    /// between the other end and the peer's connection. The first error
    /// from any of the three closes the pipe and the connection.
    pub async fn decorate<F, Fut>(&self, peer: &Arc<Peer>, run_loop: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(Arc<dyn MsgReadWriter>) -> Fut,
        Fut: Future<Output = Result<(), ProtocolError>>,
    {
        let original = Arc::clone(peer.rw());
        let (inner, outer) = msg_pipe(RELAY_BUFFER);
        let inner: Arc<MsgPipeEnd> = Arc::new(inner);

        let result = tokio::select! {
            e = self.relay_inbound(peer.remote(), original.as_ref(), &outer) => Err(e),
            e = relay_outbound(&outer, original.as_ref()) => Err(e),
            res = run_loop(inner.clone() as Arc<dyn MsgReadWriter>) => res,
        };

        inner.close();
        original.close();
        if let Err(e) = &result {
            if matches!(e, ProtocolError::RateLimited { .. }) {
                self.metrics.peers_dropped.inc();
            }
            debug!(peer = %peer.id().short(), "rate limited connection ended: {e}");
        }
        result
    }

    async fn relay_inbound(
        &self,
        remote: &RemotePeer,
        from: &dyn MsgReadWriter,
        to: &MsgPipeEnd,
    ) -> ProtocolError {
        loop {
            let packet = match from.read_msg().await {
                Ok(p) => p,
                Err(e) => return e.into(),
            };
            if let Err(e) = self.check(remote) {
                return e;
            }
            if let Err(e) = to.write_msg(packet).await {
                return e.into();
            }
        }
    }
}

async fn relay_outbound(from: &MsgPipeEnd, to: &dyn MsgReadWriter) -> ProtocolError {
    loop {
        let packet = match from.read_msg().await {
            Ok(p) => p,
            Err(e) => return e.into(),
        };
        if let Err(e) = to.write_msg(packet).await {
            return e.into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn remote(ip: [u8; 4]) -> RemotePeer {
        RemotePeer::new(PeerId::from_bytes([ip[3]; 32]), Some(IpAddr::from(ip)))
    }

    fn limiter(ip: u64, peer: u64, handlers: Vec<Arc<dyn RateLimiterHandler>>) -> PeerRateLimiter {
        let config = PeerRateLimiterConfig {
            limit_per_sec_ip: ip,
            limit_per_sec_peer_id: peer,
            ..Default::default()
        };
        PeerRateLimiter::new(&config, Arc::new(RateLimiterMetrics::default()), handlers)
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let metrics = Arc::new(RateLimiterMetrics::default());
        let handler = Arc::new(MetricsRateLimiterHandler::new(metrics.clone()));
        let limiter = limiter(0, 2, vec![handler as Arc<dyn RateLimiterHandler>]);
        let peer = remote([10, 0, 0, 1]);

        limiter.check(&peer).unwrap();
        limiter.check(&peer).unwrap();
        limiter.check(&peer).unwrap();
        assert_eq!(metrics.peer_id_limit_exceeded.get(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        limiter.check(&peer).unwrap();
        assert_eq!(metrics.peer_id_limit_exceeded.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn whitelisted_ip_is_never_throttled() {
        let metrics = Arc::new(RateLimiterMetrics::default());
        let config = PeerRateLimiterConfig {
            limit_per_sec_ip: 1,
            limit_per_sec_peer_id: 0,
            whitelisted_ips: vec!["10.0.0.1".into(), "not an ip".into()],
            whitelisted_peer_ids: vec![],
        };
        let handler = Arc::new(MetricsRateLimiterHandler::new(metrics.clone()));
        let limiter = PeerRateLimiter::new(
            &config,
            Arc::new(RateLimiterMetrics::default()),
            vec![handler as Arc<dyn RateLimiterHandler>],
        );
        for _ in 0..10 {
            limiter.check(&remote([10, 0, 0, 1])).unwrap();
        }
        assert_eq!(metrics.ip_limit_exceeded.get(), 0);

        limiter.check(&remote([10, 0, 0, 2])).unwrap();
        limiter.check(&remote([10, 0, 0, 2])).unwrap();
        assert_eq!(metrics.ip_limit_exceeded.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_handler_fails_at_tolerance() {
        let handler = Arc::new(DropPeerRateLimiterHandler::new(2));
        let limiter = limiter(0, 1, vec![handler as Arc<dyn RateLimiterHandler>]);
        let peer = remote([10, 0, 0, 1]);

        limiter.check(&peer).unwrap();
        limiter.check(&peer).unwrap(); // first violation
        let err = limiter.check(&peer).unwrap_err();
        assert!(matches!(err, ProtocolError::RateLimited { .. }));
    }

    #[test]
    fn zero_tolerance_never_drops() {
        let handler = DropPeerRateLimiterHandler::new(0);
        let peer = remote([10, 0, 0, 1]);
        for _ in 0..100 {
            handler.exceed_peer_limit(&peer).unwrap();
        }
    }
}
