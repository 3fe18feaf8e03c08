//! Per-peer request throttle: one request per window.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Remembers when each peer last made a request. A peer is allowed again
/// once `window` has elapsed since then.
pub struct RequestRateLimiter {
    window: Duration,
    last_seen: RwLock<HashMap<String, Instant>>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RequestRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: RwLock::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a request from `id` now.
    pub fn add(&self, id: &str) {
        self.last_seen
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), Instant::now());
    }

    pub fn is_allowed(&self, id: &str) -> bool {
        let last_seen = self.last_seen.read().unwrap_or_else(|e| e.into_inner());
        match last_seen.get(id) {
            Some(seen) => seen.elapsed() >= self.window,
            None => true,
        }
    }

    /// Check and record in one step. False when `id` is still throttled.
    pub fn try_acquire(&self, id: &str) -> bool {
        let mut last_seen = self.last_seen.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(seen) = last_seen.get(id) {
            if now.saturating_duration_since(*seen) < self.window {
                return false;
            }
        }
        last_seen.insert(id.to_string(), now);
        true
    }

    /// Forget peers whose window has passed.
    pub fn delete_expired(&self) -> usize {
        let now = Instant::now();
        let mut last_seen = self.last_seen.write().unwrap_or_else(|e| e.into_inner());
        let before = last_seen.len();
        last_seen.retain(|_, seen| *seen + self.window > now);
        before - last_seen.len()
    }

    pub fn len(&self) -> usize {
        self.last_seen.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic sweep. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_some() || self.window.is_zero() {
            return;
        }
        let cancel = CancellationToken::new();
        let limiter = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.window);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {
                        let removed = limiter.delete_expired();
                        if removed > 0 {
                            debug!(removed, "expired request limiter entries");
                        }
                    }
                }
            }
        });
        *sweeper = Some((cancel, handle));
    }

    /// Stop the sweep. No-op when not running.
    pub fn stop(&self) {
        if let Some((cancel, _handle)) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateLimiter")
            .field("window", &self.window)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn blocks_until_window_passes() {
        let limiter = RequestRateLimiter::new(Duration::from_secs(2));
        limiter.add("peer");
        assert!(!limiter.is_allowed("peer"));
        assert!(limiter.is_allowed("other"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.is_allowed("peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_expired_keeps_recent_entries() {
        let limiter = RequestRateLimiter::new(Duration::from_secs(5));
        for i in 0..10 {
            if i > 0 {
                tokio::time::advance(Duration::from_secs(2)).await;
            }
            limiter.add(&format!("peer-{i}"));
        }
        // Ages are now 18, 16, ..., 2, 0 seconds.
        assert_eq!(limiter.delete_expired(), 7);
        assert_eq!(limiter.len(), 3);
        assert!(!limiter.is_allowed("peer-9"));
        assert!(limiter.is_allowed("peer-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_records_once() {
        let limiter = RequestRateLimiter::new(Duration::from_secs(1));
        assert!(limiter.try_acquire("p"));
        assert!(!limiter.try_acquire("p"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_start_stop_are_idempotent() {
        let limiter = Arc::new(RequestRateLimiter::new(Duration::from_secs(1)));
        limiter.start();
        limiter.start();
        limiter.add("p");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(limiter.is_empty());
        limiter.stop();
        limiter.stop();
    }
}
