//! Metrics primitives for the ferry envelope stack.
//!
//! Components never reach for process-wide globals: each one owns a small
//! metrics struct built from these primitives and shares it through an
//! `Arc`. All primitives serialize to plain numbers (or a small object for
//! [`Histogram`]) so a whole metrics struct can be dumped as a snapshot.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter backed by [`AtomicU64`].
///
/// All operations use [`Ordering::Relaxed`]; these are statistics, not
/// synchronization points.
pub struct Counter(AtomicU64);

impl Counter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

impl serde::Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Counter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        let counter = Self::new();
        counter.inc_by(value);
        Ok(counter)
    }
}

/// A value that can go up and down (queue depth, peer count).
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gauge").field(&self.get()).finish()
    }
}

impl serde::Serialize for Gauge {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

/// Fixed-bucket histogram.
///
/// Bucket bounds are inclusive upper limits; observations above the last
/// bound only show up in `count` and `sum`.
pub struct Histogram {
    bounds: Vec<u64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given ascending bucket bounds.
    pub fn new(bounds: &[u64]) -> Self {
        let mut bounds = bounds.to_vec();
        bounds.sort_unstable();
        bounds.dedup();
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    /// Exponential byte-size buckets from 256 B to 16 MiB.
    pub fn for_sizes() -> Self {
        let bounds: Vec<u64> = (8..=24).step_by(2).map(|shift| 1u64 << shift).collect();
        Self::new(&bounds)
    }

    /// Record one observation.
    pub fn observe(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        if let Some(idx) = self.bounds.iter().position(|bound| value <= *bound) {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Cumulative count of observations `<= bound`, `None` for an unknown bound.
    pub fn cumulative(&self, bound: u64) -> Option<u64> {
        let idx = self.bounds.iter().position(|b| *b == bound)?;
        Some(
            self.buckets[..=idx]
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .sum(),
        )
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::for_sizes()
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("count", &self.count())
            .field("sum", &self.sum())
            .finish()
    }
}

impl serde::Serialize for Histogram {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let buckets: Vec<(u64, u64)> = self
            .bounds
            .iter()
            .zip(&self.buckets)
            .map(|(bound, n)| (*bound, n.load(Ordering::Relaxed)))
            .collect();
        let mut s = serializer.serialize_struct("Histogram", 3)?;
        s.serialize_field("count", &self.count())?;
        s.serialize_field("sum", &self.sum())?;
        s.serialize_field("buckets", &buckets)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic_operations() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        assert_eq!(c.get(), 1);
        c.inc_by(10);
        assert_eq!(c.get(), 11);
    }

    #[test]
    fn counter_serde_roundtrip() {
        let c = Counter::new();
        c.inc_by(99);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "99");
        let c2: Counter = serde_json::from_str(&json).unwrap();
        assert_eq!(c2.get(), 99);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let g = Gauge::new();
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
        g.set(-4);
        assert_eq!(serde_json::to_string(&g).unwrap(), "-4");
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(&[10, 100, 1000]);
        h.observe(5);
        h.observe(50);
        h.observe(50);
        h.observe(5000);
        assert_eq!(h.count(), 4);
        assert_eq!(h.sum(), 5105);
        assert_eq!(h.cumulative(10), Some(1));
        assert_eq!(h.cumulative(100), Some(3));
        assert_eq!(h.cumulative(1000), Some(3));
        assert_eq!(h.cumulative(7), None);
    }

    #[test]
    fn histogram_serializes_snapshot() {
        let h = Histogram::new(&[1]);
        h.observe(1);
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["buckets"][0][1], 1);
    }
}
