//! Envelope pool: every live envelope keyed by hash, plus an expiry index.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::envelope::Envelope;
use crate::types::Hash;

#[derive(Default)]
struct PoolInner {
    envelopes: HashMap<Hash, Arc<Envelope>>,
    expirations: BTreeMap<u32, HashSet<Hash>>,
}

/// Hash-indexed store of envelopes that have not yet expired.
///
/// Both maps live behind one lock so an envelope is never visible in
/// one and missing from the other.
#[derive(Default)]
pub struct EnvelopePool {
    inner: RwLock<PoolInner>,
}

impl EnvelopePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `envelope` unless one with the same hash is already present.
    ///
    /// Returns the pooled copy and whether this call inserted it.
    pub fn insert(&self, hash: Hash, envelope: Envelope) -> (Arc<Envelope>, bool) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner.envelopes.get(&hash) {
            return (existing.clone(), false);
        }
        let expiry = envelope.expiry;
        let envelope = Arc::new(envelope);
        inner.envelopes.insert(hash, envelope.clone());
        inner.expirations.entry(expiry).or_default().insert(hash);
        (envelope, true)
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Envelope>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.envelopes.get(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.envelopes.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every pooled envelope with its hash.
    pub fn envelopes(&self) -> Vec<(Hash, Arc<Envelope>)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .envelopes
            .iter()
            .map(|(h, e)| (*h, e.clone()))
            .collect()
    }

    /// Keep only the hashes in `known` that are still pooled.
    pub fn retain_present(&self, known: &mut HashSet<Hash>) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        known.retain(|h| inner.envelopes.contains_key(h));
    }

    /// Drop every envelope whose expiry is strictly before `now` and return
    /// the removed hashes.
    pub fn expire(&self, now: u32) -> Vec<Hash> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let keep = inner.expirations.split_off(&now);
        let expired = std::mem::replace(&mut inner.expirations, keep);

        let mut removed = Vec::new();
        for hash in expired.into_values().flatten() {
            if inner.envelopes.remove(&hash).is_some() {
                removed.push(hash);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopicType;

    fn env(expiry: u32, tag: u8) -> Envelope {
        Envelope {
            expiry,
            ttl: 10,
            topic: TopicType([tag; 4]),
            data: vec![tag],
            nonce: 0,
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let pool = EnvelopePool::new();
        let e = env(100, 1);
        let hash = e.hash();
        let (_, fresh) = pool.insert(hash, e.clone());
        assert!(fresh);
        let (_, fresh) = pool.insert(hash, e);
        assert!(!fresh);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&hash));
    }

    #[test]
    fn expire_removes_strictly_older() {
        let pool = EnvelopePool::new();
        let old = env(99, 1);
        let edge = env(100, 2);
        let new = env(150, 3);
        for e in [&old, &edge, &new] {
            pool.insert(e.hash(), e.clone());
        }

        let removed = pool.expire(100);
        assert_eq!(removed, vec![old.hash()]);
        assert!(pool.contains(&edge.hash()));
        assert!(pool.contains(&new.hash()));

        let removed = pool.expire(151);
        assert_eq!(removed.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn retain_present_prunes_unknown() {
        let pool = EnvelopePool::new();
        let e = env(100, 1);
        pool.insert(e.hash(), e.clone());
        let mut known: HashSet<Hash> = [e.hash(), Hash([7; 32])].into_iter().collect();
        pool.retain_present(&mut known);
        assert_eq!(known.len(), 1);
        assert!(known.contains(&e.hash()));
    }
}
