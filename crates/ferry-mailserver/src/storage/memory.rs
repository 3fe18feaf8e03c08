use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use super::{guarded, CursorQuery, StorageBackend, StoredRecord};
use crate::dbkey::DBKey;
use crate::error::StorageError;

/// Ordered in-memory archive. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<DBKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStore {
    fn put(&self, key: &DBKey, raw: &[u8]) -> Result<(), StorageError> {
        guarded("put", || {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            records.entry(*key).or_insert_with(|| raw.to_vec());
            Ok(())
        })
    }

    fn get(&self, key: &DBKey) -> Result<Option<Vec<u8>>, StorageError> {
        guarded("get", || {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            Ok(records.get(key).cloned())
        })
    }

    fn query(&self, query: &CursorQuery) -> Result<Vec<StoredRecord>, StorageError> {
        guarded("query", || {
            let start = match &query.cursor {
                Some(cursor) => Bound::Excluded(*cursor),
                None => Bound::Included(query.start),
            };
            // `BTreeMap::range` panics on an inverted range.
            let start_key = query.cursor.unwrap_or(query.start);
            if start_key >= query.end {
                return Ok(Vec::new());
            }
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            Ok(records
                .range((start, Bound::Excluded(query.end)))
                .filter(|(key, _)| query.matcher.matches(&key.topic()))
                .take(query.limit)
                .map(|(key, raw)| StoredRecord {
                    key: *key,
                    raw: raw.clone(),
                })
                .collect())
        })
    }

    fn prune(&self, before: u32, batch_size: usize) -> Result<usize, StorageError> {
        guarded("prune", || {
            let bound = DBKey::lower_bound(before);
            let batch_size = batch_size.max(1);
            let mut removed = 0;
            loop {
                let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
                let batch: Vec<DBKey> = records.range(..bound).map(|(k, _)| *k).take(batch_size).collect();
                for key in &batch {
                    records.remove(key);
                }
                removed += batch.len();
                if batch.len() < batch_size {
                    return Ok(removed);
                }
            }
        })
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TopicMatcher;
    use ferry_protocol::{Bloom, Hash, TopicType};

    fn key(ts: u32, tag: u8) -> DBKey {
        DBKey::new(ts, TopicType([tag; 4]), Hash([tag; 32]))
    }

    fn all(start: u32, end: u32, limit: usize) -> CursorQuery {
        CursorQuery {
            start: DBKey::lower_bound(start),
            end: DBKey::lower_bound(end),
            cursor: None,
            matcher: TopicMatcher::Bloom(Bloom::full()),
            limit,
        }
    }

    #[test]
    fn query_is_ascending_and_bounded() {
        let store = MemoryStore::new();
        for ts in [30, 10, 20, 40] {
            store.put(&key(ts, ts as u8), &[ts as u8]).unwrap();
        }
        let got: Vec<u32> = store
            .query(&all(10, 40, 10))
            .unwrap()
            .iter()
            .map(|r| r.key.timestamp())
            .collect();
        assert_eq!(got, vec![10, 20, 30]);
        assert_eq!(store.query(&all(10, 40, 2)).unwrap().len(), 2);
    }

    #[test]
    fn cursor_past_end_yields_nothing() {
        let store = MemoryStore::new();
        store.put(&key(10, 1), b"x").unwrap();
        let mut query = all(10, 11, 10);
        query.cursor = Some(key(50, 1));
        assert!(store.query(&query).unwrap().is_empty());
    }

    #[test]
    fn put_keeps_first_value() {
        let store = MemoryStore::new();
        store.put(&key(1, 1), b"first").unwrap();
        store.put(&key(1, 1), b"second").unwrap();
        assert_eq!(store.get(&key(1, 1)).unwrap().unwrap(), b"first");
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn prune_in_batches() {
        let store = MemoryStore::new();
        for ts in 0..25 {
            store.put(&key(ts, ts as u8), b"x").unwrap();
        }
        assert_eq!(store.prune(20, 7).unwrap(), 20);
        assert_eq!(store.len().unwrap(), 5);
        assert_eq!(store.prune(20, 7).unwrap(), 0);
    }
}
