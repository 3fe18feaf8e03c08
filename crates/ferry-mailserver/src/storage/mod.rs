//! Archive backends.
//!
//! A backend stores raw envelope bytes under their [`DBKey`] and answers
//! ascending range queries. Matching only looks at the topic encoded in the
//! key (or a topic column), so records that do not match are never loaded.
mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use ferry_protocol::{bloom_filter_match, Bloom, TopicType};
use tracing::error;

use crate::dbkey::DBKey;
use crate::error::StorageError;

/// Topic filter of a historic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicMatcher {
    Bloom(Bloom),
    Topics(HashSet<TopicType>),
}

impl TopicMatcher {
    pub fn matches(&self, topic: &TopicType) -> bool {
        match self {
            TopicMatcher::Bloom(bloom) => bloom_filter_match(Some(bloom), &Bloom::from_topic(topic)),
            TopicMatcher::Topics(topics) => topics.contains(topic),
        }
    }
}

/// Range query over archived records.
#[derive(Debug, Clone)]
pub struct CursorQuery {
    /// Inclusive lower bound.
    pub start: DBKey,
    /// Exclusive upper bound.
    pub end: DBKey,
    /// Exclusive lower bound from a previous page; overrides `start`.
    pub cursor: Option<DBKey>,
    pub matcher: TopicMatcher,
    /// Maximum number of records returned.
    pub limit: usize,
}

impl CursorQuery {
    /// Whether `key` is inside the queried range.
    pub fn contains(&self, key: &DBKey) -> bool {
        let after_start = match &self.cursor {
            Some(cursor) => key > cursor,
            None => key >= &self.start,
        };
        after_start && key < &self.end
    }
}

/// One archived envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: DBKey,
    /// msgpack-encoded envelope, as received.
    pub raw: Vec<u8>,
}

/// Persistent envelope archive.
///
/// Implementations serialize their own writes and must not let a driver
/// panic escape; see [`guarded`].
pub trait StorageBackend: Send + Sync {
    /// Store a record. Storing an existing key is a no-op.
    fn put(&self, key: &DBKey, raw: &[u8]) -> Result<(), StorageError>;

    fn get(&self, key: &DBKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// Matching records in ascending key order, at most `query.limit`.
    fn query(&self, query: &CursorQuery) -> Result<Vec<StoredRecord>, StorageError>;

    /// Delete every record sent before `before`, at most `batch_size` per
    /// write. Returns how many were removed.
    fn prune(&self, before: u32, batch_size: usize) -> Result<usize, StorageError>;

    fn len(&self) -> Result<usize, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

/// Run a backend operation, turning a panic into [`StorageError::Panicked`].
pub(crate) fn guarded<T>(
    op: &'static str,
    f: impl FnOnce() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(op, "recovered storage panic: {message}");
            Err(StorageError::Panicked { op, message })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::Hash;

    #[test]
    fn guarded_recovers_panics() {
        let result: Result<(), _> = guarded("put", || panic!("driver exploded"));
        match result {
            Err(StorageError::Panicked { op, message }) => {
                assert_eq!(op, "put");
                assert_eq!(message, "driver exploded");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(guarded("get", || Ok(5)).unwrap(), 5);
    }

    #[test]
    fn cursor_is_exclusive() {
        let key = DBKey::new(10, TopicType([1; 4]), Hash([1; 32]));
        let mut query = CursorQuery {
            start: DBKey::lower_bound(10),
            end: DBKey::lower_bound(11),
            cursor: None,
            matcher: TopicMatcher::Bloom(Bloom::full()),
            limit: 10,
        };
        assert!(query.contains(&key));
        query.cursor = Some(key);
        assert!(!query.contains(&key));
    }

    #[test]
    fn topic_matcher_modes() {
        let t = TopicType([1, 2, 3, 4]);
        assert!(TopicMatcher::Bloom(Bloom::full()).matches(&t));
        assert!(TopicMatcher::Bloom(Bloom::from_topic(&t)).matches(&t));
        assert!(!TopicMatcher::Topics(HashSet::new()).matches(&t));
        assert!(TopicMatcher::Topics([t].into_iter().collect()).matches(&t));
    }

    #[test]
    fn bloom_matching_agrees_with_node_interest() {
        let topics = [TopicType([1, 2, 3, 4]), TopicType([9, 9, 9, 9])];
        let filters = [Bloom::full(), Bloom::empty(), Bloom::from_topic(&topics[0])];
        for filter in &filters {
            for t in &topics {
                let sample = Bloom::from_topic(t);
                assert_eq!(
                    TopicMatcher::Bloom(filter.clone()).matches(t),
                    bloom_filter_match(Some(filter), &sample)
                );
            }
        }
        assert!(!TopicMatcher::Bloom(Bloom::empty()).matches(&topics[0]));
    }
}
