//! Local subscriptions ("watchers").
//!
//! A filter owns one opening key, an optional topic set (empty = every
//! topic) and an inbox of decrypted messages drained by
//! [`Filter::retrieve`]. [`Filters`] indexes installed filters by topic.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::message::{OpeningKey, ReceivedMessage};
use crate::types::{Hash, TopicType};

#[derive(Debug)]
pub struct Filter {
    key: OpeningKey,
    topics: Vec<TopicType>,
    pow: f64,
    allow_p2p: bool,
    src: Option<[u8; 32]>,
    inbox: Mutex<Inbox>,
}

#[derive(Debug, Default)]
struct Inbox {
    seen: HashSet<Hash>,
    messages: Vec<ReceivedMessage>,
}

impl Filter {
    pub fn builder() -> FilterBuilder {
        FilterBuilder::default()
    }

    pub fn key(&self) -> &OpeningKey {
        &self.key
    }

    pub fn topics(&self) -> &[TopicType] {
        &self.topics
    }

    pub fn allow_p2p(&self) -> bool {
        self.allow_p2p
    }

    /// Cheap pre-decryption check.
    pub fn match_envelope(&self, envelope: &Envelope) -> bool {
        self.pow <= 0.0 || envelope.pow() >= self.pow
    }

    /// Post-decryption check on PoW and sender.
    pub fn match_message(&self, msg: &ReceivedMessage) -> bool {
        if self.pow > 0.0 && msg.pow < self.pow {
            return false;
        }
        if msg.key_fingerprint != self.key.fingerprint() {
            return false;
        }
        match (&self.src, &msg.src) {
            (None, _) => true,
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => false,
        }
    }

    /// Queue a message, ignoring duplicates.
    pub fn trigger(&self, msg: ReceivedMessage) {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        if inbox.seen.insert(msg.hash) {
            inbox.messages.push(msg);
        }
    }

    /// Drain pending messages in arrival order.
    pub fn retrieve(&self) -> Vec<ReceivedMessage> {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox.seen.clear();
        std::mem::take(&mut inbox.messages)
    }
}

/// Builds a [`Filter`], enforcing that exactly one key kind is set.
#[derive(Default)]
pub struct FilterBuilder {
    sym_key: Option<[u8; 32]>,
    asym_seed: Option<[u8; 32]>,
    topics: Vec<TopicType>,
    pow: f64,
    allow_p2p: bool,
    src: Option<[u8; 32]>,
}

impl FilterBuilder {
    pub fn symmetric_key(mut self, key: [u8; 32]) -> Self {
        self.sym_key = Some(key);
        self
    }

    pub fn asymmetric_key(mut self, seed: [u8; 32]) -> Self {
        self.asym_seed = Some(seed);
        self
    }

    pub fn topics(mut self, topics: impl IntoIterator<Item = TopicType>) -> Self {
        self.topics.extend(topics);
        self
    }

    pub fn min_pow(mut self, pow: f64) -> Self {
        self.pow = pow;
        self
    }

    pub fn allow_p2p(mut self, allow: bool) -> Self {
        self.allow_p2p = allow;
        self
    }

    /// Only accept messages signed by this Ed25519 key.
    pub fn source(mut self, public_key: [u8; 32]) -> Self {
        self.src = Some(public_key);
        self
    }

    pub fn build(self) -> Result<Filter, ProtocolError> {
        let key = match (self.sym_key, self.asym_seed) {
            (Some(_), Some(_)) => {
                return Err(ProtocolError::InvalidFilter {
                    reason: "filters must choose between symmetric and asymmetric keys".into(),
                })
            }
            (None, None) => {
                return Err(ProtocolError::InvalidFilter {
                    reason: "filter has no key".into(),
                })
            }
            (Some(key), None) => {
                if key.iter().all(|b| *b == 0) {
                    return Err(ProtocolError::InvalidFilter {
                        reason: "symmetric key is all zeros".into(),
                    });
                }
                OpeningKey::Symmetric(key)
            }
            (None, Some(seed)) => OpeningKey::Asymmetric { seed },
        };
        if !self.pow.is_finite() || self.pow < 0.0 {
            return Err(ProtocolError::InvalidFilter {
                reason: format!("invalid pow {}", self.pow),
            });
        }
        Ok(Filter {
            key,
            topics: self.topics,
            pow: self.pow,
            allow_p2p: self.allow_p2p,
            src: self.src,
            inbox: Mutex::new(Inbox::default()),
        })
    }
}

#[derive(Default)]
struct FiltersInner {
    watchers: HashMap<String, Arc<Filter>>,
    by_topic: HashMap<TopicType, HashSet<String>>,
    all_topics: HashSet<String>,
}

/// Installed filters, indexed by topic.
#[derive(Default)]
pub struct Filters {
    inner: RwLock<FiltersInner>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a filter and return its id.
    pub fn install(&self, filter: Filter) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let filter = Arc::new(filter);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if filter.topics.is_empty() {
            inner.all_topics.insert(id.clone());
        } else {
            for topic in &filter.topics {
                inner.by_topic.entry(*topic).or_default().insert(id.clone());
            }
        }
        inner.watchers.insert(id.clone(), filter);
        id
    }

    /// Remove a filter. Returns false for an unknown id.
    pub fn uninstall(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(filter) = inner.watchers.remove(id) else {
            return false;
        };
        inner.all_topics.remove(id);
        for topic in &filter.topics {
            if let Some(ids) = inner.by_topic.get_mut(topic) {
                ids.remove(id);
                if ids.is_empty() {
                    inner.by_topic.remove(topic);
                }
            }
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<Filter>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.watchers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filters interested in `topic`, wildcard filters included.
    pub fn watchers_for(&self, topic: &TopicType) -> Vec<Arc<Filter>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .by_topic
            .get(topic)
            .into_iter()
            .flatten()
            .chain(inner.all_topics.iter())
            .filter_map(|id| inner.watchers.get(id).cloned())
            .collect()
    }

    /// Deliver an envelope to every matching filter. Returns how many
    /// filters received it.
    pub fn notify_watchers(&self, envelope: &Envelope, is_p2p: bool) -> usize {
        let mut opened: HashMap<Hash, Option<ReceivedMessage>> = HashMap::new();
        let mut delivered = 0;
        for watcher in self.watchers_for(&envelope.topic) {
            if is_p2p && !watcher.allow_p2p {
                continue;
            }
            if !watcher.match_envelope(envelope) {
                continue;
            }
            let msg = opened
                .entry(watcher.key.fingerprint())
                .or_insert_with(|| match envelope.open(&watcher.key) {
                    Ok(mut msg) => {
                        msg.p2p = is_p2p;
                        Some(msg)
                    }
                    Err(e) => {
                        tracing::trace!(hash = %envelope.hash(), "failed to open envelope: {e}");
                        None
                    }
                });
            if let Some(msg) = msg {
                if watcher.match_message(msg) {
                    watcher.trigger(msg.clone());
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Topics of every installed filter, `None` if any filter is a wildcard.
    pub fn topics(&self) -> Option<HashSet<TopicType>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if !inner.all_topics.is_empty() {
            return None;
        }
        Some(inner.by_topic.keys().copied().collect())
    }
}
