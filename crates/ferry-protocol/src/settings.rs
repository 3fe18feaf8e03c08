//! Hot-swappable node settings.
//!
//! PoW floor and interest each keep a *current* and a *tolerated* value.
//! After a live change the tolerated value lags behind for the sync
//! allowance so peers that have not yet processed the update are not
//! punished for envelopes already in flight.
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::bloom::{bloom_filter_match, Bloom};
use crate::envelope::Envelope;
use crate::types::{now_secs, TopicType};

/// What a node (ours or a remote peer) wants to receive.
///
/// Bloom and topic interest are mutually exclusive: setting one replaces
/// the other.
#[derive(Clone, PartialEq, Eq)]
pub enum Interest {
    Bloom(Bloom),
    /// Exact topic set. An empty set matches nothing.
    Topics(HashSet<TopicType>),
}

impl Interest {
    /// Accept everything.
    pub fn full() -> Self {
        Interest::Bloom(Bloom::full())
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Interest::Bloom(b) if b.is_full())
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Interest::Bloom(b) => bloom_filter_match(Some(b), &envelope.bloom()),
            Interest::Topics(topics) => topics.contains(&envelope.topic),
        }
    }

    /// Aggregate bloom for this interest.
    pub fn bloom(&self) -> Bloom {
        match self {
            Interest::Bloom(b) => *b,
            Interest::Topics(topics) => Bloom::from_topics(topics),
        }
    }
}

impl Default for Interest {
    fn default() -> Self {
        Self::full()
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::Bloom(b) if b.is_full() => f.write_str("Interest::Full"),
            Interest::Bloom(b) => write!(f, "Interest::Bloom({b:?})"),
            Interest::Topics(t) => write!(f, "Interest::Topics({} topics)", t.len()),
        }
    }
}

/// Clock used for admission and expiry, in unix seconds.
pub type TimeSource = Arc<dyn Fn() -> u32 + Send + Sync>;

pub fn system_time_source() -> TimeSource {
    Arc::new(now_secs)
}

/// Snapshot of the dynamic settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_message_size: usize,
    pub confirmations_enabled: bool,
    pub min_pow: f64,
    pub min_pow_tolerance: f64,
    pub interest: Interest,
    pub interest_tolerance: Interest,
    pub light_client: bool,
    pub restrict_light_client_connections: bool,
    pub sync_allowance: u32,
    /// Bumped on every change.
    pub version: u64,
}

impl Settings {
    /// PoW check with fallback to the tolerated floor.
    pub fn pow_accepted(&self, pow: f64) -> bool {
        pow >= self.min_pow || pow >= self.min_pow_tolerance
    }

    /// Interest check with fallback to the tolerated interest.
    pub fn interest_accepted(&self, envelope: &Envelope) -> bool {
        self.interest.matches(envelope) || self.interest_tolerance.matches(envelope)
    }
}

/// Lock-guarded settings with versioned updates.
pub struct SettingsStore {
    inner: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&Settings) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn snapshot(&self) -> Settings {
        self.read(Settings::clone)
    }

    /// Apply `f`, bump the version and return the new version.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> u64 {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
        guard.version += 1;
        guard.version
    }

    /// Apply `f` without bumping the version, for settings that have no
    /// tolerated counterpart.
    pub fn modify(&self, f: impl FnOnce(&mut Settings)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    /// Apply `f` only if nothing changed since `version`. Used by the
    /// tolerance timers; does not bump the version.
    pub fn update_if_version(&self, version: u64, f: impl FnOnce(&mut Settings)) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if guard.version != version {
            return false;
        }
        f(&mut guard);
        true
    }
}
