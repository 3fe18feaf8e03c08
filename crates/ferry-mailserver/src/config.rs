use std::path::PathBuf;
use std::time::Duration;

use ferry_protocol::types::MAX_LIMIT_IN_MESSAGES_REQUEST;
use ferry_transport::DEFAULT_MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::MailServerError;

/// Where archived envelopes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StorageKind {
    /// Ordered in-memory map, lost on restart.
    Memory,
    /// SQLite database file.
    Sqlite { path: PathBuf },
}

/// Configuration of an [`ArchiveServer`](crate::ArchiveServer).
///
/// ```rust
/// use ferry_mailserver::MailServerConfig;
///
/// let config = MailServerConfig::default()
///     .password("secret")
///     .retention_days(30)
///     .rate_limit_secs(5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailServerConfig {
    pub storage: StorageKind,
    /// Archive retention; zero keeps everything and disables the cleaner.
    pub retention_days: u32,
    /// One request per peer per window; zero disables the limiter.
    pub rate_limit_secs: u64,
    /// PoW floor for request envelopes; zero disables the check.
    pub min_pow: f64,
    /// Largest page a peer may ask for, also the default page size.
    pub max_limit: u32,
    /// Deadline for serving one request.
    pub processing_timeout_secs: u64,
    pub cleaner_period_secs: u64,
    /// Rows deleted per prune transaction.
    pub cleaner_batch_size: usize,
    /// Upper bound for one bundle of envelopes, in bytes.
    pub max_bundle_size: usize,
    /// Envelopes waiting for the archive writer before new ones are dropped.
    pub archive_queue_size: usize,
    /// Shared password for symmetric request envelopes.
    pub password: Option<String>,
    /// Ed25519 seed for asymmetric request envelopes.
    pub identity_seed: Option<[u8; 32]>,
}

impl Default for MailServerConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Memory,
            retention_days: 0,
            rate_limit_secs: 0,
            min_pow: 0.0,
            max_limit: MAX_LIMIT_IN_MESSAGES_REQUEST,
            processing_timeout_secs: 60,
            cleaner_period_secs: 60 * 60,
            cleaner_batch_size: 1000,
            max_bundle_size: DEFAULT_MAX_MESSAGE_SIZE,
            archive_queue_size: 4096,
            password: None,
            identity_seed: None,
        }
    }
}

impl MailServerConfig {
    pub fn storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    pub fn sqlite(self, path: impl Into<PathBuf>) -> Self {
        self.storage(StorageKind::Sqlite { path: path.into() })
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn rate_limit_secs(mut self, secs: u64) -> Self {
        self.rate_limit_secs = secs;
        self
    }

    pub fn min_pow(mut self, pow: f64) -> Self {
        self.min_pow = pow;
        self
    }

    pub fn max_limit(mut self, limit: u32) -> Self {
        self.max_limit = limit;
        self
    }

    pub fn processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn cleaner_period(mut self, period: Duration) -> Self {
        self.cleaner_period_secs = period.as_secs().max(1);
        self
    }

    pub fn cleaner_batch_size(mut self, size: usize) -> Self {
        self.cleaner_batch_size = size;
        self
    }

    pub fn max_bundle_size(mut self, bytes: usize) -> Self {
        self.max_bundle_size = bytes;
        self
    }

    pub fn archive_queue_size(mut self, size: usize) -> Self {
        self.archive_queue_size = size;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn identity_seed(mut self, seed: [u8; 32]) -> Self {
        self.identity_seed = Some(seed);
        self
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_secs)
    }

    pub fn processing_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn cleaner_period_duration(&self) -> Duration {
        Duration::from_secs(self.cleaner_period_secs)
    }

    pub fn validate(&self) -> Result<(), MailServerError> {
        let bad = |reason: &str| MailServerError::Config { reason: reason.to_string() };
        if self.password.is_none() && self.identity_seed.is_none() {
            return Err(bad("password or identity seed is required"));
        }
        if !self.min_pow.is_finite() || self.min_pow < 0.0 {
            return Err(bad("min_pow must be a non-negative number"));
        }
        if self.max_limit == 0 || self.max_limit > MAX_LIMIT_IN_MESSAGES_REQUEST {
            return Err(MailServerError::Config {
                reason: format!("max_limit must be in 1..={MAX_LIMIT_IN_MESSAGES_REQUEST}"),
            });
        }
        if self.cleaner_batch_size == 0 {
            return Err(bad("cleaner_batch_size must be positive"));
        }
        if self.max_bundle_size == 0 {
            return Err(bad("max_bundle_size must be positive"));
        }
        if self.archive_queue_size == 0 {
            return Err(bad("archive_queue_size must be positive"));
        }
        if self.processing_timeout_secs == 0 {
            return Err(bad("processing timeout must be positive"));
        }
        Ok(())
    }
}
