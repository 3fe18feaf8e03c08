//! Ferry mail server.
//!
//! Archives every envelope a node admits and serves historic requests:
//! time range plus topic filter in, matching envelopes out as direct
//! messages, one page at a time with a resumable cursor.
//!
//! Storage is pluggable through [`StorageBackend`]: an ordered in-memory
//! map or SQLite.

pub mod archiver;
pub mod cleaner;
pub mod config;
pub mod dbkey;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod request;
pub mod server;
pub mod storage;

pub use archiver::ArchiveWriter;
pub use cleaner::DbCleaner;
pub use config::{MailServerConfig, StorageKind};
pub use dbkey::{DBKey, DB_KEY_LENGTH};
pub use error::{MailServerError, StorageError};
pub use limiter::RequestRateLimiter;
pub use metrics::MailServerMetrics;
pub use request::{HistoricRequest, MessagesRequestPayload, MAX_QUERY_RANGE, TTL_SAFE_THRESHOLD};
pub use server::{ArchiveServer, DeliveryOutcome};
pub use storage::{CursorQuery, MemoryStore, SqliteStore, StorageBackend, StoredRecord, TopicMatcher};
