//! Ferry protocol layer.
//!
//! Envelope dissemination: every node keeps a pool of live
//! envelopes and forwards each one to every peer whose advertised PoW
//! floor and topic interest it satisfies. Local subscribers install
//! filters that decrypt the envelopes addressed to them.
//!
//! Wire format: MessagePack (compact binary).
//! Crypto: Ed25519 signatures + XChaCha20-Poly1305 encryption.

pub mod bloom;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod events;
pub mod filter;
pub mod mailserver;
pub mod message;
pub mod metrics;
pub mod node;
pub mod options;
pub mod peer;
pub mod pool;
pub mod rate_limiter;
pub mod settings;
pub mod types;
pub mod wire;

pub use bloom::{bloom_filter_match, is_full_node, Bloom};
pub use config::{NodeConfig, PeerRateLimiterConfig};
pub use envelope::Envelope;
pub use error::{AdmissionError, EnvelopeError, EnvelopeErrorCode, ProtocolError};
pub use events::{EnvelopeEvent, EventData, EventKind};
pub use filter::{Filter, FilterBuilder, Filters};
pub use mailserver::MailServer;
pub use message::{wrap, Destination, MessageParams, OpeningKey, ReceivedMessage};
pub use metrics::{NodeMetrics, RateLimiterMetrics};
pub use node::Node;
pub use options::{RateLimits, StatusOptions};
pub use peer::{LocalMode, Peer, PeerState};
pub use pool::EnvelopePool;
pub use rate_limiter::{
    DropPeerRateLimiterHandler, MetricsRateLimiterHandler, PeerRateLimiter, RateLimiterHandler,
};
pub use settings::{Interest, Settings, TimeSource};
pub use types::{now_secs, Hash, TopicType};
pub use wire::{MessagesRequest, MessagesResponse, P2pRequest, RequestCompletion, SyncMailRequest, SyncResponse};
