//! Envelope lifecycle events published on the node's broadcast feed.
use ferry_transport::PeerId;

use crate::error::EnvelopeError;
use crate::types::{Hash, TopicType};
use crate::wire::RequestCompletion;

/// Capacity of the events broadcast channel. Slow subscribers lag and
/// miss events instead of blocking producers.
pub const EVENT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Envelope written to a peer.
    EnvelopeSent,
    /// Envelope dropped from the pool on expiry.
    EnvelopeExpired,
    /// Envelope received from a peer (whatever the admission outcome).
    EnvelopeReceived,
    /// Remote peer confirmed a batch.
    BatchAcknowledged,
    /// Envelope delivered to local filters.
    EnvelopeAvailable,
    MailServerRequestSent,
    MailServerRequestCompleted,
    MailServerRequestExpired,
    MailServerEnvelopeArchived,
    /// Last page of a mail server sync received.
    MailServerSyncFinished,
}

/// Extra payload attached to some events.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EventData {
    #[default]
    None,
    /// Per-envelope errors reported with a batch acknowledgement.
    Errors(Vec<EnvelopeError>),
    /// Outcome of a historic messages request.
    Completion(RequestCompletion),
    /// End of a mail server sync: where to resume, and the remote error if any.
    Sync { cursor: Vec<u8>, error: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeEvent {
    pub kind: EventKind,
    pub hash: Hash,
    /// Batch hash, set for confirmations-aware events.
    pub batch: Option<Hash>,
    pub peer: Option<PeerId>,
    pub topic: Option<TopicType>,
    pub data: EventData,
}

impl EnvelopeEvent {
    pub fn new(kind: EventKind, hash: Hash) -> Self {
        Self {
            kind,
            hash,
            batch: None,
            peer: None,
            topic: None,
            data: EventData::None,
        }
    }

    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_topic(mut self, topic: TopicType) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_batch(mut self, batch: Option<Hash>) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }
}
