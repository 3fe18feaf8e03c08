//! Admission control and queueing of accepted envelopes.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::{Node, P2pItem};
use crate::envelope::Envelope;
use crate::error::AdmissionError;
use crate::events::{EnvelopeEvent, EventKind};

impl Node {
    /// Validate an envelope and pool it.
    ///
    /// Returns `Ok(true)` when the envelope is (or already was) pooled and
    /// `Ok(false)` when it expired recently and was dropped silently.
    /// With `is_p2p` a newly pooled envelope reaches the local filters as
    /// a direct message.
    pub async fn add(&self, envelope: Envelope, is_p2p: bool) -> Result<bool, AdmissionError> {
        self.metrics.envelopes_received.inc();
        let now = self.now();
        let settings = self.settings.snapshot();
        let sent = envelope.sent();

        let pow = if sent > now {
            if sent - now > settings.sync_allowance {
                self.metrics.envelopes_rejected_future.inc();
                return Err(AdmissionError::FromFuture { sent, now });
            }
            // Skewed clocks earn the envelope a little extra time.
            envelope.pow_with_credit(sent - now + 1)
        } else {
            envelope.pow()
        };

        if envelope.expiry < now {
            if envelope.expiry.saturating_add(settings.sync_allowance.saturating_mul(2)) < now {
                self.metrics.envelopes_rejected_very_old.inc();
                return Err(AdmissionError::VeryOld {
                    expiry: envelope.expiry,
                    now,
                });
            }
            self.metrics.envelopes_dropped_expired.inc();
            trace!(expiry = envelope.expiry, now, "dropping recently expired envelope");
            return Ok(false);
        }

        let size = envelope.size();
        if size > settings.max_message_size {
            self.metrics.envelopes_rejected_oversized.inc();
            return Err(AdmissionError::Oversized {
                size,
                max: settings.max_message_size,
            });
        }

        if !settings.pow_accepted(pow) {
            self.metrics.envelopes_rejected_low_pow.inc();
            return Err(AdmissionError::LowPow {
                pow,
                required: settings.min_pow,
            });
        }

        if !settings.interest_accepted(&envelope) {
            self.metrics.envelopes_rejected_no_match.inc();
            return Err(AdmissionError::FilterMismatch {
                topic: envelope.topic.to_string(),
            });
        }

        self.metrics.envelopes_validated.inc();
        self.metrics.envelope_size.observe(size as u64);

        let hash = envelope.hash();
        let (envelope, inserted) = self.pool.insert(hash, envelope);
        if !inserted {
            self.metrics.envelopes_cache_hits.inc();
            trace!(hash = %hash, "envelope already cached");
            return Ok(true);
        }
        self.metrics.envelopes_cached.inc();
        self.metrics.pool_size.set(self.pool.len() as i64);
        trace!(hash = %hash, "cached envelope");

        self.post_event(Arc::clone(&envelope), is_p2p).await;

        if let Some(server) = self.mail_server() {
            server.archive(&envelope);
            self.emit(EnvelopeEvent::new(EventKind::MailServerEnvelopeArchived, hash).with_topic(envelope.topic));
        }
        Ok(true)
    }

    /// Queue a pooled envelope for local delivery.
    async fn post_event(&self, envelope: Arc<Envelope>, is_p2p: bool) {
        if is_p2p {
            self.post_p2p(P2pItem::Envelope(envelope)).await;
            return;
        }
        self.check_overflow(self.msg_tx.max_capacity() - self.msg_tx.capacity(), self.msg_tx.max_capacity());
        tokio::select! {
            _ = self.quit.cancelled() => debug!("node stopped, envelope not queued"),
            res = self.msg_tx.send(envelope) => {
                if res.is_err() {
                    debug!("message queue closed");
                }
            }
        }
    }

    /// Queue a direct envelope or an event that must follow direct envelopes.
    pub(crate) async fn post_p2p(&self, item: P2pItem) {
        tokio::select! {
            _ = self.quit.cancelled() => debug!("node stopped, p2p item not queued"),
            res = self.p2p_tx.send(item) => {
                if res.is_err() {
                    debug!("p2p queue closed");
                }
            }
        }
    }

    fn check_overflow(&self, queued: usize, capacity: usize) {
        if queued >= capacity {
            if !self.overflow.swap(true, Ordering::Relaxed) {
                self.metrics.queue_overflows.inc();
                warn!(queued, "message queue overflow");
            }
        } else if queued <= capacity / 2 && self.overflow.swap(false, Ordering::Relaxed) {
            info!(queued, "message queue overflow fixed (back to normal)");
        }
    }
}
