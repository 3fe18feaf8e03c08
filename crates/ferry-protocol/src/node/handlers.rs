//! Per-connection message loop: one handler per packet code.
use std::sync::Arc;

use ferry_transport::{MsgReadWriter, Packet};
use serde_bytes::ByteBuf;
use tracing::{debug, trace, warn};

use super::{Node, P2pItem};
use crate::bloom::Bloom;
use crate::error::{EnvelopeError, ProtocolError};
use crate::events::{EnvelopeEvent, EventData, EventKind};
use crate::options::{decode_options, RateLimits};
use crate::peer::Peer;
use crate::types::{Hash, BLOOM_FILTER_SIZE};
use crate::wire::{
    batch_hash, decode_batch, MessagesResponse, P2pRequest, RequestCompletion, SyncMailRequest, SyncResponse,
    VersionedResponse, BATCH_ACKNOWLEDGED_CODE, BLOOM_FILTER_EX_CODE, MESSAGES_CODE, MESSAGE_RESPONSE_CODE,
    MESSAGE_RESPONSE_VERSION, P2P_MESSAGE_CODE, P2P_REQUEST_CODE, P2P_REQUEST_COMPLETE_CODE,
    P2P_SYNC_REQUEST_CODE, P2P_SYNC_RESPONSE_CODE, POW_REQUIREMENT_CODE, RATE_LIMITING_CODE, STATUS_UPDATE_CODE,
};

impl Node {
    /// Read and dispatch packets until the connection fails or a peer
    /// misbehaves. `rw` is the (possibly rate limited) connection.
    pub(crate) async fn run_message_loop(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        rw: Arc<dyn MsgReadWriter>,
    ) -> Result<(), ProtocolError> {
        loop {
            let packet = tokio::select! {
                _ = self.quit.cancelled() => return Ok(()),
                packet = rw.read_msg() => packet?,
            };

            let max = self.max_message_size();
            if packet.size() > max {
                self.metrics.packets_invalid.inc();
                warn!(peer = %peer.id().short(), size = packet.size(), "oversize message received");
                return Err(ProtocolError::Oversize {
                    size: packet.size(),
                    max,
                });
            }

            if let Err(e) = self.handle_packet(&peer, rw.as_ref(), packet).await {
                self.metrics.packets_invalid.inc();
                warn!(peer = %peer.id().short(), "dropping peer: {e}");
                return Err(e);
            }
        }
    }

    async fn handle_packet(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        rw: &dyn MsgReadWriter,
        packet: Packet,
    ) -> Result<(), ProtocolError> {
        trace!(peer = %peer.id().short(), code = packet.code, size = packet.size(), "packet");
        match packet.code {
            MESSAGES_CODE => self.handle_messages(peer, rw, &packet.payload).await,
            POW_REQUIREMENT_CODE => handle_pow_requirement(peer, &packet.payload),
            BLOOM_FILTER_EX_CODE => handle_bloom_filter_ex(peer, &packet.payload),
            P2P_MESSAGE_CODE => self.handle_p2p_message(peer, &packet.payload).await,
            P2P_REQUEST_CODE => self.handle_p2p_request(peer, &packet.payload),
            P2P_REQUEST_COMPLETE_CODE => self.handle_request_complete(peer, &packet.payload).await,
            P2P_SYNC_REQUEST_CODE => self.handle_sync_request(peer, &packet.payload),
            P2P_SYNC_RESPONSE_CODE => self.handle_sync_response(peer, &packet.payload),
            MESSAGE_RESPONSE_CODE => self.handle_message_response(peer, &packet.payload),
            BATCH_ACKNOWLEDGED_CODE => self.handle_batch_ack(peer, &packet.payload),
            STATUS_UPDATE_CODE => {
                let options = decode_options(&packet.payload)?;
                peer.apply_options(&options, self.local_mode())
            }
            RATE_LIMITING_CODE => {
                let limits: RateLimits = rmp_serde::from_slice(&packet.payload)
                    .map_err(|e| ProtocolError::InvalidOptions {
                        reason: format!("invalid rate limits: {e}"),
                    })?;
                peer.set_rate_limits(limits);
                Ok(())
            }
            code => {
                debug!(peer = %peer.id().short(), code, "ignoring unknown packet code");
                Ok(())
            }
        }
    }

    /// Admit a batch of envelopes. Time-sync failures are reported back
    /// but never cost the peer its connection; any other failure does,
    /// after the whole batch has been processed.
    async fn handle_messages(
        &self,
        peer: &Arc<Peer>,
        rw: &dyn MsgReadWriter,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let envelopes =
            decode_batch(payload).map_err(|e| ProtocolError::InvalidEnvelope(format!("undecodable batch: {e}")))?;
        let light = self.light_client_mode();

        let mut errors = Vec::new();
        let mut trouble = None;
        for envelope in envelopes {
            let hash = envelope.hash();
            let topic = envelope.topic;
            match self.add(envelope, light).await {
                Ok(true) => peer.mark(hash),
                Ok(false) => {}
                Err(e) => {
                    if e.is_time_sync() {
                        debug!(peer = %peer.id().short(), %hash, "envelope rejected: {e}");
                    } else {
                        warn!(peer = %peer.id().short(), %hash, "bad envelope received: {e}");
                        trouble.get_or_insert_with(|| e.to_string());
                    }
                    errors.push(EnvelopeError::new(hash, &e));
                }
            }
            self.emit(
                EnvelopeEvent::new(EventKind::EnvelopeReceived, hash)
                    .with_peer(peer.id())
                    .with_topic(topic),
            );
        }

        if self.confirmations_enabled() {
            let batch = batch_hash(payload);
            let response = VersionedResponse::new(&MessagesResponse { hash: batch, errors })?;
            rw.write_msg(Packet::new(MESSAGE_RESPONSE_CODE, rmp_serde::to_vec(&response)?))
                .await?;
            rw.write_msg(Packet::new(BATCH_ACKNOWLEDGED_CODE, rmp_serde::to_vec(&batch)?))
                .await?;
        }

        match trouble {
            Some(reason) => Err(ProtocolError::InvalidEnvelope(reason)),
            None => Ok(()),
        }
    }

    async fn handle_p2p_message(&self, peer: &Arc<Peer>, payload: &[u8]) -> Result<(), ProtocolError> {
        if !peer.is_trusted() {
            debug!(peer = %peer.id().short(), "ignoring direct message from untrusted peer");
            return Ok(());
        }
        let envelopes =
            decode_batch(payload).map_err(|e| ProtocolError::InvalidEnvelope(format!("undecodable direct message: {e}")))?;
        for envelope in envelopes {
            self.post_p2p(P2pItem::Envelope(Arc::new(envelope))).await;
        }
        Ok(())
    }

    fn handle_p2p_request(&self, peer: &Arc<Peer>, payload: &[u8]) -> Result<(), ProtocolError> {
        let Some(server) = self.mail_server() else {
            debug!(peer = %peer.id().short(), "no mail server, ignoring request");
            return Ok(());
        };
        let request = P2pRequest::decode(payload)?;
        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            match request {
                P2pRequest::Envelope(envelope) => server.deliver_mail(peer, envelope).await,
                P2pRequest::Structured(request) => server.deliver(peer, request).await,
            }
        });
        Ok(())
    }

    async fn handle_request_complete(&self, peer: &Arc<Peer>, payload: &[u8]) -> Result<(), ProtocolError> {
        if !peer.is_trusted() {
            debug!(peer = %peer.id().short(), "ignoring request completion from untrusted peer");
            return Ok(());
        }
        let completion = RequestCompletion::from_bytes(payload).map_err(|e| ProtocolError::InvalidRequest {
            reason: format!("invalid request completion: {e}"),
        })?;
        let request_id = completion.request_id();
        self.complete_request(&request_id);

        // Queued behind the direct envelopes of the same request.
        let event = EnvelopeEvent::new(EventKind::MailServerRequestCompleted, request_id)
            .with_peer(peer.id())
            .with_data(EventData::Completion(completion));
        self.post_p2p(P2pItem::Event(event)).await;
        Ok(())
    }

    fn handle_sync_request(&self, peer: &Arc<Peer>, payload: &[u8]) -> Result<(), ProtocolError> {
        let Some(server) = self.mail_server() else {
            debug!(peer = %peer.id().short(), "no mail server, ignoring sync request");
            return Ok(());
        };
        let request = SyncMailRequest::from_bytes(payload).map_err(|e| ProtocolError::InvalidRequest {
            reason: format!("invalid sync request: {e}"),
        })?;
        request.validate()?;
        let peer = Arc::clone(peer);
        tokio::spawn(async move { server.sync_mail(peer, request).await });
        Ok(())
    }

    /// Archive the envelopes of a sync page. Only trusted peers, and only
    /// when this node runs a mail server.
    fn handle_sync_response(&self, peer: &Arc<Peer>, payload: &[u8]) -> Result<(), ProtocolError> {
        let server = match self.mail_server() {
            Some(server) if peer.is_trusted() => server,
            _ => {
                debug!(peer = %peer.id().short(), "ignoring sync response");
                return Ok(());
            }
        };
        let response = SyncResponse::from_bytes(payload).map_err(|e| ProtocolError::InvalidRequest {
            reason: format!("invalid sync response: {e}"),
        })?;
        let envelopes = response
            .decode_envelopes()
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("undecodable sync page: {e}")))?;
        debug!(
            peer = %peer.id().short(),
            count = envelopes.len(),
            finished = response.finished,
            error = %response.error,
            "sync page received"
        );
        for envelope in &envelopes {
            server.archive(envelope);
        }
        if response.is_last() {
            let error = (!response.error.is_empty()).then_some(response.error);
            self.emit(
                EnvelopeEvent::new(EventKind::MailServerSyncFinished, Hash::default())
                    .with_peer(peer.id())
                    .with_data(EventData::Sync {
                        cursor: response.cursor,
                        error,
                    }),
            );
        }
        Ok(())
    }

    fn handle_message_response(&self, peer: &Arc<Peer>, payload: &[u8]) -> Result<(), ProtocolError> {
        let versioned: VersionedResponse = rmp_serde::from_slice(payload)?;
        if versioned.version != MESSAGE_RESPONSE_VERSION {
            debug!(peer = %peer.id().short(), version = versioned.version, "unknown message response version");
            return Ok(());
        }
        let response = versioned.decode_v1()?;
        self.emit(
            EnvelopeEvent::new(EventKind::BatchAcknowledged, response.hash)
                .with_batch(Some(response.hash))
                .with_peer(peer.id())
                .with_data(EventData::Errors(response.errors)),
        );
        Ok(())
    }

    fn handle_batch_ack(&self, peer: &Arc<Peer>, payload: &[u8]) -> Result<(), ProtocolError> {
        let batch: Hash = rmp_serde::from_slice(payload)?;
        self.emit(
            EnvelopeEvent::new(EventKind::BatchAcknowledged, batch)
                .with_batch(Some(batch))
                .with_peer(peer.id()),
        );
        Ok(())
    }
}

fn handle_pow_requirement(peer: &Peer, payload: &[u8]) -> Result<(), ProtocolError> {
    let bits: u64 = rmp_serde::from_slice(payload)?;
    let pow = f64::from_bits(bits);
    if !pow.is_finite() || pow < 0.0 {
        return Err(ProtocolError::InvalidOptions {
            reason: format!("invalid pow requirement: {pow}"),
        });
    }
    peer.set_pow_requirement(pow);
    Ok(())
}

fn handle_bloom_filter_ex(peer: &Peer, payload: &[u8]) -> Result<(), ProtocolError> {
    let bloom: ByteBuf = rmp_serde::from_slice(payload)?;
    if Bloom::from_slice(&bloom).is_none() {
        return Err(ProtocolError::InvalidOptions {
            reason: format!("bloom filter must be {BLOOM_FILTER_SIZE} bytes, got {}", bloom.len()),
        });
    }
    peer.set_bloom_filter(&bloom);
    Ok(())
}
