//! Per-connection peer state and its broadcast loop.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ferry_transport::{MsgReadWriter, Packet, PeerId, RemotePeer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bloom::Bloom;
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::events::{EnvelopeEvent, EventKind};
use crate::options::{decode_status, encode_options, encode_status, RateLimits, StatusOptions};
use crate::pool::EnvelopePool;
use crate::settings::Interest;
use crate::types::{Hash, TopicType, EXPIRATION_CYCLE, PROTOCOL_VERSION, TRANSMISSION_CYCLE};
use crate::wire::{batch_hash, encode_batch, MESSAGES_CODE, STATUS_CODE, STATUS_UPDATE_CODE};

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Local side of the light-client restriction, checked during the handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMode {
    pub light_client: bool,
    pub restrict_light_client_connections: bool,
}

/// A connected remote node.
pub struct Peer {
    remote: RemotePeer,
    rw: Arc<dyn MsgReadWriter>,
    pool: Arc<EnvelopePool>,
    events: broadcast::Sender<EnvelopeEvent>,

    state: Mutex<PeerState>,
    trusted: AtomicBool,
    /// f64 bits.
    pow_requirement: AtomicU64,
    interest: RwLock<Interest>,
    light_node: AtomicBool,
    confirmations_enabled: AtomicBool,
    rate_limits: Mutex<RateLimits>,
    /// Envelopes the remote already has.
    known: Mutex<HashSet<Hash>>,

    quit: CancellationToken,
}

impl Peer {
    pub fn new(
        remote: RemotePeer,
        rw: Arc<dyn MsgReadWriter>,
        pool: Arc<EnvelopePool>,
        events: broadcast::Sender<EnvelopeEvent>,
    ) -> Self {
        Self {
            remote,
            rw,
            pool,
            events,
            state: Mutex::new(PeerState::Connecting),
            trusted: AtomicBool::new(false),
            pow_requirement: AtomicU64::new(0f64.to_bits()),
            interest: RwLock::new(Interest::full()),
            light_node: AtomicBool::new(false),
            confirmations_enabled: AtomicBool::new(false),
            rate_limits: Mutex::new(RateLimits::default()),
            known: Mutex::new(HashSet::new()),
            quit: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.remote.id
    }

    pub fn remote(&self) -> &RemotePeer {
        &self.remote
    }

    pub fn rw(&self) -> &Arc<dyn MsgReadWriter> {
        &self.rw
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: PeerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    // ── Advertised capabilities ──────────────────────────────────────

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::Relaxed)
    }

    /// Trusted peers may send direct (p2p) messages and request completions.
    pub fn set_trusted(&self, trusted: bool) {
        self.trusted.store(trusted, Ordering::Relaxed);
    }

    pub fn pow_requirement(&self) -> f64 {
        f64::from_bits(self.pow_requirement.load(Ordering::Relaxed))
    }

    pub fn set_pow_requirement(&self, pow: f64) {
        self.pow_requirement.store(pow.to_bits(), Ordering::Relaxed);
    }

    pub fn interest(&self) -> Interest {
        self.interest.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Switch to bloom matching. An empty bloom means "full node".
    pub fn set_bloom_filter(&self, bloom: &[u8]) {
        let bloom = Bloom::from_slice(bloom).unwrap_or_else(Bloom::full);
        *self.interest.write().unwrap_or_else(|e| e.into_inner()) = Interest::Bloom(bloom);
    }

    /// Switch to exact topic matching.
    pub fn set_topic_interest(&self, topics: &[TopicType]) {
        *self.interest.write().unwrap_or_else(|e| e.into_inner()) =
            Interest::Topics(topics.iter().copied().collect());
    }

    /// Does the remote want this envelope?
    pub fn topic_or_bloom_match(&self, envelope: &Envelope) -> bool {
        self.interest.read().unwrap_or_else(|e| e.into_inner()).matches(envelope)
    }

    pub fn is_light_node(&self) -> bool {
        self.light_node.load(Ordering::Relaxed)
    }

    pub fn confirmations_enabled(&self) -> bool {
        self.confirmations_enabled.load(Ordering::Relaxed)
    }

    pub fn rate_limits(&self) -> RateLimits {
        *self.rate_limits.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_rate_limits(&self, limits: RateLimits) {
        *self.rate_limits.lock().unwrap_or_else(|e| e.into_inner()) = limits;
    }

    /// Apply options from a `status` (after defaults) or `statusUpdate`
    /// packet. Only fields present are touched.
    pub fn apply_options(&self, options: &StatusOptions, local: LocalMode) -> Result<(), ProtocolError> {
        options.validate()?;

        if let Some(pow) = options.pow_requirement {
            self.set_pow_requirement(pow);
        }
        if let Some(topics) = &options.topic_interest {
            self.set_topic_interest(topics);
        } else if let Some(bloom) = &options.bloom_filter {
            self.set_bloom_filter(bloom);
        }
        if let Some(light) = options.light_node_enabled {
            if light && local.light_client && local.restrict_light_client_connections {
                return Err(ProtocolError::Handshake {
                    reason: "two light clients cannot talk to each other".into(),
                });
            }
            self.light_node.store(light, Ordering::Relaxed);
        }
        if let Some(confirmations) = options.confirmations_enabled {
            self.confirmations_enabled.store(confirmations, Ordering::Relaxed);
        }
        if let Some(limits) = options.rate_limits {
            self.set_rate_limits(limits);
        }
        Ok(())
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Exchange `status` packets. Our status is written while the remote's
    /// is read, so neither side waits on the other.
    pub async fn handshake(&self, ours: &StatusOptions, local: LocalMode) -> Result<(), ProtocolError> {
        self.set_state(PeerState::Handshaking);
        let payload = encode_status(ours)?;

        let (sent, received) = tokio::join!(
            self.rw.write_msg(Packet::new(STATUS_CODE, payload)),
            self.rw.read_msg()
        );

        let packet = received?;
        if packet.code != STATUS_CODE {
            return Err(ProtocolError::Handshake {
                reason: format!("peer {} sent packet {} before status", self.id().short(), packet.code),
            });
        }
        let (version, options) = decode_status(&packet.payload)?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::Handshake {
                reason: format!("protocol version mismatch {version} != {PROTOCOL_VERSION}"),
            });
        }
        self.apply_options(&options.with_defaults(), local)
            .map_err(|e| ProtocolError::Handshake {
                reason: format!("invalid options: {e}"),
            })?;
        sent.map_err(|e| ProtocolError::Handshake {
            reason: format!("failed to send status packet: {e}"),
        })?;

        self.set_state(PeerState::Active);
        Ok(())
    }

    // ── Known set ────────────────────────────────────────────────────

    pub fn mark(&self, hash: Hash) {
        self.known.lock().unwrap_or_else(|e| e.into_inner()).insert(hash);
    }

    pub fn marked(&self, hash: &Hash) -> bool {
        self.known.lock().unwrap_or_else(|e| e.into_inner()).contains(hash)
    }

    pub fn known_count(&self) -> usize {
        self.known.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forget envelopes that left the pool.
    pub fn expire(&self) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        self.pool.retain_present(&mut known);
    }

    // ── Broadcast ────────────────────────────────────────────────────

    /// Send every pooled envelope the remote does not know and wants, as
    /// one batch. Returns how many were sent.
    pub async fn broadcast(&self) -> Result<usize, ProtocolError> {
        let pow_requirement = self.pow_requirement();
        let mut bundle: Vec<(Hash, Arc<Envelope>)> = self
            .pool
            .envelopes()
            .into_iter()
            .filter(|(hash, env)| {
                !self.marked(hash) && env.pow() >= pow_requirement && self.topic_or_bloom_match(env)
            })
            .collect();
        if bundle.is_empty() {
            return Ok(0);
        }
        bundle.sort_by_key(|(_, env)| env.expiry);

        let payload = encode_batch(bundle.iter().map(|(_, env)| env.as_ref()))?;
        let batch = batch_hash(&payload);
        self.rw.write_msg(Packet::new(MESSAGES_CODE, payload)).await?;

        let batch = self.confirmations_enabled().then_some(batch);
        for (hash, _) in &bundle {
            self.mark(*hash);
            let _ = self.events.send(
                EnvelopeEvent::new(EventKind::EnvelopeSent, *hash)
                    .with_peer(self.id())
                    .with_batch(batch),
            );
        }
        trace!(peer = %self.id().short(), count = bundle.len(), "broadcast batch");
        Ok(bundle.len())
    }

    /// Start the expire/transmit loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let peer = Arc::clone(self);
        debug!(peer = %peer.id().short(), "starting peer");
        tokio::spawn(async move { peer.update().await })
    }

    /// Stop the loop. The connection itself is left to the caller.
    pub fn stop(&self) {
        self.quit.cancel();
        self.set_state(PeerState::Closed);
        debug!(peer = %self.id().short(), "stopping peer");
    }

    async fn update(&self) {
        let mut expire = tokio::time::interval(EXPIRATION_CYCLE);
        let mut transmit = tokio::time::interval(TRANSMISSION_CYCLE);
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => return,
                _ = expire.tick() => self.expire(),
                _ = transmit.tick() => {
                    if let Err(e) = self.broadcast().await {
                        debug!(peer = %self.id().short(), "broadcasting failed: {e}");
                        self.rw.close();
                        return;
                    }
                }
            }
        }
    }

    // ── Capability updates ───────────────────────────────────────────

    pub async fn send_status_update(&self, options: &StatusOptions) -> Result<(), ProtocolError> {
        let payload = encode_options(options)?;
        self.rw.write_msg(Packet::new(STATUS_UPDATE_CODE, payload)).await?;
        Ok(())
    }

    pub async fn notify_pow_requirement_change(&self, pow: f64) -> Result<(), ProtocolError> {
        self.send_status_update(&StatusOptions {
            pow_requirement: Some(pow),
            ..Default::default()
        })
        .await
    }

    pub async fn notify_bloom_filter_change(&self, bloom: &Bloom) -> Result<(), ProtocolError> {
        self.send_status_update(&StatusOptions {
            bloom_filter: Some(bloom.as_bytes().to_vec()),
            ..Default::default()
        })
        .await
    }

    pub async fn notify_topic_interest_change(&self, topics: Vec<TopicType>) -> Result<(), ProtocolError> {
        self.send_status_update(&StatusOptions {
            topic_interest: Some(topics),
            ..Default::default()
        })
        .await
    }

    pub async fn send(&self, packet: Packet) -> Result<(), ProtocolError> {
        self.rw.write_msg(packet).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.remote.id)
            .field("state", &self.state())
            .field("trusted", &self.is_trusted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_batch;
    use ferry_transport::msg_pipe;

    fn peer_pair() -> (Arc<Peer>, ferry_transport::MsgPipeEnd, Arc<EnvelopePool>, broadcast::Receiver<EnvelopeEvent>) {
        let (local, remote) = msg_pipe(8);
        let pool = Arc::new(EnvelopePool::new());
        let (tx, rx) = broadcast::channel(16);
        let peer = Arc::new(Peer::new(
            RemotePeer::new(PeerId::from_bytes([1; 32]), None),
            Arc::new(local),
            pool.clone(),
            tx,
        ));
        (peer, remote, pool, rx)
    }

    fn env(topic: [u8; 4], tag: u8) -> Envelope {
        Envelope {
            expiry: 1000 + tag as u32,
            ttl: 10,
            topic: TopicType(topic),
            data: vec![tag; 16],
            nonce: 0,
        }
    }

    #[tokio::test]
    async fn broadcast_sends_unknown_once() {
        let (peer, remote, pool, mut events) = peer_pair();
        let e = env([1, 2, 3, 4], 1);
        pool.insert(e.hash(), e.clone());

        assert_eq!(peer.broadcast().await.unwrap(), 1);
        let packet = remote.read_msg().await.unwrap();
        assert_eq!(packet.code, MESSAGES_CODE);
        assert_eq!(decode_batch(&packet.payload).unwrap(), vec![e.clone()]);

        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::EnvelopeSent);
        assert_eq!(ev.hash, e.hash());
        assert_eq!(ev.batch, None);

        assert_eq!(peer.broadcast().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn broadcast_respects_interest_and_pow() {
        let (peer, _remote, pool, _events) = peer_pair();
        let wanted = env([1, 2, 3, 4], 1);
        let other = env([9, 9, 9, 9], 2);
        pool.insert(wanted.hash(), wanted.clone());
        pool.insert(other.hash(), other.clone());

        peer.set_topic_interest(&[TopicType([1, 2, 3, 4])]);
        assert_eq!(peer.broadcast().await.unwrap(), 1);
        assert!(peer.marked(&wanted.hash()));
        assert!(!peer.marked(&other.hash()));

        peer.set_bloom_filter(&[]);
        peer.set_pow_requirement(f64::MAX);
        assert_eq!(peer.broadcast().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_topic_interest_receives_nothing() {
        let (peer, _remote, pool, _events) = peer_pair();
        let e = env([1, 2, 3, 4], 1);
        pool.insert(e.hash(), e);
        peer.set_topic_interest(&[]);
        assert_eq!(peer.broadcast().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expire_forgets_unpooled() {
        let (peer, _remote, pool, _events) = peer_pair();
        let e = env([1, 2, 3, 4], 1);
        pool.insert(e.hash(), e.clone());
        peer.mark(e.hash());
        peer.mark(Hash([7; 32]));
        peer.expire();
        assert_eq!(peer.known_count(), 1);
        pool.expire(u32::MAX);
        peer.expire();
        assert_eq!(peer.known_count(), 0);
    }

    #[tokio::test]
    async fn handshake_applies_remote_options() {
        let (peer, remote, _pool, _events) = peer_pair();
        let theirs = StatusOptions {
            pow_requirement: Some(3.0),
            confirmations_enabled: Some(true),
            topic_interest: Some(vec![TopicType([5; 4])]),
            ..Default::default()
        };
        remote
            .write_msg(Packet::new(STATUS_CODE, encode_status(&theirs).unwrap()))
            .await
            .unwrap();

        peer.handshake(&StatusOptions::default().with_defaults(), LocalMode::default())
            .await
            .unwrap();
        assert_eq!(peer.state(), PeerState::Active);
        assert_eq!(peer.pow_requirement(), 3.0);
        assert!(peer.confirmations_enabled());
        assert!(matches!(peer.interest(), Interest::Topics(t) if t.len() == 1));

        let ours = remote.read_msg().await.unwrap();
        assert_eq!(ours.code, STATUS_CODE);
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_first_packet() {
        let (peer, remote, _pool, _events) = peer_pair();
        remote.write_msg(Packet::new(MESSAGES_CODE, vec![0x90])).await.unwrap();
        let err = peer
            .handshake(&StatusOptions::default(), LocalMode::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before status"));
    }

    #[tokio::test]
    async fn two_light_clients_are_refused_when_restricted() {
        let (peer, _remote, _pool, _events) = peer_pair();
        let theirs = StatusOptions {
            light_node_enabled: Some(true),
            ..Default::default()
        };
        let strict = LocalMode {
            light_client: true,
            restrict_light_client_connections: true,
        };
        assert!(peer.apply_options(&theirs, strict).is_err());
        let lenient = LocalMode {
            light_client: true,
            restrict_light_client_connections: false,
        };
        assert!(peer.apply_options(&theirs, lenient).is_ok());
        assert!(peer.is_light_node());
    }

    #[tokio::test]
    async fn bloom_and_topic_interest_replace_each_other() {
        let (peer, _remote, _pool, _events) = peer_pair();
        peer.set_topic_interest(&[TopicType([1; 4])]);
        peer.set_bloom_filter(Bloom::from_topic(&TopicType([2; 4])).as_bytes());
        assert!(matches!(peer.interest(), Interest::Bloom(_)));
        peer.set_topic_interest(&[]);
        assert!(matches!(peer.interest(), Interest::Topics(t) if t.is_empty()));
    }
}
