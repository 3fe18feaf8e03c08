//! End-to-end tests driving a node through an in-memory connection. The
//! test plays the remote peer with raw packets.
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ferry_protocol::error::EnvelopeErrorCode;
use ferry_protocol::options::{decode_options, decode_status, encode_options, encode_status};
use ferry_protocol::wire::{
    decode_batch, encode_batch, VersionedResponse, BATCH_ACKNOWLEDGED_CODE, MESSAGES_CODE,
    MESSAGE_RESPONSE_CODE, P2P_MESSAGE_CODE, P2P_REQUEST_COMPLETE_CODE, STATUS_CODE, STATUS_UPDATE_CODE,
};
use ferry_protocol::{
    now_secs, wrap, Destination, DropPeerRateLimiterHandler, Envelope, EventKind, Filter, Hash,
    MessageParams, Node, NodeConfig, NodeMetrics, PeerRateLimiter, PeerRateLimiterConfig,
    ProtocolError, RateLimiterHandler, RateLimiterMetrics, RequestCompletion, StatusOptions, TopicType,
};
use ferry_transport::{msg_pipe, MsgPipeEnd, MsgReadWriter, Packet, PeerId, RemotePeer};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TOPIC: TopicType = TopicType([0xca, 0xfe, 0xba, 0xbe]);
const WAIT: Duration = Duration::from_secs(5);

fn new_node(config: NodeConfig) -> Arc<Node> {
    Node::new(config.min_pow(0.0), Arc::new(NodeMetrics::default()))
}

fn remote_id() -> PeerId {
    PeerId::from_bytes([9; 32])
}

/// Connect a fake remote to `node`. Returns the remote's end of the pipe and
/// the task running the connection.
fn connect(node: &Arc<Node>) -> (MsgPipeEnd, JoinHandle<Result<(), ProtocolError>>) {
    let (local, remote) = msg_pipe(64);
    let node = Arc::clone(node);
    let peer = RemotePeer::new(remote_id(), Some(IpAddr::from([10, 0, 0, 9])));
    let task = tokio::spawn(async move { node.handle_peer(peer, Arc::new(local)).await });
    (remote, task)
}

/// Complete the handshake from the remote side and return the node's status.
async fn handshake(remote: &MsgPipeEnd, ours: StatusOptions) -> StatusOptions {
    remote
        .write_msg(Packet::new(STATUS_CODE, encode_status(&ours).unwrap()))
        .await
        .unwrap();
    let packet = timeout(WAIT, remote.read_msg()).await.unwrap().unwrap();
    assert_eq!(packet.code, STATUS_CODE);
    let (version, options) = decode_status(&packet.payload).unwrap();
    assert_eq!(version, 1);
    options
}

fn open_status() -> StatusOptions {
    StatusOptions {
        pow_requirement: Some(0.0),
        ..Default::default()
    }
}

/// Next packet with `code`, skipping anything else.
async fn expect_code(remote: &MsgPipeEnd, code: u8) -> Packet {
    timeout(WAIT, async {
        loop {
            let packet = remote.read_msg().await.unwrap();
            if packet.code == code {
                return packet;
            }
        }
    })
    .await
    .unwrap()
}

fn envelope(expiry_offset: u32, tag: u8) -> Envelope {
    let now = now_secs();
    Envelope {
        expiry: now + expiry_offset,
        ttl: expiry_offset,
        topic: TOPIC,
        data: vec![tag; 32],
        nonce: 0,
    }
}

fn sealed(key: [u8; 32], body: &[u8]) -> Envelope {
    let params = MessageParams::new(TOPIC, body.to_vec(), Destination::Symmetric(key));
    wrap(&params, now_secs()).unwrap()
}

async fn wait_for_messages(filter: &Filter) -> Vec<ferry_protocol::ReceivedMessage> {
    timeout(WAIT, async {
        loop {
            let got = filter.retrieve();
            if !got.is_empty() {
                return got;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn handshake_advertises_settings_and_broadcasts_pool() {
    let node = new_node(NodeConfig::default().enable_confirmations(true));
    let e = envelope(60, 1);
    node.send(e.clone()).await.unwrap();

    let (remote, _task) = connect(&node);
    let theirs = handshake(&remote, open_status()).await;
    assert_eq!(theirs.pow_requirement, Some(0.0));
    assert_eq!(theirs.confirmations_enabled, Some(true));
    assert_eq!(theirs.light_node_enabled, Some(false));

    let packet = expect_code(&remote, MESSAGES_CODE).await;
    assert_eq!(decode_batch(&packet.payload).unwrap(), vec![e]);
}

#[tokio::test]
async fn confirmations_report_time_sync_errors_and_keep_peer() {
    let node = new_node(NodeConfig::default().enable_confirmations(true));
    let mut events = node.subscribe_envelope_events();
    let (remote, task) = connect(&node);
    handshake(&remote, open_status()).await;

    let good = envelope(60, 1);
    let mut future = envelope(60, 2);
    future.expiry += 1000;
    let payload = encode_batch([&good, &future]).unwrap();
    remote
        .write_msg(Packet::new(MESSAGES_CODE, payload.clone()))
        .await
        .unwrap();

    let response = expect_code(&remote, MESSAGE_RESPONSE_CODE).await;
    let versioned: VersionedResponse = rmp_serde::from_slice(&response.payload).unwrap();
    let response = versioned.decode_v1().unwrap();
    assert_eq!(response.hash, Hash::digest(&payload));
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].hash, future.hash());
    assert_eq!(response.errors[0].code, EnvelopeErrorCode::TimeSync);

    let ack = expect_code(&remote, BATCH_ACKNOWLEDGED_CODE).await;
    let acked: Hash = rmp_serde::from_slice(&ack.payload).unwrap();
    assert_eq!(acked, Hash::digest(&payload));

    assert!(node.get_envelope(&good.hash()).is_some());
    assert!(node.get_envelope(&future.hash()).is_none());

    let mut received = 0;
    while received < 2 {
        let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if ev.kind == EventKind::EnvelopeReceived {
            assert_eq!(ev.peer, Some(remote_id()));
            received += 1;
        }
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
}

#[tokio::test]
async fn invalid_envelope_drops_peer() {
    let node = new_node(NodeConfig::default());
    node.set_max_message_size(64).unwrap();
    let (remote, task) = connect(&node);
    handshake(&remote, open_status()).await;

    let mut big = envelope(60, 1);
    big.data = vec![1; 100];
    let _ = remote
        .write_msg(Packet::new(MESSAGES_CODE, encode_batch([&big]).unwrap()))
        .await;

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProtocolError::Oversize { .. } | ProtocolError::InvalidEnvelope(_))));
    assert_eq!(node.metrics().packets_invalid.get(), 1);
}

#[tokio::test]
async fn light_clients_refuse_each_other() {
    let node = new_node(
        NodeConfig::default()
            .light_client(true)
            .restrict_light_client_connections(true),
    );
    let (remote, task) = connect(&node);
    let _ = remote
        .write_msg(Packet::new(
            STATUS_CODE,
            encode_status(&StatusOptions {
                light_node_enabled: Some(true),
                ..Default::default()
            })
            .unwrap(),
        ))
        .await;

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProtocolError::Handshake { .. })));
}

#[tokio::test]
async fn unknown_codes_are_ignored_and_status_updates_apply() {
    let node = new_node(NodeConfig::default());
    let (remote, task) = connect(&node);
    handshake(&remote, open_status()).await;

    remote.write_msg(Packet::new(99, vec![1, 2, 3])).await.unwrap();
    let update = StatusOptions {
        pow_requirement: Some(3.5),
        ..Default::default()
    };
    remote
        .write_msg(Packet::new(STATUS_UPDATE_CODE, encode_options(&update).unwrap()))
        .await
        .unwrap();

    timeout(WAIT, async {
        loop {
            if let Ok(peer) = node.get_peer(&remote_id()) {
                if peer.pow_requirement() == 3.5 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!task.is_finished());
}

#[tokio::test]
async fn pow_change_is_pushed_to_peers() {
    let node = new_node(NodeConfig::default());
    let (remote, _task) = connect(&node);
    handshake(&remote, open_status()).await;
    timeout(WAIT, async {
        while node.get_peer(&remote_id()).is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    node.set_min_pow(2.5, true).await.unwrap();
    let packet = expect_code(&remote, STATUS_UPDATE_CODE).await;
    let options = decode_options(&packet.payload).unwrap();
    assert_eq!(options.pow_requirement, Some(2.5));
    assert_eq!(node.min_pow(), 2.5);
    assert_eq!(node.min_pow_tolerance(), 0.0);
}

#[tokio::test]
async fn local_send_reaches_filter() {
    let node = new_node(NodeConfig::default());
    node.start();

    let key = [7u8; 32];
    let id = node
        .subscribe(Filter::builder().symmetric_key(key).topics([TOPIC]).build().unwrap())
        .await
        .unwrap();
    node.send(sealed(key, b"hello ferry")).await.unwrap();

    let filter = node.get_filter(&id).unwrap();
    let messages = wait_for_messages(&filter).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, b"hello ferry");
    assert!(!messages[0].p2p);

    node.unsubscribe(&id).unwrap();
    assert!(node.get_filter(&id).is_none());
    node.stop();
}

#[tokio::test]
async fn direct_messages_require_trust_and_precede_completion() {
    let node = new_node(NodeConfig::default());
    node.start();
    let mut events = node.subscribe_envelope_events();

    let key = [3u8; 32];
    let id = node
        .subscribe(
            Filter::builder()
                .symmetric_key(key)
                .topics([TOPIC])
                .allow_p2p(true)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    let filter = node.get_filter(&id).unwrap();

    let (remote, _task) = connect(&node);
    handshake(&remote, open_status()).await;

    let ignored = sealed(key, b"untrusted");
    remote
        .write_msg(Packet::new(P2P_MESSAGE_CODE, encode_batch([&ignored]).unwrap()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(filter.retrieve().is_empty());

    node.allow_p2p_messages_from_peer(&remote_id()).unwrap();
    let direct = sealed(key, b"archived");
    remote
        .write_msg(Packet::new(P2P_MESSAGE_CODE, encode_batch([&direct]).unwrap()))
        .await
        .unwrap();
    let completion = RequestCompletion::Completed {
        request_id: Hash([5; 32]),
        last_envelope_hash: direct.hash(),
        cursor: Vec::new(),
    };
    remote
        .write_msg(Packet::new(P2P_REQUEST_COMPLETE_CODE, completion.to_bytes().unwrap()))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while !kinds.contains(&EventKind::MailServerRequestCompleted) {
        let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if matches!(ev.kind, EventKind::EnvelopeAvailable | EventKind::MailServerRequestCompleted) {
            kinds.push(ev.kind);
        }
    }
    assert_eq!(kinds, vec![EventKind::EnvelopeAvailable, EventKind::MailServerRequestCompleted]);

    let messages = filter.retrieve();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].p2p);
    assert_eq!(messages[0].payload, b"archived");
    node.stop();
}

#[tokio::test]
async fn expired_requests_are_forgotten() {
    let node = new_node(NodeConfig::default());
    let mut events = node.subscribe_envelope_events();
    let (remote, _task) = connect(&node);
    handshake(&remote, open_status()).await;

    let request = envelope(60, 7);
    node.request_historic_messages_with_timeout(&remote_id(), &request, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(node.pending_request_count(), 1);

    let expired = timeout(WAIT, async {
        loop {
            let ev = events.recv().await.unwrap();
            if ev.kind == EventKind::MailServerRequestExpired {
                return ev;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(expired.hash, request.hash());
    assert_eq!(node.pending_request_count(), 0);

    // A completed request is dropped as well.
    let answered = envelope(60, 8);
    node.request_historic_messages_with_timeout(&remote_id(), &answered, WAIT)
        .await
        .unwrap();
    let completion = RequestCompletion::Completed {
        request_id: answered.hash(),
        last_envelope_hash: Hash::default(),
        cursor: Vec::new(),
    };
    remote
        .write_msg(Packet::new(P2P_REQUEST_COMPLETE_CODE, completion.to_bytes().unwrap()))
        .await
        .unwrap();
    timeout(WAIT, async {
        while node.pending_request_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn rate_limited_peer_is_dropped() {
    let node = new_node(NodeConfig::default());
    let config = PeerRateLimiterConfig {
        limit_per_sec_ip: 0,
        limit_per_sec_peer_id: 1,
        ..Default::default()
    };
    let metrics = Arc::new(RateLimiterMetrics::default());
    let handlers = vec![Arc::new(DropPeerRateLimiterHandler::new(1)) as Arc<dyn RateLimiterHandler>];
    node.register_rate_limiter(Arc::new(PeerRateLimiter::new(&config, metrics.clone(), handlers)));
    assert_eq!(node.status_options().rate_limits.unwrap().peer_id_limits, 1);

    let (remote, task) = connect(&node);
    handshake(&remote, open_status()).await;
    for _ in 0..5 {
        if remote.write_msg(Packet::new(99, vec![0])).await.is_err() {
            break;
        }
    }

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProtocolError::RateLimited { .. })));
    assert_eq!(metrics.peers_dropped.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn tolerance_follows_the_latest_change_only() {
    let node = new_node(NodeConfig::default().sync_allowance(10));
    node.set_min_pow(1.0, true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    node.set_min_pow(2.0, true).await.unwrap();
    assert_eq!(node.min_pow_tolerance(), 0.0);

    // First timer fires at 10s but a newer change superseded it.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(node.min_pow_tolerance(), 0.0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(node.min_pow_tolerance(), 2.0);
}

#[tokio::test]
async fn disconnect_removes_peer() {
    let node = new_node(NodeConfig::default());
    let (remote, task) = connect(&node);
    handshake(&remote, open_status()).await;
    remote.close();
    let _ = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(node.peers().is_empty());
    assert_eq!(node.metrics().peers.get(), 0);
}
