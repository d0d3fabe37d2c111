//! Tests for the signaling wire format and the handshake state machine

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::*;
use crate::error::HandshakeError;
use crate::memory::{MemoryHub, SimNetwork};

const REMOTE_CANDIDATE: &str =
    r#"{"candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host","sdpMid":"0","sdpMLineIndex":0}"#;

#[test]
fn test_offer_envelope_format() {
    let json = SignalingEnvelope::offer("v=0\r\n").to_json().unwrap();
    assert_eq!(json, r#"{"type":"offer","sdp":"v=0\r\n"}"#);

    let parsed = SignalingEnvelope::from_json(&json).unwrap();
    assert_eq!(parsed.kind(), "offer");
    assert_eq!(parsed, SignalingEnvelope::offer("v=0\r\n"));
}

#[test]
fn test_answer_envelope_format() {
    let json = SignalingEnvelope::answer("v=0").to_json().unwrap();
    assert_eq!(json, r#"{"type":"answer","sdp":"v=0"}"#);
    assert_eq!(SignalingEnvelope::from_json(&json).unwrap().kind(), "answer");
}

#[test]
fn test_candidate_envelope_nests_json_string() {
    let json = SignalingEnvelope::candidate(REMOTE_CANDIDATE).to_json().unwrap();
    assert!(json.starts_with(r#"{"type":"candidate","candidate":"{\"candidate\":"#));

    match SignalingEnvelope::from_json(&json).unwrap() {
        SignalingEnvelope::Candidate { candidate } => {
            let inner: serde_json::Value = serde_json::from_str(&candidate).unwrap();
            assert_eq!(inner["sdpMid"], "0");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_parse_browser_envelopes() {
    let offer = r#"{"type":"offer","sdp":"v=0\r\no=- 123 456 IN IP4 127.0.0.1\r\n"}"#;
    assert!(matches!(
        SignalingEnvelope::from_json(offer).unwrap(),
        SignalingEnvelope::Offer { .. }
    ));

    assert!(SignalingEnvelope::from_json(r#"{"type":"hello","peerId":"x"}"#).is_err());
    assert!(SignalingEnvelope::from_json(r#"{"type":"offer"}"#).is_err());
    assert!(SignalingEnvelope::from_json("not json").is_err());
}

#[test]
fn test_peer_record_format() {
    let peer = Peer::with_online_since("alice", 1_700_000_000);
    let json = serde_json::to_string(&peer).unwrap();
    assert_eq!(json, r#"{"name":"alice","online_since":1700000000}"#);
    assert_eq!(serde_json::from_str::<Peer>(&json).unwrap(), peer);
}

#[test]
fn test_generated_names() {
    let a = generate_name();
    let b = generate_name();
    assert!(a.starts_with("peer-"));
    assert_eq!(a.len(), "peer-".len() + 8);
    assert_ne!(a, b);
}

struct Side {
    peer: Peer,
    coordinator: Arc<HandshakeCoordinator>,
    inbox: mpsc::UnboundedReceiver<SignalMessage>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// A coordinator whose inbox the test drains by hand
async fn side(hub: &MemoryHub, net: &SimNetwork, name: &str, open_timeout: Duration) -> Side {
    let peer = Peer::new(name);
    let signaling = Arc::new(SignalingTransport::new(
        peer.clone(),
        Arc::new(hub.signaling_client()),
    ));
    let inbox = hub.signaling_client().subscribe(&peer).await.unwrap();
    let (tx, events) = mpsc::unbounded_channel();
    let coordinator = HandshakeCoordinator::new(
        signaling,
        Arc::new(net.connector(name)),
        tx,
        open_timeout,
    )
    .await
    .unwrap();
    Side {
        peer,
        coordinator: Arc::new(coordinator),
        inbox,
        events,
    }
}

async fn recv(inbox: &mut mpsc::UnboundedReceiver<SignalMessage>) -> SignalMessage {
    tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("timed out waiting for signal")
        .expect("inbox closed")
}

/// Receive until a message of `kind` arrives; returns it and the skipped messages
async fn recv_kind(
    inbox: &mut mpsc::UnboundedReceiver<SignalMessage>,
    kind: &str,
) -> (SignalMessage, Vec<SignalMessage>) {
    let mut skipped = Vec::new();
    loop {
        let msg = recv(inbox).await;
        if SignalingEnvelope::from_json(&msg.message).unwrap().kind() == kind {
            return (msg, skipped);
        }
        skipped.push(msg);
    }
}

async fn deliver(to: &Side, msg: &SignalMessage) {
    to.coordinator
        .apply_signal(&msg.from, &msg.message)
        .await
        .unwrap();
}

fn spawn_handshake(
    from: &Side,
    to: &Peer,
) -> tokio::task::JoinHandle<Result<ReliableChannel, HandshakeError>> {
    let coordinator = from.coordinator.clone();
    let to = to.clone();
    tokio::spawn(async move { coordinator.handshake(&to).await })
}

async fn wait_phase(side: &Side, phase: HandshakePhase) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while side.coordinator.phase().await != phase {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("phase not reached");
}

fn count(hub: &MemoryHub, from: &str, kind: &str) -> usize {
    hub.sent_envelopes()
        .iter()
        .filter(|(f, _, e)| f == from && e.kind() == kind)
        .count()
}

const T: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_alice_and_bob_handshake() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let mut alice = side(&hub, &net, "alice", T).await;
    let mut bob = side(&hub, &net, "bob", T).await;

    let pending = spawn_handshake(&alice, &bob.peer);

    let offer = recv(&mut bob.inbox).await;
    assert_eq!(offer.from.name, "alice");
    assert_eq!(
        SignalingEnvelope::from_json(&offer.message).unwrap().kind(),
        "offer"
    );
    deliver(&bob, &offer).await;
    assert_eq!(bob.coordinator.phase().await, HandshakePhase::LocalAnswerSent);
    assert_eq!(bob.coordinator.peer().await.unwrap().name, "alice");

    let (answer, skipped) = recv_kind(&mut alice.inbox, "answer").await;
    assert!(skipped.is_empty());
    assert_eq!(answer.from.name, "bob");
    deliver(&alice, &answer).await;

    let channel = pending.await.unwrap().unwrap();
    assert_eq!(channel.peer().name, "bob");
    assert_eq!(alice.coordinator.phase().await, HandshakePhase::Connected);
    wait_phase(&bob, HandshakePhase::Connected).await;

    assert_eq!(count(&hub, "alice", "offer"), 1);
    assert_eq!(count(&hub, "bob", "answer"), 1);

    channel.send(Bytes::from_static(b"hello")).await.unwrap();
    match tokio::time::timeout(T, bob.events.recv()).await.unwrap() {
        Some(SessionEvent::Message { from, data }) => {
            assert_eq!(from.unwrap().name, "alice");
            assert_eq!(&data[..], b"hello");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_local_candidates_follow_offer_to_tagged_peer() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    net.set_candidates_per_description(3);
    let alice = side(&hub, &net, "alice", T).await;
    let mut bob = side(&hub, &net, "bob", T).await;

    let _pending = spawn_handshake(&alice, &bob.peer);

    let kinds: Vec<&'static str> = {
        let mut kinds = Vec::new();
        for _ in 0..4 {
            let msg = recv(&mut bob.inbox).await;
            kinds.push(SignalingEnvelope::from_json(&msg.message).unwrap().kind());
        }
        kinds
    };
    assert_eq!(kinds, vec!["offer", "candidate", "candidate", "candidate"]);
}

#[tokio::test]
async fn test_candidate_buffered_until_answer() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let mut alice = side(&hub, &net, "alice", T).await;
    let mut bob = side(&hub, &net, "bob", T).await;

    let pending = spawn_handshake(&alice, &bob.peer);
    let offer = recv(&mut bob.inbox).await;

    let early = SignalingEnvelope::candidate(REMOTE_CANDIDATE).to_json().unwrap();
    alice.coordinator.apply_signal(&bob.peer, &early).await.unwrap();
    assert_eq!(alice.coordinator.pending_candidate_count().await, 1);

    let probe = net.endpoints_of("alice").pop().unwrap();
    assert!(!probe.has_remote_description());
    assert!(probe.remote_candidates().is_empty());

    deliver(&bob, &offer).await;
    let (answer, _) = recv_kind(&mut alice.inbox, "answer").await;
    deliver(&alice, &answer).await;

    assert_eq!(alice.coordinator.pending_candidate_count().await, 0);
    assert_eq!(probe.remote_candidates(), vec![REMOTE_CANDIDATE.to_string()]);

    // Trickled candidates after the answer go straight through
    tokio::time::sleep(Duration::from_millis(20)).await;
    while let Ok(msg) = alice.inbox.try_recv() {
        deliver(&alice, &msg).await;
    }
    let replayed = probe
        .remote_candidates()
        .iter()
        .filter(|c| *c == REMOTE_CANDIDATE)
        .count();
    assert_eq!(replayed, 1);
    assert_eq!(probe.remote_candidates().len(), 3);

    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_responder_buffers_candidates_before_offer() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let alice = side(&hub, &net, "alice", T).await;
    let mut bob = side(&hub, &net, "bob", T).await;

    let _pending = spawn_handshake(&alice, &bob.peer);
    let offer = recv(&mut bob.inbox).await;
    let mut candidates = Vec::new();
    for _ in 0..2 {
        candidates.push(recv(&mut bob.inbox).await);
    }

    // Candidates overtake the offer
    for c in &candidates {
        deliver(&bob, c).await;
    }
    assert_eq!(bob.coordinator.pending_candidate_count().await, 2);
    assert_eq!(bob.coordinator.phase().await, HandshakePhase::Idle);

    deliver(&bob, &offer).await;
    assert_eq!(bob.coordinator.pending_candidate_count().await, 0);
    let probe = net.endpoints_of("bob").pop().unwrap();
    assert_eq!(probe.remote_candidates().len(), 2);
}

#[tokio::test]
async fn test_reset_discards_peer_and_buffer() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let alice = side(&hub, &net, "alice", T).await;
    let mut bob = side(&hub, &net, "bob", T).await;
    let mut carol = side(&hub, &net, "carol", T).await;

    let abandoned = spawn_handshake(&alice, &bob.peer);
    recv(&mut bob.inbox).await;
    let early = SignalingEnvelope::candidate(REMOTE_CANDIDATE).to_json().unwrap();
    alice.coordinator.apply_signal(&bob.peer, &early).await.unwrap();
    assert_eq!(alice.coordinator.pending_candidate_count().await, 1);

    let before = alice.coordinator.session_id().await;
    alice.coordinator.reset().await.unwrap();
    assert!(alice.coordinator.session_id().await > before);
    assert_eq!(alice.coordinator.pending_candidate_count().await, 0);
    assert!(alice.coordinator.peer().await.is_none());
    assert_eq!(alice.coordinator.phase().await, HandshakePhase::Idle);
    assert!(matches!(
        abandoned.await.unwrap(),
        Err(HandshakeError::Superseded)
    ));
    assert!(net.endpoints_of("alice")[1].is_closed());

    let _next = spawn_handshake(&alice, &carol.peer);
    let offer = recv(&mut carol.inbox).await;
    assert_eq!(offer.from.name, "alice");
    assert_eq!(alice.coordinator.peer().await.unwrap().name, "carol");
    assert_eq!(alice.coordinator.pending_candidate_count().await, 0);
    assert!(net.endpoints_of("alice").pop().unwrap().remote_candidates().is_empty());
    assert_eq!(count(&hub, "alice", "offer"), 2);
}

#[tokio::test]
async fn test_duplicate_offer_answered_once() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let alice = side(&hub, &net, "alice", T).await;
    let mut bob = side(&hub, &net, "bob", T).await;

    let _pending = spawn_handshake(&alice, &bob.peer);
    let offer = recv(&mut bob.inbox).await;
    deliver(&bob, &offer).await;
    deliver(&bob, &offer).await;

    assert_eq!(count(&hub, "bob", "answer"), 1);
    assert_eq!(net.endpoints_of("bob").len(), 1);
}

#[tokio::test]
async fn test_duplicate_and_stray_answers_ignored() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let mut alice = side(&hub, &net, "alice", T).await;
    let mut bob = side(&hub, &net, "bob", T).await;

    let pending = spawn_handshake(&alice, &bob.peer);
    let offer = recv(&mut bob.inbox).await;

    // Answer from someone we never offered to
    let stray = SignalingEnvelope::answer("sim-answer:999").to_json().unwrap();
    alice
        .coordinator
        .apply_signal(&Peer::new("mallory"), &stray)
        .await
        .unwrap();
    let stray_candidate = SignalingEnvelope::candidate(REMOTE_CANDIDATE).to_json().unwrap();
    alice
        .coordinator
        .apply_signal(&Peer::new("mallory"), &stray_candidate)
        .await
        .unwrap();
    assert_eq!(alice.coordinator.pending_candidate_count().await, 0);

    deliver(&bob, &offer).await;
    let (answer, _) = recv_kind(&mut alice.inbox, "answer").await;
    deliver(&alice, &answer).await;
    deliver(&alice, &answer).await;

    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_offer_fails_session() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let mut bob = side(&hub, &net, "bob", T).await;
    let alice = Peer::new("alice");

    let bad = SignalingEnvelope::offer("v=0 not an offer").to_json().unwrap();
    assert!(matches!(
        bob.coordinator.apply_signal(&alice, &bad).await,
        Err(HandshakeError::Apply {
            step: "remote offer",
            ..
        })
    ));

    bob.coordinator.on_signal(alice.clone(), bad).await;
    assert_eq!(bob.coordinator.phase().await, HandshakePhase::Failed);
    match bob.events.recv().await {
        Some(SessionEvent::Failed { peer, .. }) => assert_eq!(peer.unwrap().name, "alice"),
        other => panic!("unexpected {:?}", other),
    }

    assert!(matches!(
        bob.coordinator.apply_signal(&alice, "{\"type\":\"bogus\"}").await,
        Err(HandshakeError::Envelope(_))
    ));
    assert_eq!(count(&hub, "bob", "answer"), 0);
}

#[tokio::test]
async fn test_offer_mid_handshake_keeps_offerer_candidates() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let alice = Peer::new("alice");
    let bob = side(&hub, &net, "bob", T).await;

    // Bob is already offering to alice when her own offer arrives
    let superseded = spawn_handshake(&bob, &alice);
    while hub.sent_envelopes().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        bob.coordinator.phase().await,
        HandshakePhase::AwaitingRemoteDescription
    );

    let candidate = SignalingEnvelope::candidate(REMOTE_CANDIDATE).to_json().unwrap();
    bob.coordinator.apply_signal(&alice, &candidate).await.unwrap();
    assert_eq!(bob.coordinator.pending_candidate_count().await, 1);

    let (alice_pc, _alice_events) = net.connector("alice").connect().await.unwrap();
    alice_pc.create_data_channel(DATA_CHANNEL_LABEL).await.unwrap();
    let sdp = alice_pc.create_offer().await.unwrap();
    alice_pc.set_local_description(SdpKind::Offer, &sdp).await.unwrap();

    let offer = SignalingEnvelope::offer(sdp).to_json().unwrap();
    bob.coordinator.apply_signal(&alice, &offer).await.unwrap();

    assert!(matches!(
        superseded.await.unwrap(),
        Err(HandshakeError::Superseded)
    ));
    assert_eq!(bob.coordinator.phase().await, HandshakePhase::LocalAnswerSent);
    assert_eq!(bob.coordinator.pending_candidate_count().await, 0);
    let probe = net.endpoints_of("bob").pop().unwrap();
    assert_eq!(probe.remote_candidates(), vec![REMOTE_CANDIDATE.to_string()]);
}

#[tokio::test]
async fn test_handshake_times_out_without_answer() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let alice = side(&hub, &net, "alice", Duration::from_millis(50)).await;

    let result = alice.coordinator.handshake(&Peer::new("bob")).await;
    assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    assert_eq!(alice.coordinator.phase().await, HandshakePhase::Failed);
}

#[tokio::test]
async fn test_refused_channel_fails_handshake() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    net.refuse_channels(true);
    let mut alice = side(&hub, &net, "alice", T).await;
    let mut bob = side(&hub, &net, "bob", T).await;

    let pending = spawn_handshake(&alice, &bob.peer);
    let offer = recv(&mut bob.inbox).await;
    deliver(&bob, &offer).await;
    let (answer, _) = recv_kind(&mut alice.inbox, "answer").await;
    deliver(&alice, &answer).await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(HandshakeError::ChannelOpen(_))
    ));
    assert_eq!(alice.coordinator.phase().await, HandshakePhase::Failed);
}

#[tokio::test]
async fn test_pool_routes_signals_per_peer() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();

    let transport = |name: &str| {
        Arc::new(SignalingTransport::new(
            Peer::new(name),
            Arc::new(hub.signaling_client()),
        ))
    };
    let (alice_sig, bob_sig, carol_sig) = (transport("alice"), transport("bob"), transport("carol"));

    let (alice_tx, _alice_events) = mpsc::unbounded_channel();
    let alice_pool = Arc::new(CoordinatorPool::new(
        alice_sig.clone(),
        Arc::new(net.connector("alice")),
        alice_tx,
        T,
    ));
    alice_sig.set_handler(alice_pool.clone()).await;
    alice_sig.connect().await.unwrap();

    let mut receivers = Vec::new();
    for (sig, name) in [(&bob_sig, "bob"), (&carol_sig, "carol")] {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(CoordinatorPool::new(
            sig.clone(),
            Arc::new(net.connector(name)),
            tx,
            T,
        ));
        sig.set_handler(pool).await;
        sig.connect().await.unwrap();
        receivers.push(rx);
    }

    let (to_bob, to_carol) = tokio::join!(
        alice_pool.handshake(bob_sig.local()),
        alice_pool.handshake(carol_sig.local())
    );
    let to_bob = to_bob.unwrap();
    let to_carol = to_carol.unwrap();
    assert_eq!(alice_pool.len().await, 2);

    to_bob.send(Bytes::from_static(b"for bob")).await.unwrap();
    to_carol.send(Bytes::from_static(b"for carol")).await.unwrap();

    for (rx, expected) in receivers.iter_mut().zip([&b"for bob"[..], &b"for carol"[..]]) {
        match tokio::time::timeout(T, rx.recv()).await.unwrap() {
            Some(SessionEvent::Message { from, data }) => {
                assert_eq!(from.unwrap().name, "alice");
                assert_eq!(&data[..], expected);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    alice_pool.close_all().await;
    assert!(alice_pool.is_empty().await);
    alice_sig.clear_handler().await;
    alice_sig.disconnect().await;
}

fn pool_for(hub: &MemoryHub, net: &SimNetwork, name: &str) -> (
    Arc<CoordinatorPool>,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    let signaling = Arc::new(SignalingTransport::new(
        Peer::new(name),
        Arc::new(hub.signaling_client()),
    ));
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = Arc::new(CoordinatorPool::new(
        signaling,
        Arc::new(net.connector(name)),
        tx,
        T,
    ));
    (pool, rx)
}

#[tokio::test]
async fn test_pool_ignores_candidates_without_offer() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let (pool, _events) = pool_for(&hub, &net, "bob");

    let candidate = SignalingEnvelope::candidate(REMOTE_CANDIDATE).to_json().unwrap();
    for i in 0..50 {
        pool.on_signal(Peer::new(format!("ghost-{}", i)), candidate.clone())
            .await;
    }
    let answer = SignalingEnvelope::answer("v=0 stray").to_json().unwrap();
    pool.on_signal(Peer::new("ghost-0"), answer).await;
    pool.on_signal(Peer::new("ghost-1"), "not json".to_string()).await;

    assert_eq!(pool.len().await, 0);
    assert!(net.endpoints_of("bob").is_empty());
    assert_eq!(pool.early_candidate_count().await, 50);

    // The hold buffer is bounded
    for i in 50..200 {
        pool.on_signal(Peer::new(format!("ghost-{}", i)), candidate.clone())
            .await;
    }
    assert_eq!(pool.early_candidate_count().await, super::handshake::MAX_EARLY_CANDIDATES);
    assert_eq!(pool.len().await, 0);

    pool.remove("ghost-199").await;
    assert_eq!(pool.early_candidate_count().await, super::handshake::MAX_EARLY_CANDIDATES - 1);
}

#[tokio::test]
async fn test_pool_replays_candidates_sent_before_offer() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let (pool, _events) = pool_for(&hub, &net, "bob");
    let alice = Peer::new("alice");

    let candidate = SignalingEnvelope::candidate(REMOTE_CANDIDATE).to_json().unwrap();
    pool.on_signal(alice.clone(), candidate).await;
    assert_eq!(pool.len().await, 0);

    let (alice_pc, _alice_events) = net.connector("alice").connect().await.unwrap();
    alice_pc.create_data_channel(DATA_CHANNEL_LABEL).await.unwrap();
    let sdp = alice_pc.create_offer().await.unwrap();
    alice_pc.set_local_description(SdpKind::Offer, &sdp).await.unwrap();
    pool.on_signal(alice.clone(), SignalingEnvelope::offer(sdp).to_json().unwrap())
        .await;

    assert_eq!(pool.len().await, 1);
    assert_eq!(pool.early_candidate_count().await, 0);
    let coordinator = pool.coordinator_for("alice").await.unwrap();
    assert_eq!(coordinator.phase().await, HandshakePhase::LocalAnswerSent);
    let endpoint = net.endpoints_of("bob").pop().unwrap();
    assert_eq!(endpoint.remote_candidates(), vec![REMOTE_CANDIDATE.to_string()]);
}

#[tokio::test]
async fn test_pool_releases_coordinator_after_remote_close() {
    let hub = MemoryHub::new();
    let net = SimNetwork::new();
    let (alice_pool, _alice_events) = pool_for(&hub, &net, "alice");
    let (bob_pool, mut bob_events) = pool_for(&hub, &net, "bob");

    let mut alice_inbox = hub
        .signaling_client()
        .subscribe(&Peer::new("alice"))
        .await
        .unwrap();
    let mut bob_inbox = hub
        .signaling_client()
        .subscribe(&Peer::new("bob"))
        .await
        .unwrap();

    let pending = {
        let pool = alice_pool.clone();
        tokio::spawn(async move { pool.handshake(&Peer::new("bob")).await })
    };
    let offer = recv(&mut bob_inbox).await;
    bob_pool.on_signal(offer.from, offer.message).await;
    let (answer, _) = recv_kind(&mut alice_inbox, "answer").await;
    alice_pool.on_signal(answer.from, answer.message).await;
    let channel = pending.await.unwrap().unwrap();
    assert_eq!(bob_pool.len().await, 1);

    let bob_session = bob_pool.coordinator_for("alice").await.unwrap().session_id().await;
    // A stale session id leaves the coordinator alone
    bob_pool.release("alice", bob_session + 1_000_000).await;
    assert_eq!(bob_pool.len().await, 1);

    channel.close().await;
    let (peer, session) = loop {
        match tokio::time::timeout(T, bob_events.recv()).await.unwrap() {
            Some(SessionEvent::Closed { peer, session }) => break (peer, session),
            Some(_) => continue,
            None => panic!("session events closed"),
        }
    };
    assert_eq!(peer.unwrap().name, "alice");
    assert_eq!(session, bob_session);

    bob_pool.release("alice", session).await;
    assert!(bob_pool.is_empty().await);
    assert!(net.endpoints_of("bob").iter().all(|e| e.is_closed()));
}

/// Channel whose buffer shrinks by `step` bytes each time it is queried
struct SlowChannel {
    buffered: std::sync::atomic::AtomicUsize,
    step: usize,
}

#[async_trait::async_trait]
impl DataChannel for SlowChannel {
    fn label(&self) -> &str {
        DATA_CHANNEL_LABEL
    }

    async fn send(&self, _data: Bytes) -> Result<(), crate::error::ConnectionError> {
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        use std::sync::atomic::Ordering;
        let now = self.buffered.load(Ordering::SeqCst);
        self.buffered
            .store(now.saturating_sub(self.step), Ordering::SeqCst);
        now
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn test_drained_waits_for_buffer_to_empty() {
    let slow = Arc::new(SlowChannel {
        buffered: std::sync::atomic::AtomicUsize::new(3000),
        step: 1000,
    });
    let channel = ReliableChannel::new(Peer::new("bob"), slow.clone());
    assert!(channel.drained(Duration::from_secs(2)).await);
    assert_eq!(slow.buffered.load(std::sync::atomic::Ordering::SeqCst), 0);

    let stuck = ReliableChannel::new(
        Peer::new("bob"),
        Arc::new(SlowChannel {
            buffered: std::sync::atomic::AtomicUsize::new(10),
            step: 0,
        }),
    );
    assert!(!stuck.drained(Duration::from_millis(100)).await);
}
