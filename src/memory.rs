//! In-process backends
//!
//! [`MemoryHub`] provides the presence and signaling channels for peers living
//! in the same process. [`SimNetwork`] stands in for the NAT-traversal engine:
//! it produces offers and answers, trickles candidates after every local
//! description, rejects candidates before a remote description and links data
//! channels once the offerer applies the answer.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{ConnectionError, PresenceError, SignalingError};
use crate::presence::{PresenceChannel, PresenceEvent};
use crate::webrtc::{
    ChannelEvent, ChannelHandle, ConnectionEvent, Connector, DataChannel, Peer, PeerConnection,
    SdpKind, SignalMessage, SignalingChannel, SignalingEnvelope,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Scope {
    members: HashMap<String, Peer>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<PresenceEvent>>,
}

impl Scope {
    fn snapshot(&self) -> HashMap<String, Vec<Peer>> {
        self.members
            .iter()
            .map(|(key, peer)| (key.clone(), vec![peer.clone()]))
            .collect()
    }

    fn broadcast(&mut self, event: PresenceEvent) {
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
struct HubState {
    scopes: HashMap<String, Scope>,
    inboxes: HashMap<String, mpsc::UnboundedSender<SignalMessage>>,
    sent: Vec<(String, SignalMessage)>,
    failing_subscriptions: u32,
    next_client: u64,
}

impl HubState {
    fn take_failure(&mut self) -> bool {
        if self.failing_subscriptions > 0 {
            self.failing_subscriptions -= 1;
            true
        } else {
            false
        }
    }
}

/// Shared presence and signaling hub
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A presence client with its own session key
    pub fn presence_client(&self) -> MemoryPresence {
        let client = {
            let mut state = lock(&self.inner);
            state.next_client += 1;
            state.next_client
        };
        MemoryPresence {
            hub: self.clone(),
            key: format!("client-{}", client),
            client,
            scope: Mutex::new(None),
        }
    }

    pub fn signaling_client(&self) -> MemorySignaling {
        MemorySignaling { hub: self.clone() }
    }

    /// Make the next `n` subscriptions, presence or signaling, fail
    pub fn fail_next_subscriptions(&self, n: u32) {
        lock(&self.inner).failing_subscriptions = n;
    }

    pub fn members(&self, scope: &str) -> Vec<Peer> {
        lock(&self.inner)
            .scopes
            .get(scope)
            .map(|s| s.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_inbox(&self, name: &str) -> bool {
        lock(&self.inner).inboxes.contains_key(name)
    }

    /// Every signaling message sent so far, with its target
    pub fn sent(&self) -> Vec<(String, SignalMessage)> {
        lock(&self.inner).sent.clone()
    }

    /// Sent handshake envelopes as (from, to, envelope); undecodable payloads are skipped
    pub fn sent_envelopes(&self) -> Vec<(String, String, SignalingEnvelope)> {
        self.sent()
            .into_iter()
            .filter_map(|(to, m)| {
                SignalingEnvelope::from_json(&m.message)
                    .ok()
                    .map(|e| (m.from.name, to, e))
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        lock(&self.inner)
    }
}

/// Presence client of a [`MemoryHub`]
pub struct MemoryPresence {
    hub: MemoryHub,
    client: u64,
    key: String,
    scope: Mutex<Option<String>>,
}

impl MemoryPresence {
    fn current_scope(&self) -> Option<String> {
        lock(&self.scope).clone()
    }
}

#[async_trait]
impl PresenceChannel for MemoryPresence {
    async fn subscribe(
        &self,
        scope: &str,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, PresenceError> {
        let mut hub = self.hub.lock();
        if hub.take_failure() {
            return Err(PresenceError::Transport(
                "injected subscription failure".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let entry = hub.scopes.entry(scope.to_string()).or_default();
        let _ = tx.send(PresenceEvent::Sync(entry.snapshot()));
        entry.subscribers.insert(self.client, tx);
        drop(hub);

        *lock(&self.scope) = Some(scope.to_string());
        debug!("{} subscribed to presence scope {}", self.key, scope);
        Ok(rx)
    }

    async fn track(&self, peer: &Peer) -> Result<(), PresenceError> {
        let scope = self
            .current_scope()
            .ok_or_else(|| PresenceError::NotReady("not subscribed".to_string()))?;

        let mut hub = self.hub.lock();
        let entry = hub.scopes.entry(scope).or_default();
        entry.members.insert(self.key.clone(), peer.clone());
        entry.broadcast(PresenceEvent::Join {
            key: self.key.clone(),
            peers: vec![peer.clone()],
        });
        let snapshot = entry.snapshot();
        entry.broadcast(PresenceEvent::Sync(snapshot));
        Ok(())
    }

    async fn untrack(&self) -> Result<(), PresenceError> {
        let Some(scope) = self.current_scope() else {
            return Ok(());
        };

        let mut hub = self.hub.lock();
        let Some(entry) = hub.scopes.get_mut(&scope) else {
            return Ok(());
        };
        if let Some(peer) = entry.members.remove(&self.key) {
            entry.broadcast(PresenceEvent::Leave {
                key: self.key.clone(),
                peers: vec![peer],
            });
            let snapshot = entry.snapshot();
            entry.broadcast(PresenceEvent::Sync(snapshot));
        }
        Ok(())
    }

    async fn unsubscribe(&self) {
        let _ = self.untrack().await;
        let Some(scope) = lock(&self.scope).take() else {
            return;
        };
        if let Some(entry) = self.hub.lock().scopes.get_mut(&scope) {
            entry.subscribers.remove(&self.client);
        }
        debug!("{} unsubscribed from presence scope {}", self.key, scope);
    }
}

/// Signaling client of a [`MemoryHub`]
#[derive(Clone)]
pub struct MemorySignaling {
    hub: MemoryHub,
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn subscribe(
        &self,
        identity: &Peer,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        let mut hub = self.hub.lock();
        if hub.take_failure() {
            return Err(SignalingError::Subscription(
                "injected subscription failure".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        hub.inboxes.insert(identity.name.clone(), tx);
        Ok(rx)
    }

    async fn send(&self, to: &str, message: SignalMessage) -> Result<(), SignalingError> {
        let mut hub = self.hub.lock();
        hub.sent.push((to.to_string(), message.clone()));
        match hub.inboxes.get(to) {
            Some(inbox) => {
                if inbox.send(message).is_err() {
                    hub.inboxes.remove(to);
                }
            }
            None => debug!("No inbox for {}, dropping signal", to),
        }
        Ok(())
    }

    async fn unsubscribe(&self, identity: &str) {
        self.hub.lock().inboxes.remove(identity);
    }
}

const OFFER_PREFIX: &str = "sim-offer:";
const ANSWER_PREFIX: &str = "sim-answer:";

fn parse_sdp(sdp: &str) -> Option<(SdpKind, u64)> {
    if let Some(id) = sdp.strip_prefix(OFFER_PREFIX) {
        return id.parse().ok().map(|id| (SdpKind::Offer, id));
    }
    sdp.strip_prefix(ANSWER_PREFIX)
        .and_then(|id| id.parse().ok())
        .map(|id| (SdpKind::Answer, id))
}

struct SimState {
    next_id: u64,
    endpoints: HashMap<u64, Arc<SimEndpoint>>,
    refuse_channels: bool,
    candidates_per_description: u32,
}

/// Simulated NAT-traversal engine shared by all connectors of a test
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                next_id: 1,
                endpoints: HashMap::new(),
                refuse_channels: false,
                candidates_per_description: 2,
            })),
        }
    }

    /// Connector whose endpoints are labelled `label` for probing
    pub fn connector(&self, label: impl Into<String>) -> SimConnector {
        SimConnector {
            label: label.into(),
            network: self.clone(),
        }
    }

    /// When set, linking a data channel reports an error instead of opening it
    pub fn refuse_channels(&self, refuse: bool) {
        lock(&self.inner).refuse_channels = refuse;
    }

    pub fn set_candidates_per_description(&self, n: u32) {
        lock(&self.inner).candidates_per_description = n;
    }

    /// Endpoints created by connectors labelled `label`, oldest first
    pub fn endpoints_of(&self, label: &str) -> Vec<SimProbe> {
        let state = lock(&self.inner);
        let mut probes: Vec<SimProbe> = state
            .endpoints
            .values()
            .filter(|e| e.label == label)
            .map(|e| SimProbe {
                endpoint: e.clone(),
            })
            .collect();
        probes.sort_by_key(|p| p.endpoint.id);
        probes
    }

    fn create_endpoint(
        &self,
        label: &str,
    ) -> (Arc<SimEndpoint>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.inner);
        let id = state.next_id;
        state.next_id += 1;
        let endpoint = Arc::new(SimEndpoint {
            id,
            label: label.to_string(),
            events,
            state: Mutex::new(EndpointState::default()),
        });
        state.endpoints.insert(id, endpoint.clone());
        (endpoint, rx)
    }

    fn endpoint(&self, id: u64) -> Option<Arc<SimEndpoint>> {
        lock(&self.inner).endpoints.get(&id).cloned()
    }
}

/// Read-only view of one simulated endpoint
#[derive(Clone)]
pub struct SimProbe {
    endpoint: Arc<SimEndpoint>,
}

impl SimProbe {
    pub fn id(&self) -> u64 {
        self.endpoint.id
    }

    /// Candidates accepted by `add_ice_candidate`, in order
    pub fn remote_candidates(&self) -> Vec<String> {
        lock(&self.endpoint.state).remote_candidates.clone()
    }

    pub fn has_remote_description(&self) -> bool {
        lock(&self.endpoint.state).remote.is_some()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.endpoint.state).closed
    }
}

#[derive(Default)]
struct EndpointState {
    local: Option<(SdpKind, String)>,
    remote: Option<(SdpKind, String)>,
    remote_candidates: Vec<String>,
    unlinked: Vec<Arc<SimChannel>>,
    channels: Vec<Arc<SimChannel>>,
    candidate_seq: u32,
    closed: bool,
}

struct SimEndpoint {
    id: u64,
    label: String,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<EndpointState>,
}

/// [`Connector`] producing simulated peer connections
pub struct SimConnector {
    label: String,
    network: SimNetwork,
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(
        &self,
    ) -> Result<
        (
            Arc<dyn PeerConnection>,
            mpsc::UnboundedReceiver<ConnectionEvent>,
        ),
        ConnectionError,
    > {
        let (endpoint, events) = self.network.create_endpoint(&self.label);
        trace!("Sim endpoint {} created for {}", endpoint.id, self.label);
        let connection: Arc<dyn PeerConnection> = Arc::new(SimPeerConnection {
            endpoint,
            network: self.network.clone(),
        });
        Ok((connection, events))
    }
}

struct SimPeerConnection {
    endpoint: Arc<SimEndpoint>,
    network: SimNetwork,
}

impl SimPeerConnection {
    fn state(&self) -> Result<MutexGuard<'_, EndpointState>, ConnectionError> {
        let state = lock(&self.endpoint.state);
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        Ok(state)
    }

    fn link_channels(&self, remote: &SimEndpoint) -> Result<(), ConnectionError> {
        let refuse = lock(&self.network.inner).refuse_channels;
        let unlinked = std::mem::take(&mut lock(&self.endpoint.state).unlinked);

        for local in unlinked {
            if refuse {
                let _ = local.events.send(ChannelEvent::Error("channel refused".to_string()));
                continue;
            }

            let (counterpart, counterpart_events) = SimChannel::new(&local.label);
            *lock(&local.remote) = Arc::downgrade(&counterpart);
            *lock(&counterpart.remote) = Arc::downgrade(&local);
            {
                let mut remote_state = lock(&remote.state);
                if remote_state.closed {
                    return Err(ConnectionError::Closed);
                }
                remote_state.channels.push(counterpart.clone());
            }
            let _ = remote.events.send(ConnectionEvent::InboundChannel(ChannelHandle {
                channel: counterpart.clone(),
                events: counterpart_events,
            }));
            local.mark_open();
            counterpart.mark_open();
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for SimPeerConnection {
    async fn create_offer(&self) -> Result<String, ConnectionError> {
        let _state = self.state()?;
        Ok(format!("{}{}", OFFER_PREFIX, self.endpoint.id))
    }

    async fn create_answer(&self) -> Result<String, ConnectionError> {
        let state = self.state()?;
        match state.remote {
            Some((SdpKind::Offer, _)) => Ok(format!("{}{}", ANSWER_PREFIX, self.endpoint.id)),
            _ => Err(ConnectionError::Description(
                "no remote offer to answer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), ConnectionError> {
        if parse_sdp(sdp) != Some((kind, self.endpoint.id)) {
            return Err(ConnectionError::Description(format!(
                "not a local {}: {}",
                kind, sdp
            )));
        }

        let (label, first, count) = {
            let mut state = self.state()?;
            state.local = Some((kind, sdp.to_string()));
            let count = lock(&self.network.inner).candidates_per_description;
            let first = state.candidate_seq;
            state.candidate_seq += count;
            (self.endpoint.label.clone(), first, count)
        };

        for seq in first..first + count {
            let candidate = serde_json::json!({
                "candidate": format!("candidate:sim {} {} {} udp", label, self.endpoint.id, seq),
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            });
            let _ = self
                .endpoint
                .events
                .send(ConnectionEvent::LocalCandidate(candidate.to_string()));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), ConnectionError> {
        let remote_id = match parse_sdp(sdp) {
            Some((k, id)) if k == kind && id != self.endpoint.id => id,
            _ => {
                return Err(ConnectionError::Description(format!(
                    "malformed remote {}: {}",
                    kind, sdp
                )))
            }
        };
        let remote = self
            .network
            .endpoint(remote_id)
            .ok_or_else(|| ConnectionError::Description(format!("unknown endpoint {}", remote_id)))?;

        self.state()?.remote = Some((kind, sdp.to_string()));

        if kind == SdpKind::Answer {
            self.link_channels(&remote)?;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), ConnectionError> {
        let mut state = self.state()?;
        if state.remote.is_none() {
            return Err(ConnectionError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        let parsed: serde_json::Value = serde_json::from_str(candidate)
            .map_err(|e| ConnectionError::Candidate(e.to_string()))?;
        if !parsed.get("candidate").is_some_and(|c| c.is_string()) {
            return Err(ConnectionError::Candidate(format!(
                "missing candidate field: {}",
                candidate
            )));
        }
        state.remote_candidates.push(candidate.to_string());
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, ConnectionError> {
        let mut state = self.state()?;
        let (channel, events) = SimChannel::new(label);
        state.unlinked.push(channel.clone());
        state.channels.push(channel.clone());
        Ok(ChannelHandle { channel, events })
    }

    async fn close(&self) {
        let channels = {
            let mut state = lock(&self.endpoint.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.unlinked.clear();
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.close_pair();
        }
        trace!("Sim endpoint {} closed", self.endpoint.id);
    }
}

struct SimChannel {
    label: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    remote: Mutex<Weak<SimChannel>>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl SimChannel {
    fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.to_string(),
            events,
            remote: Mutex::new(Weak::new()),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (channel, rx)
    }

    fn mark_open(&self) {
        if !self.closed.load(Ordering::SeqCst) && !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Open);
        }
    }

    fn shut(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.store(false, Ordering::SeqCst);
            let _ = self.events.send(ChannelEvent::Close);
        }
    }

    fn close_pair(&self) {
        self.shut();
        let remote = lock(&self.remote).upgrade();
        if let Some(remote) = remote {
            remote.shut();
        }
    }
}

#[async_trait]
impl DataChannel for SimChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<(), ConnectionError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectionError::Channel("channel not open".to_string()));
        }
        let remote = lock(&self.remote)
            .upgrade()
            .ok_or(ConnectionError::Closed)?;
        if remote.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        remote
            .events
            .send(ChannelEvent::Message(data))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Delivery is immediate, nothing is ever queued
    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn close(&self) {
        self.close_pair();
    }
}
