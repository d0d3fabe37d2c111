//! Offer/answer handshake state machine
//!
//! A [`HandshakeCoordinator`] owns exactly one [`HandshakeSession`] at a time.
//! Starting a handshake, or accepting an offer on a session that is already in
//! use, replaces the session wholesale and tears down the previous connection.
//!
//! ICE candidates received before a remote description is applied are buffered
//! and replayed exactly once after it is applied; the connection primitive
//! rejects them otherwise.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::connection::{
    ChannelEvent, ChannelHandle, ConnectionEvent, Connector, DataChannel, PeerConnection,
};
use super::signaling::{SignalHandler, SignalingTransport};
use super::types::{HandshakePhase, Peer, SdpKind, SignalingEnvelope, DATA_CHANNEL_LABEL};
use crate::error::{ConnectionError, HandshakeError};

/// Default wait for the outbound data channel to open
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Candidates held for senders that have no session yet
pub(super) const MAX_EARLY_CANDIDATES: usize = 64;

/// Session ids are unique across all coordinators of the process
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION.fetch_add(1, Ordering::SeqCst)
}

/// Events surfaced by coordinators to their owner
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A message arrived on a data channel of the session
    Message { from: Option<Peer>, data: Bytes },
    /// The session hit a fatal signaling or connection error. `session` is 0
    /// when no session was ever created.
    Failed {
        peer: Option<Peer>,
        session: u64,
        error: String,
    },
    /// The remote end closed a data channel of the session
    Closed { peer: Option<Peer>, session: u64 },
}

#[derive(Debug, Clone)]
struct PendingCandidate {
    from: String,
    candidate: String,
}

struct HandshakeSession {
    id: u64,
    connection: Arc<dyn PeerConnection>,
    peer: Option<Peer>,
    pending_candidates: Vec<PendingCandidate>,
    remote_description_applied: bool,
    remote_offer: Option<String>,
    phase: HandshakePhase,
    tasks: Vec<JoinHandle<()>>,
}

impl HandshakeSession {
    fn new(id: u64, connection: Arc<dyn PeerConnection>, pending: Vec<PendingCandidate>) -> Self {
        Self {
            id,
            connection,
            peer: None,
            pending_candidates: pending,
            remote_description_applied: false,
            remote_offer: None,
            phase: HandshakePhase::Idle,
            tasks: Vec::new(),
        }
    }

    fn is_correspondent(&self, name: &str) -> bool {
        self.peer.as_ref().is_some_and(|p| p.name == name)
    }

    fn set_phase(&mut self, phase: HandshakePhase) {
        if self.phase != phase {
            debug!("Session {} {} -> {}", self.id, self.phase, phase);
            self.phase = phase;
        }
    }

    /// Stop the session but keep it as the current one
    async fn shut_down(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.connection.close().await;
        self.pending_candidates.clear();
        self.peer = None;
        self.set_phase(HandshakePhase::Idle);
    }

    async fn teardown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.connection.close().await;
        debug!("Session {} torn down", self.id);
    }
}

/// Outbound leg of an established session
#[derive(Clone)]
pub struct ReliableChannel {
    peer: Peer,
    channel: Arc<dyn DataChannel>,
}

impl ReliableChannel {
    pub(crate) fn new(peer: Peer, channel: Arc<dyn DataChannel>) -> Self {
        Self { peer, channel }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub async fn send(&self, data: Bytes) -> Result<(), ConnectionError> {
        self.channel.send(data).await
    }

    /// Wait until everything sent has left the local buffer. Returns false if
    /// data is still queued after `timeout`.
    pub async fn drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let buffered = self.channel.buffered_amount().await;
                if buffered == 0 {
                    return;
                }
                trace!("{} bytes still buffered for {}", buffered, self.peer.name);
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

impl std::fmt::Debug for ReliableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableChannel")
            .field("peer", &self.peer.name)
            .field("label", &self.channel.label())
            .finish()
    }
}

pub struct HandshakeCoordinator {
    signaling: Arc<SignalingTransport>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<SessionEvent>,
    open_timeout: Duration,
    session: Arc<Mutex<HandshakeSession>>,
}

impl HandshakeCoordinator {
    /// Create a coordinator with a fresh idle session. Inbound channel messages
    /// and session failures are reported on `events`.
    pub async fn new(
        signaling: Arc<SignalingTransport>,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<SessionEvent>,
        open_timeout: Duration,
    ) -> Result<Self, HandshakeError> {
        let (connection, connection_events) = connector.connect().await?;
        let id = next_session_id();
        let coordinator = Self {
            signaling,
            connector,
            events,
            open_timeout,
            session: Arc::new(Mutex::new(HandshakeSession::new(id, connection, Vec::new()))),
        };
        let pump = coordinator.spawn_pump(id, connection_events);
        coordinator.session.lock().await.tasks.push(pump);
        Ok(coordinator)
    }

    pub async fn phase(&self) -> HandshakePhase {
        self.session.lock().await.phase
    }

    /// Correspondent of the current session
    pub async fn peer(&self) -> Option<Peer> {
        self.session.lock().await.peer.clone()
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.session.lock().await.pending_candidates.len()
    }

    pub async fn session_id(&self) -> u64 {
        self.session.lock().await.id
    }

    /// Discard the current session and start a fresh one
    pub async fn reset(&self) -> Result<(), HandshakeError> {
        let mut session = self.session.lock().await;
        self.reset_locked(&mut session, None).await
    }

    /// Replace the session in place. Candidates buffered from `keep_from` are
    /// carried over; everything else is dropped.
    async fn reset_locked(
        &self,
        session: &mut HandshakeSession,
        keep_from: Option<&str>,
    ) -> Result<(), HandshakeError> {
        let (connection, connection_events) = self.connector.connect().await?;
        let id = next_session_id();

        let carried: Vec<PendingCandidate> = match keep_from {
            Some(name) => session
                .pending_candidates
                .drain(..)
                .filter(|c| c.from == name)
                .collect(),
            None => Vec::new(),
        };
        if !carried.is_empty() {
            debug!("Carrying {} buffered candidate(s) into session {}", carried.len(), id);
        }

        let previous = std::mem::replace(session, HandshakeSession::new(id, connection, carried));
        debug!("Reset session {} -> {}", previous.id, id);
        previous.teardown().await;

        session.tasks.push(self.spawn_pump(id, connection_events));
        Ok(())
    }

    /// Initiate a handshake with `peer` and wait for the outbound channel to open
    pub async fn handshake(&self, peer: &Peer) -> Result<ReliableChannel, HandshakeError> {
        let (id, mut handle) = {
            let mut session = self.session.lock().await;
            self.reset_locked(&mut session, None).await?;
            // Tag before the local description so trickled candidates have an address
            session.peer = Some(peer.clone());
            match self.send_offer(&mut session, peer).await {
                Ok(handle) => (session.id, handle),
                Err(e) => {
                    session.set_phase(HandshakePhase::Failed);
                    return Err(e);
                }
            }
        };

        let outcome = tokio::time::timeout(self.open_timeout, wait_open(&mut handle.events)).await;

        let mut session = self.session.lock().await;
        if session.id != id {
            debug!("Handshake with {} superseded by session {}", peer.name, session.id);
            return Err(HandshakeError::Superseded);
        }

        match outcome {
            Ok(Ok(())) => {
                session.set_phase(HandshakePhase::Connected);
                info!("Data channel to {} open", peer.name);
                let forwarder = spawn_reader(
                    self.session.clone(),
                    id,
                    Some(peer.clone()),
                    handle.events,
                    None,
                    self.events.clone(),
                );
                session.tasks.push(forwarder);
                Ok(ReliableChannel::new(peer.clone(), handle.channel))
            }
            Ok(Err(e)) => {
                warn!("Handshake with {} failed: {}", peer.name, e);
                session.set_phase(HandshakePhase::Failed);
                Err(e)
            }
            Err(_) => {
                warn!("Handshake with {} timed out", peer.name);
                session.set_phase(HandshakePhase::Failed);
                Err(HandshakeError::Timeout(self.open_timeout))
            }
        }
    }

    async fn send_offer(
        &self,
        session: &mut HandshakeSession,
        peer: &Peer,
    ) -> Result<ChannelHandle, HandshakeError> {
        let handle = session
            .connection
            .create_data_channel(DATA_CHANNEL_LABEL)
            .await?;

        let sdp = session
            .connection
            .create_offer()
            .await
            .map_err(|source| HandshakeError::Apply {
                step: "create offer",
                source,
            })?;
        session
            .connection
            .set_local_description(SdpKind::Offer, &sdp)
            .await
            .map_err(|source| HandshakeError::Apply {
                step: "local offer",
                source,
            })?;
        session.set_phase(HandshakePhase::LocalOfferSent);

        let payload = SignalingEnvelope::offer(sdp).to_json()?;
        self.signaling.send_message(peer, &payload).await?;
        session.set_phase(HandshakePhase::AwaitingRemoteDescription);
        info!("Sent offer to {}", peer.name);

        Ok(handle)
    }

    /// Apply one inbound signal. Errors are fatal to the current session only.
    pub async fn apply_signal(&self, from: &Peer, message: &str) -> Result<(), HandshakeError> {
        match SignalingEnvelope::from_json(message)? {
            SignalingEnvelope::Offer { sdp } => self.on_offer(from, sdp).await,
            SignalingEnvelope::Answer { sdp } => self.on_answer(from, &sdp).await,
            SignalingEnvelope::Candidate { candidate } => self.on_candidate(from, candidate).await,
        }
    }

    async fn on_offer(&self, from: &Peer, sdp: String) -> Result<(), HandshakeError> {
        let mut session = self.session.lock().await;

        if session.is_correspondent(&from.name) && session.remote_offer.as_deref() == Some(sdp.as_str()) {
            debug!("Ignoring duplicate offer from {}", from.name);
            return Ok(());
        }
        info!("Received offer from {}", from.name);

        if session.phase != HandshakePhase::Idle {
            self.reset_locked(&mut session, Some(&from.name)).await?;
        }
        session.peer = Some(from.clone());
        session.set_phase(HandshakePhase::RemoteOfferReceived);

        session
            .connection
            .set_remote_description(SdpKind::Offer, &sdp)
            .await
            .map_err(|source| HandshakeError::Apply {
                step: "remote offer",
                source,
            })?;
        session.remote_description_applied = true;
        session.remote_offer = Some(sdp);

        let answer = session
            .connection
            .create_answer()
            .await
            .map_err(|source| HandshakeError::Apply {
                step: "create answer",
                source,
            })?;
        session
            .connection
            .set_local_description(SdpKind::Answer, &answer)
            .await
            .map_err(|source| HandshakeError::Apply {
                step: "local answer",
                source,
            })?;

        let payload = SignalingEnvelope::answer(answer).to_json()?;
        self.signaling.send_message(from, &payload).await?;
        session.set_phase(HandshakePhase::LocalAnswerSent);
        info!("Sent answer to {}", from.name);

        replay_candidates(&mut session).await;
        Ok(())
    }

    async fn on_answer(&self, from: &Peer, sdp: &str) -> Result<(), HandshakeError> {
        let mut session = self.session.lock().await;

        if !session.is_correspondent(&from.name) {
            debug!("Ignoring answer from {}, not our correspondent", from.name);
            return Ok(());
        }
        if session.remote_description_applied {
            debug!("Ignoring duplicate answer from {}", from.name);
            return Ok(());
        }
        if session.phase != HandshakePhase::AwaitingRemoteDescription {
            return Err(HandshakeError::UnexpectedSignal {
                kind: "answer",
                from: from.name.clone(),
                phase: session.phase.to_string(),
            });
        }

        session
            .connection
            .set_remote_description(SdpKind::Answer, sdp)
            .await
            .map_err(|source| HandshakeError::Apply {
                step: "remote answer",
                source,
            })?;
        session.remote_description_applied = true;
        info!("Applied answer from {}", from.name);

        replay_candidates(&mut session).await;
        Ok(())
    }

    async fn on_candidate(&self, from: &Peer, candidate: String) -> Result<(), HandshakeError> {
        let mut session = self.session.lock().await;

        if session.peer.is_some() && !session.is_correspondent(&from.name) {
            debug!("Ignoring candidate from {}, not our correspondent", from.name);
            return Ok(());
        }

        if session.remote_description_applied {
            trace!("Adding candidate from {}", from.name);
            session
                .connection
                .add_ice_candidate(&candidate)
                .await
                .map_err(|source| HandshakeError::Apply {
                    step: "ice candidate",
                    source,
                })?;
        } else {
            session.pending_candidates.push(PendingCandidate {
                from: from.name.clone(),
                candidate,
            });
            debug!(
                "Buffered candidate from {} ({} pending)",
                from.name,
                session.pending_candidates.len()
            );
        }
        Ok(())
    }

    /// Tear down the current session without starting a new one
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        session.shut_down().await;
    }

    /// Close the coordinator only while `id` is its current session
    pub async fn close_session(&self, id: u64) -> bool {
        let mut session = self.session.lock().await;
        if session.id != id {
            return false;
        }
        session.shut_down().await;
        true
    }

    fn spawn_pump(
        &self,
        id: u64,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let session = self.session.clone();
        let signaling = self.signaling.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            while let Some(event) = connection_events.recv().await {
                match event {
                    ConnectionEvent::LocalCandidate(candidate) => {
                        let peer = {
                            let s = session.lock().await;
                            if s.id != id {
                                break;
                            }
                            s.peer.clone()
                        };
                        let Some(peer) = peer else {
                            debug!("Dropping local candidate, session {} has no peer", id);
                            continue;
                        };
                        let payload = match SignalingEnvelope::candidate(candidate).to_json() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!("Failed to encode candidate: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = signaling.send_message(&peer, &payload).await {
                            warn!("Failed to send candidate to {}: {}", peer.name, e);
                        } else {
                            trace!("Sent candidate to {}", peer.name);
                        }
                    }
                    ConnectionEvent::InboundChannel(handle) => {
                        let mut s = session.lock().await;
                        if s.id != id {
                            break;
                        }
                        info!(
                            "Inbound data channel '{}' from {}",
                            handle.channel.label(),
                            s.peer.as_ref().map(|p| p.name.as_str()).unwrap_or("unknown")
                        );
                        let reader = spawn_reader(
                            session.clone(),
                            id,
                            s.peer.clone(),
                            handle.events,
                            Some(handle.channel),
                            events.clone(),
                        );
                        s.tasks.push(reader);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SignalHandler for HandshakeCoordinator {
    async fn on_signal(&self, from: Peer, message: String) {
        let Err(e) = self.apply_signal(&from, &message).await else {
            return;
        };
        warn!("Signal from {} failed: {}", from.name, e);

        let mut session = self.session.lock().await;
        if session.peer.is_none() || session.is_correspondent(&from.name) {
            session.set_phase(HandshakePhase::Failed);
            let _ = self.events.send(SessionEvent::Failed {
                peer: Some(from),
                session: session.id,
                error: e.to_string(),
            });
        }
    }
}

async fn wait_open(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
) -> Result<(), HandshakeError> {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => return Ok(()),
            ChannelEvent::Error(e) => return Err(HandshakeError::ChannelOpen(e)),
            ChannelEvent::Close => {
                return Err(HandshakeError::ChannelOpen("closed before open".into()))
            }
            ChannelEvent::Message(_) => trace!("Message before open, ignoring"),
        }
    }
    Err(HandshakeError::ChannelOpen("channel dropped".into()))
}

/// Forward messages of one channel leg to the session event stream. Holding
/// `channel` keeps an inbound leg alive for as long as it is read.
fn spawn_reader(
    session: Arc<Mutex<HandshakeSession>>,
    id: u64,
    peer: Option<Peer>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    channel: Option<Arc<dyn DataChannel>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _channel = channel;
        let name = peer
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "unknown".to_string());

        while let Some(event) = channel_events.recv().await {
            match event {
                ChannelEvent::Open => {
                    let mut s = session.lock().await;
                    if s.id == id && s.phase != HandshakePhase::Failed {
                        s.set_phase(HandshakePhase::Connected);
                    }
                    info!("Inbound data channel from {} open", name);
                }
                ChannelEvent::Message(data) => {
                    debug!("Received {} bytes from {}", data.len(), name);
                    let _ = events.send(SessionEvent::Message {
                        from: peer.clone(),
                        data,
                    });
                }
                ChannelEvent::Error(e) => warn!("Data channel error from {}: {}", name, e),
                ChannelEvent::Close => {
                    debug!("Data channel from {} closed", name);
                    let _ = events.send(SessionEvent::Closed {
                        peer: peer.clone(),
                        session: id,
                    });
                    break;
                }
            }
        }
    })
}

async fn replay_candidates(session: &mut HandshakeSession) {
    let pending = std::mem::take(&mut session.pending_candidates);
    if pending.is_empty() {
        return;
    }

    let mut replayed = 0;
    for buffered in pending {
        if !session.is_correspondent(&buffered.from) {
            debug!("Dropping buffered candidate from {}", buffered.from);
            continue;
        }
        match session.connection.add_ice_candidate(&buffered.candidate).await {
            Ok(()) => replayed += 1,
            Err(e) => warn!("Buffered candidate from {} rejected: {}", buffered.from, e),
        }
    }
    debug!("Replayed {} buffered candidate(s) in session {}", replayed, session.id);
}

/// Routes inbound signals to one coordinator per remote peer
///
/// A coordinator is created when we start a handshake or when an unknown peer
/// sends an offer. Candidates from unknown peers are held (bounded) until their
/// offer arrives; answers from unknown peers are dropped.
pub struct CoordinatorPool {
    signaling: Arc<SignalingTransport>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<SessionEvent>,
    open_timeout: Duration,
    coordinators: Mutex<HashMap<String, Arc<HandshakeCoordinator>>>,
    early_candidates: Mutex<VecDeque<(String, String)>>,
}

impl CoordinatorPool {
    pub fn new(
        signaling: Arc<SignalingTransport>,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<SessionEvent>,
        open_timeout: Duration,
    ) -> Self {
        Self {
            signaling,
            connector,
            events,
            open_timeout,
            coordinators: Mutex::new(HashMap::new()),
            early_candidates: Mutex::new(VecDeque::new()),
        }
    }

    /// Coordinator dedicated to `peer`, created on first use
    pub async fn coordinator_for(
        &self,
        peer: &str,
    ) -> Result<Arc<HandshakeCoordinator>, HandshakeError> {
        let mut coordinators = self.coordinators.lock().await;
        if let Some(existing) = coordinators.get(peer) {
            return Ok(existing.clone());
        }

        let coordinator = Arc::new(
            HandshakeCoordinator::new(
                self.signaling.clone(),
                self.connector.clone(),
                self.events.clone(),
                self.open_timeout,
            )
            .await?,
        );
        coordinators.insert(peer.to_string(), coordinator.clone());
        debug!("Created coordinator for {}", peer);
        Ok(coordinator)
    }

    pub async fn handshake(&self, peer: &Peer) -> Result<ReliableChannel, HandshakeError> {
        self.coordinator_for(&peer.name).await?.handshake(peer).await
    }

    /// Close and forget the coordinator of `peer`
    pub async fn remove(&self, peer: &str) {
        self.early_candidates
            .lock()
            .await
            .retain(|(from, _)| from != peer);
        let removed = self.coordinators.lock().await.remove(peer);
        if let Some(coordinator) = removed {
            coordinator.close().await;
            debug!("Released coordinator for {}", peer);
        }
    }

    /// Like [`remove`](Self::remove), but only while `session` is still the
    /// coordinator's current session
    pub async fn release(&self, peer: &str, session: u64) {
        let mut coordinators = self.coordinators.lock().await;
        let Some(coordinator) = coordinators.get(peer).cloned() else {
            return;
        };
        if !coordinator.close_session(session).await {
            trace!("Session {} of {} already replaced", session, peer);
            return;
        }
        coordinators.remove(peer);
        debug!("Released coordinator for {} after session {} ended", peer, session);
    }

    pub async fn close_all(&self) {
        self.early_candidates.lock().await.clear();
        let drained: Vec<_> = self.coordinators.lock().await.drain().collect();
        for (name, coordinator) in drained {
            debug!("Closing coordinator for {}", name);
            coordinator.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.coordinators.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.coordinators.lock().await.is_empty()
    }

    /// Candidates held for peers without a coordinator
    pub async fn early_candidate_count(&self) -> usize {
        self.early_candidates.lock().await.len()
    }

    async fn hold_candidate(&self, from: &Peer, message: String) {
        let mut early = self.early_candidates.lock().await;
        if early.len() >= MAX_EARLY_CANDIDATES {
            if let Some((dropped, _)) = early.pop_front() {
                trace!("Early candidate buffer full, dropping one from {}", dropped);
            }
        }
        early.push_back((from.name.clone(), message));
        debug!("Holding candidate from {} until its offer", from.name);
    }

    async fn take_early(&self, from: &str) -> Vec<String> {
        let mut early = self.early_candidates.lock().await;
        let mut taken = Vec::new();
        early.retain(|(name, message)| {
            if name == from {
                taken.push(message.clone());
                false
            } else {
                true
            }
        });
        taken
    }
}

#[async_trait]
impl SignalHandler for CoordinatorPool {
    async fn on_signal(&self, from: Peer, message: String) {
        let existing = self.coordinators.lock().await.get(&from.name).cloned();
        if let Some(coordinator) = existing {
            coordinator.on_signal(from, message).await;
            return;
        }

        let kind = match SignalingEnvelope::from_json(&message) {
            Ok(envelope) => envelope.kind(),
            Err(e) => {
                debug!("Dropping unreadable signal from {}: {}", from.name, e);
                return;
            }
        };
        match kind {
            "offer" => {}
            "candidate" => {
                self.hold_candidate(&from, message).await;
                return;
            }
            _ => {
                debug!("Dropping {} from {}, no session", kind, from.name);
                return;
            }
        }

        match self.coordinator_for(&from.name).await {
            Ok(coordinator) => {
                for candidate in self.take_early(&from.name).await {
                    coordinator.on_signal(from.clone(), candidate).await;
                }
                coordinator.on_signal(from, message).await;
            }
            Err(e) => {
                warn!("No coordinator for {}: {}", from.name, e);
                let _ = self.events.send(SessionEvent::Failed {
                    peer: Some(from),
                    session: 0,
                    error: e.to_string(),
                });
            }
        }
    }
}
