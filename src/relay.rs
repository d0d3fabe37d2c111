//! Presence and signaling over Nostr relays
//!
//! Everything travels as kind 30078 events tagged `["l", "peerdrop"]` with a
//! JSON content body:
//! - `{"type":"here","scope":"users","peer":{...}}` heartbeat
//! - `{"type":"gone","scope":"users","name":"..."}` on untrack
//! - `{"type":"signal","to":"...","from":{...},"message":"..."}`
//!
//! Presence is derived from heartbeats: a peer is online from its first `here`
//! until it says `gone` or has been silent for the peer timeout.

use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nostr::{ClientMessage, EventBuilder, EventId, Filter, JsonUtil, Keys, Kind, RelayMessage, Tag};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, RetryConfig};
use crate::error::{PresenceError, SignalingError};
use crate::presence::{PresenceChannel, PresenceEvent};
use crate::webrtc::{Peer, SignalMessage, SignalingChannel};

pub const DEFAULT_SCOPE: &str = "users";
pub const PEERDROP_TAG: &str = "peerdrop";

const SEEN_CAPACITY: usize = 4096;

/// How long shutdown waits for relay sessions to flush and close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Event content published on the relays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayContent {
    Here { scope: String, peer: Peer },
    Gone { scope: String, name: String },
    Signal {
        to: String,
        from: Peer,
        message: String,
    },
}

impl RelayContent {
    fn kind(&self) -> &'static str {
        match self {
            RelayContent::Here { .. } => "here",
            RelayContent::Gone { .. } => "gone",
            RelayContent::Signal { .. } => "signal",
        }
    }

    /// `d` tag. Presence records of one peer replace each other on the relay.
    fn identifier(&self) -> String {
        match self {
            RelayContent::Here { scope, peer } => presence_identifier(scope, &peer.name),
            RelayContent::Gone { scope, name } => presence_identifier(scope, name),
            RelayContent::Signal { .. } => {
                format!("{}:signal:{:016x}", PEERDROP_TAG, rand::thread_rng().gen::<u64>())
            }
        }
    }
}

fn presence_identifier(scope: &str, name: &str) -> String {
    format!("{}:presence:{}:{}", PEERDROP_TAG, scope, name)
}

/// Relay pool tunables
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub relays: Vec<String>,
    pub hello_interval: Duration,
    pub peer_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            relays: config.signaling.relays.clone(),
            hello_interval: config.hello_interval(),
            peer_timeout: config.peer_timeout(),
            connect_timeout: config.connect_timeout(),
            retry: config.retry.clone(),
        }
    }
}

struct Heartbeat {
    key: String,
    peer: Peer,
    last_seen: Instant,
}

/// Last heartbeat per peer name within one scope
#[derive(Default)]
struct HeartbeatTable {
    entries: HashMap<String, Heartbeat>,
}

impl HeartbeatTable {
    /// Record a heartbeat. Returns true when the peer was not yet present.
    fn touch(&mut self, key: &str, peer: Peer, now: Instant) -> bool {
        match self.entries.get_mut(&peer.name) {
            Some(entry) => {
                entry.last_seen = now;
                if peer.online_since >= entry.peer.online_since {
                    entry.key = key.to_string();
                    entry.peer = peer;
                }
                false
            }
            None => {
                self.entries.insert(
                    peer.name.clone(),
                    Heartbeat {
                        key: key.to_string(),
                        peer,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    fn remove(&mut self, name: &str) -> Option<(String, Peer)> {
        self.entries.remove(name).map(|e| (e.key, e.peer))
    }

    /// Drop peers silent for longer than `timeout`, except `keep`
    fn expire(&mut self, now: Instant, timeout: Duration, keep: Option<&str>) -> Vec<(String, Peer)> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(name, e)| {
                Some(name.as_str()) != keep && now.saturating_duration_since(e.last_seen) > timeout
            })
            .map(|(name, _)| name.clone())
            .collect();
        stale.iter().filter_map(|name| self.remove(name)).collect()
    }

    fn snapshot(&self) -> HashMap<String, Vec<Peer>> {
        let mut snapshot: HashMap<String, Vec<Peer>> = HashMap::new();
        for entry in self.entries.values() {
            snapshot
                .entry(entry.key.clone())
                .or_default()
                .push(entry.peer.clone());
        }
        snapshot
    }
}

struct PresenceSubscription {
    scope: String,
    events: mpsc::UnboundedSender<PresenceEvent>,
}

/// Signal inbox of one local identity
struct SignalInbox {
    sender: mpsc::UnboundedSender<SignalMessage>,
    /// Signals created before this were meant for an earlier session
    opened_at: nostr::Timestamp,
}

#[derive(Default)]
struct RelayState {
    presence: Option<PresenceSubscription>,
    tracked: Option<Peer>,
    tables: HashMap<String, HeartbeatTable>,
    inboxes: HashMap<String, SignalInbox>,
}

impl RelayState {
    fn emit(&self, scope: &str, event: PresenceEvent) {
        if let Some(sub) = &self.presence {
            if sub.scope == scope {
                let _ = sub.events.send(event);
            }
        }
    }

    fn emit_sync(&self, scope: &str) {
        let snapshot = self
            .tables
            .get(scope)
            .map(|t| t.snapshot())
            .unwrap_or_default();
        self.emit(scope, PresenceEvent::Sync(snapshot));
    }

    fn is_idle(&self) -> bool {
        self.presence.is_none() && self.inboxes.is_empty()
    }

    /// Hand a signal to the inbox of `to`. Returns false when it is not ours
    /// or predates the inbox.
    fn deliver_signal(&self, to: &str, created_at: nostr::Timestamp, message: SignalMessage) -> bool {
        let Some(inbox) = self.inboxes.get(to) else {
            trace!("Signal for {} is not ours", to);
            return false;
        };
        if created_at < inbox.opened_at {
            debug!(
                "Dropping stale signal from {} to {} created at {}",
                message.from.name, to, created_at
            );
            return false;
        }
        inbox.sender.send(message).is_ok()
    }
}

struct RelayInner {
    keys: Keys,
    settings: RelaySettings,
    outgoing: broadcast::Sender<nostr::Event>,
    connected: watch::Sender<usize>,
    shutdown: watch::Sender<bool>,
    state: Mutex<RelayState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Presence and signaling backend over a pool of Nostr relays
#[derive(Clone)]
pub struct NostrRelay {
    inner: Arc<RelayInner>,
}

impl NostrRelay {
    pub fn new(keys: Keys, settings: RelaySettings) -> Self {
        let (outgoing, _) = broadcast::channel(256);
        let (connected, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RelayInner {
                keys,
                settings,
                outgoing,
                connected,
                shutdown,
                state: Mutex::new(RelayState::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Relays currently connected
    pub fn connected_count(&self) -> usize {
        *self.inner.connected.borrow()
    }

    /// Start the relay pool if needed and wait for at least one relay
    async fn ensure_started(&self) -> Result<(), String> {
        {
            let mut tasks = self.inner.tasks.lock().await;
            if tasks.is_empty() {
                if self.inner.settings.relays.is_empty() {
                    return Err("no relays configured".to_string());
                }
                self.inner.shutdown.send_replace(false);

                let (event_tx, event_rx) = mpsc::channel::<(String, nostr::Event)>(256);
                for url in &self.inner.settings.relays {
                    tasks.push(tokio::spawn(relay_loop(
                        self.inner.clone(),
                        url.clone(),
                        event_tx.clone(),
                    )));
                }
                tasks.push(tokio::spawn(dispatch_loop(self.inner.clone(), event_rx)));
                tasks.push(tokio::spawn(heartbeat_loop(self.inner.clone())));
                info!(
                    "Started relay pool with {} relay(s)",
                    self.inner.settings.relays.len()
                );
            }
        }

        let timeout = self.inner.settings.connect_timeout;
        let mut connected = self.inner.connected.subscribe();
        let result = match tokio::time::timeout(timeout, connected.wait_for(|n| *n > 0)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err("relay pool stopped".to_string()),
            Err(_) => Err(format!("no relay reachable within {:?}", timeout)),
        };
        result
    }

    async fn is_started(&self) -> bool {
        !self.inner.tasks.lock().await.is_empty()
    }

    /// Stop all relay connections. Sessions get a grace period to flush
    /// queued events and close their sockets; whatever is left is aborted.
    pub async fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }
        self.inner.shutdown.send_replace(true);

        let handles: Vec<_> = tasks.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Relay sessions did not stop within {:?}, aborting", SHUTDOWN_GRACE);
            for abort in aborts {
                abort.abort();
            }
        }
        self.inner.connected.send_replace(0);
        info!("Relay pool stopped");
    }

    async fn stop_if_idle(&self) {
        let idle = self.inner.state.lock().await.is_idle();
        if idle {
            self.shutdown().await;
        }
    }

    async fn publish(&self, content: &RelayContent) -> Result<()> {
        publish(&self.inner, content).await
    }
}

async fn publish(inner: &RelayInner, content: &RelayContent) -> Result<()> {
    let event = create_event(&inner.keys, content).await?;
    inner
        .outgoing
        .send(event)
        .map_err(|_| anyhow::anyhow!("no relay connected"))?;
    trace!("Published {}", content.kind());
    Ok(())
}

async fn create_event(keys: &Keys, content: &RelayContent) -> Result<nostr::Event> {
    let json = serde_json::to_string(content)?;
    let identifier = content.identifier();

    let event = EventBuilder::new(Kind::ApplicationSpecificData, json)
        .tags(vec![
            Tag::parse(["l", PEERDROP_TAG])?,
            Tag::parse(["d", &identifier])?,
        ])
        .sign(keys)
        .await?;

    Ok(event)
}

/// Keep one relay connected, reconnecting with backoff until shutdown
async fn relay_loop(
    inner: Arc<RelayInner>,
    url: String,
    event_tx: mpsc::Sender<(String, nostr::Event)>,
) {
    let mut shutdown_rx = inner.shutdown.subscribe();
    let mut attempt = 0u32;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        match relay_session(&inner, &url, &event_tx, &mut shutdown_rx).await {
            Ok(()) => attempt = 0,
            Err(e) => error!("Relay {} error: {}", url, e),
        }
        if *shutdown_rx.borrow() {
            break;
        }

        attempt += 1;
        let delay = inner.settings.retry.delay_for(attempt);
        debug!("Reconnecting to {} in {:?}", url, delay);
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Decrements the connected count when a relay session ends
struct ConnectedGuard<'a>(&'a watch::Sender<usize>);

impl Drop for ConnectedGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// One websocket session, from connect until the socket closes
async fn relay_session(
    inner: &RelayInner,
    url: &str,
    event_tx: &mpsc::Sender<(String, nostr::Event)>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    info!("Connecting to relay: {}", url);

    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    let filter = Filter::new()
        .kind(Kind::ApplicationSpecificData)
        .custom_tag(
            nostr::SingleLetterTag::lowercase(nostr::Alphabet::L),
            vec![PEERDROP_TAG],
        )
        .since(nostr::Timestamp::now() - inner.settings.peer_timeout);

    let sub_id = nostr::SubscriptionId::generate();
    let sub_msg = ClientMessage::req(sub_id, vec![filter]);
    write.send(Message::Text(sub_msg.as_json().into())).await?;

    let mut outgoing = inner.outgoing.subscribe();
    inner.connected.send_modify(|n| *n += 1);
    let _guard = ConnectedGuard(&inner.connected);
    info!("Subscribed to {} for peerdrop events", url);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    // Flush what was published before the stop, e.g. a gone record
                    while let Ok(event) = outgoing.try_recv() {
                        let msg = ClientMessage::event(event);
                        if let Err(e) = write.send(Message::Text(msg.as_json().into())).await {
                            warn!("Failed to flush to {}: {}", url, e);
                            break;
                        }
                    }
                    let _ = write.close().await;
                    debug!("Closed relay session {}", url);
                    break;
                }
            }
            Ok(event) = outgoing.recv() => {
                let msg = ClientMessage::event(event);
                if let Err(e) = write.send(Message::Text(msg.as_json().into())).await {
                    warn!("Failed to publish to {}: {}", url, e);
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match RelayMessage::from_json(&text) {
                        Ok(RelayMessage::Event { event, .. }) => {
                            let _ = event_tx.send((url.to_string(), *event)).await;
                        }
                        Ok(_) => {}
                        Err(e) => trace!("Unparsed message from {}: {}", url, e),
                    },
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", url, e);
                        break;
                    }
                    None => {
                        warn!("WebSocket closed: {}", url);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

/// Handle events from every relay, skipping ones already seen via another
async fn dispatch_loop(
    inner: Arc<RelayInner>,
    mut event_rx: mpsc::Receiver<(String, nostr::Event)>,
) {
    let mut seen: HashSet<EventId> = HashSet::new();
    let mut order: VecDeque<EventId> = VecDeque::new();

    while let Some((relay, event)) = event_rx.recv().await {
        if !seen.insert(event.id) {
            continue;
        }
        order.push_back(event.id);
        if order.len() > SEEN_CAPACITY {
            if let Some(old) = order.pop_front() {
                seen.remove(&old);
            }
        }

        if let Err(e) = handle_event(&inner, &relay, &event).await {
            debug!("Error handling event from {}: {}", relay, e);
        }
    }
}

async fn handle_event(inner: &RelayInner, relay: &str, event: &nostr::Event) -> Result<()> {
    let has_tag = event.tags.iter().any(|tag| {
        let v: Vec<String> = tag.clone().to_vec();
        v.len() >= 2 && v[0] == "l" && v[1] == PEERDROP_TAG
    });
    if !has_tag || event.kind != Kind::ApplicationSpecificData {
        return Ok(());
    }
    event.verify()?;

    let content: RelayContent = serde_json::from_str(&event.content)?;
    trace!("Received {} via {}", content.kind(), relay);

    let mut state = inner.state.lock().await;
    match content {
        RelayContent::Here { scope, peer } => {
            let age = nostr::Timestamp::now()
                .as_u64()
                .saturating_sub(event.created_at.as_u64());
            if age > inner.settings.peer_timeout.as_secs() {
                return Ok(());
            }
            let key = event.pubkey.to_hex();
            let table = state.tables.entry(scope.clone()).or_default();
            if table.touch(&key, peer.clone(), Instant::now()) {
                debug!("{} is here in {}", peer.name, scope);
                state.emit(&scope, PresenceEvent::Join { key, peers: vec![peer] });
                state.emit_sync(&scope);
            }
        }
        RelayContent::Gone { scope, name } => {
            if state.tracked.as_ref().is_some_and(|p| p.name == name) {
                return Ok(());
            }
            let removed = state.tables.get_mut(&scope).and_then(|t| t.remove(&name));
            if let Some((key, peer)) = removed {
                debug!("{} is gone from {}", name, scope);
                state.emit(&scope, PresenceEvent::Leave { key, peers: vec![peer] });
                state.emit_sync(&scope);
            }
        }
        RelayContent::Signal { to, from, message } => {
            state.deliver_signal(&to, event.created_at, SignalMessage { from, message });
        }
    }
    Ok(())
}

/// Publish heartbeats for the tracked peer and expire silent ones
async fn heartbeat_loop(inner: Arc<RelayInner>) {
    let hello_interval = inner.settings.hello_interval;
    let mut last_hello = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut shutdown_rx = inner.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
        }

        let here = {
            let mut state = inner.state.lock().await;
            let keep = state.tracked.as_ref().map(|p| p.name.clone());
            let mut expired: Vec<(String, String, Peer)> = Vec::new();
            for (scope, table) in state.tables.iter_mut() {
                for (key, peer) in
                    table.expire(Instant::now(), inner.settings.peer_timeout, keep.as_deref())
                {
                    expired.push((scope.clone(), key, peer));
                }
            }
            for (scope, key, peer) in expired {
                debug!("{} timed out in {}", peer.name, scope);
                state.emit(&scope, PresenceEvent::Leave { key, peers: vec![peer] });
                state.emit_sync(&scope);
            }

            match (&state.tracked, &state.presence) {
                (Some(peer), Some(sub)) if last_hello.elapsed() >= hello_interval => {
                    Some(RelayContent::Here {
                        scope: sub.scope.clone(),
                        peer: peer.clone(),
                    })
                }
                _ => None,
            }
        };

        if let Some(content) = here {
            last_hello = Instant::now();
            if let Err(e) = publish(&inner, &content).await {
                debug!("Heartbeat not sent: {}", e);
            }
        }
    }
}

#[async_trait]
impl PresenceChannel for NostrRelay {
    async fn subscribe(
        &self,
        scope: &str,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, PresenceError> {
        self.ensure_started().await.map_err(PresenceError::Transport)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().await;
        state.presence = Some(PresenceSubscription {
            scope: scope.to_string(),
            events: tx,
        });
        state.emit_sync(scope);
        Ok(rx)
    }

    async fn track(&self, peer: &Peer) -> Result<(), PresenceError> {
        let content = {
            let mut state = self.inner.state.lock().await;
            let scope = match &state.presence {
                Some(sub) => sub.scope.clone(),
                None => return Err(PresenceError::NotReady("track before subscribe".to_string())),
            };
            state.tracked = Some(peer.clone());

            let key = self.inner.keys.public_key().to_hex();
            let table = state.tables.entry(scope.clone()).or_default();
            if table.touch(&key, peer.clone(), Instant::now()) {
                state.emit(&scope, PresenceEvent::Join { key, peers: vec![peer.clone()] });
                state.emit_sync(&scope);
            }
            RelayContent::Here {
                scope,
                peer: peer.clone(),
            }
        };

        self.publish(&content)
            .await
            .map_err(|e| PresenceError::Transport(e.to_string()))
    }

    async fn untrack(&self) -> Result<(), PresenceError> {
        let content = {
            let mut state = self.inner.state.lock().await;
            let Some(peer) = state.tracked.take() else {
                return Ok(());
            };
            let Some(scope) = state.presence.as_ref().map(|s| s.scope.clone()) else {
                return Ok(());
            };
            let removed = state.tables.get_mut(&scope).and_then(|t| t.remove(&peer.name));
            if let Some((key, peer)) = removed {
                state.emit(&scope, PresenceEvent::Leave { key, peers: vec![peer] });
                state.emit_sync(&scope);
            }
            RelayContent::Gone {
                scope,
                name: peer.name,
            }
        };

        self.publish(&content)
            .await
            .map_err(|e| PresenceError::Transport(e.to_string()))
    }

    async fn unsubscribe(&self) {
        if let Err(e) = PresenceChannel::untrack(self).await {
            debug!("Untrack on unsubscribe failed: {}", e);
        }
        self.inner.state.lock().await.presence = None;
        self.stop_if_idle().await;
    }
}

#[async_trait]
impl SignalingChannel for NostrRelay {
    async fn subscribe(
        &self,
        identity: &Peer,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        self.ensure_started()
            .await
            .map_err(SignalingError::Subscription)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .state
            .lock()
            .await
            .inboxes
            .insert(
                identity.name.clone(),
                SignalInbox {
                    sender: tx,
                    opened_at: nostr::Timestamp::now(),
                },
            );
        debug!("Opened relay inbox for {}", identity.name);
        Ok(rx)
    }

    async fn send(&self, to: &str, message: SignalMessage) -> Result<(), SignalingError> {
        if !self.is_started().await {
            return Err(SignalingError::NotConnected);
        }
        let content = RelayContent::Signal {
            to: to.to_string(),
            from: message.from,
            message: message.message,
        };
        self.publish(&content)
            .await
            .map_err(|e| SignalingError::Send(e.to_string()))
    }

    async fn unsubscribe(&self, identity: &str) {
        self.inner.state.lock().await.inboxes.remove(identity);
        self.stop_if_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, since: u64) -> Peer {
        Peer::with_online_since(name, since)
    }

    fn settings(relays: Vec<String>) -> RelaySettings {
        RelaySettings {
            relays,
            hello_interval: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(200),
            retry: RetryConfig::default(),
        }
    }

    #[test]
    fn test_content_format() {
        let here = RelayContent::Here {
            scope: "users".to_string(),
            peer: peer("alice", 1_700_000_000),
        };
        let json: serde_json::Value = serde_json::to_value(&here).unwrap();
        assert_eq!(json["type"], "here");
        assert_eq!(json["scope"], "users");
        assert_eq!(json["peer"]["name"], "alice");

        let signal: RelayContent = serde_json::from_str(
            r#"{"type":"signal","to":"bob","from":{"name":"alice","online_since":1},"message":"{}"}"#,
        )
        .unwrap();
        assert_eq!(
            signal,
            RelayContent::Signal {
                to: "bob".to_string(),
                from: peer("alice", 1),
                message: "{}".to_string(),
            }
        );
    }

    #[test]
    fn test_presence_records_share_identifier() {
        let here = RelayContent::Here {
            scope: "users".to_string(),
            peer: peer("alice", 1),
        };
        let gone = RelayContent::Gone {
            scope: "users".to_string(),
            name: "alice".to_string(),
        };
        assert_eq!(here.identifier(), gone.identifier());
        assert_eq!(here.identifier(), "peerdrop:presence:users:alice");
    }

    #[test]
    fn test_heartbeat_join_and_refresh() {
        let mut table = HeartbeatTable::default();
        let t0 = Instant::now();
        assert!(table.touch("k1", peer("alice", 100), t0));
        assert!(!table.touch("k1", peer("alice", 100), t0 + Duration::from_secs(5)));

        // Older record does not replace a newer one
        assert!(!table.touch("k2", peer("alice", 50), t0 + Duration::from_secs(6)));
        let snapshot = table.snapshot();
        assert_eq!(snapshot.get("k1").unwrap(), &vec![peer("alice", 100)]);
        assert!(!snapshot.contains_key("k2"));
    }

    #[test]
    fn test_heartbeat_expiry() {
        let mut table = HeartbeatTable::default();
        let t0 = Instant::now();
        table.touch("k1", peer("alice", 1), t0);
        table.touch("k2", peer("bob", 1), t0 + Duration::from_secs(20));
        table.touch("k3", peer("me", 1), t0);

        let expired = table.expire(t0 + Duration::from_secs(35), Duration::from_secs(30), Some("me"));
        assert_eq!(expired, vec![("k1".to_string(), peer("alice", 1))]);

        let remaining = table.snapshot();
        assert!(remaining.contains_key("k2"));
        assert!(remaining.contains_key("k3"));
    }

    #[tokio::test]
    async fn test_subscribe_without_relays_fails() {
        let relay = NostrRelay::new(Keys::generate(), settings(Vec::new()));
        let err = PresenceChannel::subscribe(&relay, "users").await.unwrap_err();
        assert!(matches!(err, PresenceError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unreachable_relay_times_out() {
        let relay = NostrRelay::new(
            Keys::generate(),
            settings(vec!["ws://127.0.0.1:1".to_string()]),
        );
        let err = SignalingChannel::subscribe(&relay, &peer("alice", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Subscription(_)));
        relay.shutdown().await;
        assert_eq!(relay.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_send_before_subscribe_is_not_connected() {
        let relay = NostrRelay::new(Keys::generate(), settings(vec!["ws://127.0.0.1:1".to_string()]));
        let msg = SignalMessage {
            from: peer("alice", 1),
            message: "{}".to_string(),
        };
        let err = relay.send("bob", msg).await.unwrap_err();
        assert!(matches!(err, SignalingError::NotConnected));
    }

    #[test]
    fn test_signal_older_than_inbox_is_dropped() {
        let opened_at = nostr::Timestamp::from(1_700_000_100);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = RelayState::default();
        state.inboxes.insert(
            "bob".to_string(),
            SignalInbox {
                sender: tx,
                opened_at,
            },
        );
        let signal = |message: &str| SignalMessage {
            from: peer("alice", 1),
            message: message.to_string(),
        };

        // An offer left over from bob's previous run
        assert!(!state.deliver_signal("bob", nostr::Timestamp::from(1_700_000_040), signal("stale")));
        assert!(!state.deliver_signal("carol", opened_at, signal("not ours")));
        assert!(state.deliver_signal("bob", opened_at, signal("same second")));
        assert!(state.deliver_signal("bob", nostr::Timestamp::from(1_700_000_101), signal("fresh")));

        let delivered: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.message)
            .collect();
        assert_eq!(delivered, vec!["same second", "fresh"]);
    }

    /// Accepts one websocket client and reports its text frames, then "close"
    async fn fake_relay() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => {
                        let _ = frames_tx.send(text.to_string());
                    }
                    Message::Close(_) => {
                        let _ = frames_tx.send("close".to_string());
                        break;
                    }
                    _ => {}
                }
            }
        });
        (url, frames_rx)
    }

    #[tokio::test]
    async fn test_gone_flushed_before_close() {
        let (url, mut frames) = fake_relay().await;
        let relay = NostrRelay::new(Keys::generate(), settings(vec![url]));

        PresenceChannel::subscribe(&relay, "users").await.unwrap();
        relay.track(&peer("alice", 1)).await.unwrap();
        PresenceChannel::unsubscribe(&relay).await;
        assert_eq!(relay.connected_count(), 0);

        let mut seen = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
                .await
                .expect("relay never closed")
                .expect("fake relay stopped");
            if frame == "close" {
                seen.push(frame);
                break;
            }
            if let Ok(ClientMessage::Event(event)) = ClientMessage::from_json(&frame) {
                let content: RelayContent = serde_json::from_str(&event.content).unwrap();
                seen.push(content.kind().to_string());
            }
        }
        assert_eq!(seen, vec!["here", "gone", "close"]);
    }
}
