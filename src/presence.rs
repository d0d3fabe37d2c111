//! Presence directory
//!
//! Registers the local peer in a shared presence scope and reconciles the set
//! of online peers from sync, join and leave events.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::PresenceError;
use crate::webrtc::Peer;

/// Presence events, each mapping an opaque session key to peer records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Complete membership snapshot
    Sync(HashMap<String, Vec<Peer>>),
    Join { key: String, peers: Vec<Peer> },
    Leave { key: String, peers: Vec<Peer> },
}

/// Presence backend
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn subscribe(
        &self,
        scope: &str,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, PresenceError>;

    async fn track(&self, peer: &Peer) -> Result<(), PresenceError>;

    async fn untrack(&self) -> Result<(), PresenceError>;

    async fn unsubscribe(&self);
}

/// Membership callbacks. Deltas must be merged; `on_sync` replaces.
pub trait PresenceObserver: Send + Sync {
    fn on_sync(&self, _members: &[Peer]) {}
    fn on_join(&self, _joined: &[Peer]) {}
    fn on_leave(&self, _left: &[Peer]) {}
}

/// Online peers keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSet {
    members: BTreeMap<String, Peer>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Sync(state) => self.replace(state.values().flatten().cloned()),
            PresenceEvent::Join { peers, .. } => self.join(peers),
            PresenceEvent::Leave { peers, .. } => self.leave(peers),
        }
    }

    pub fn replace(&mut self, peers: impl IntoIterator<Item = Peer>) {
        self.members.clear();
        for peer in peers {
            self.insert(peer);
        }
    }

    pub fn join(&mut self, peers: &[Peer]) {
        for peer in peers {
            self.insert(peer.clone());
        }
    }

    pub fn leave(&mut self, peers: &[Peer]) {
        for peer in peers {
            self.members.remove(&peer.name);
        }
    }

    // Same name twice: the more recently online record wins
    fn insert(&mut self, peer: Peer) {
        match self.members.get(&peer.name) {
            Some(existing) if existing.online_since > peer.online_since => {}
            _ => {
                self.members.insert(peer.name.clone(), peer);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.members.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.members.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceStatus {
    Idle,
    Joining { attempt: u32 },
    Joined,
    Failed { reason: String },
    Left,
}

pub struct PresenceDirectory {
    scope: String,
    channel: Arc<dyn PresenceChannel>,
    retry: RetryConfig,
    observer: Option<Arc<dyn PresenceObserver>>,
    members: Arc<RwLock<PresenceSet>>,
    status: watch::Sender<PresenceStatus>,
    departures: broadcast::Sender<Vec<Peer>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceDirectory {
    pub fn new(scope: impl Into<String>, channel: Arc<dyn PresenceChannel>, retry: RetryConfig) -> Self {
        let (status, _) = watch::channel(PresenceStatus::Idle);
        let (departures, _) = broadcast::channel(64);
        Self {
            scope: scope.into(),
            channel,
            retry,
            observer: None,
            members: Arc::new(RwLock::new(PresenceSet::new())),
            status,
            departures,
            pump: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PresenceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn status(&self) -> PresenceStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<PresenceStatus> {
        self.status.subscribe()
    }

    /// Peers that dropped out of the reconciled set, by leave or by sync
    pub fn departures(&self) -> broadcast::Receiver<Vec<Peer>> {
        self.departures.subscribe()
    }

    pub async fn members(&self) -> Vec<Peer> {
        self.members.read().await.peers()
    }

    pub async fn get(&self, name: &str) -> Option<Peer> {
        self.members.read().await.get(name).cloned()
    }

    /// Register `local` in the presence scope. Idempotent while joined.
    pub async fn join(&self, local: &Peer) -> Result<(), PresenceError> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            debug!("Already joined presence scope {}", self.scope);
            return Ok(());
        }

        let events = self.subscribe_with_retry().await?;
        *pump = Some(self.spawn_pump(events));

        if let Err(e) = self.channel.track(local).await {
            warn!("Failed to track {} in {}: {}", local.name, self.scope, e);
            if let Some(task) = pump.take() {
                task.abort();
            }
            self.channel.unsubscribe().await;
            self.status.send_replace(PresenceStatus::Failed {
                reason: e.to_string(),
            });
            return Err(e);
        }

        self.status.send_replace(PresenceStatus::Joined);
        info!("Joined presence scope {} as {}", self.scope, local.name);
        Ok(())
    }

    async fn subscribe_with_retry(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, PresenceError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.status.send_replace(PresenceStatus::Joining { attempt });
            match self.channel.subscribe(&self.scope).await {
                Ok(events) => return Ok(events),
                Err(e) if attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Presence subscription attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!("Presence subscription failed after {} attempt(s): {}", attempt, reason);
                    self.status.send_replace(PresenceStatus::Failed {
                        reason: reason.clone(),
                    });
                    return Err(PresenceError::Subscription {
                        attempts: attempt,
                        reason,
                    });
                }
            }
        }
    }

    fn spawn_pump(&self, mut events: mpsc::UnboundedReceiver<PresenceEvent>) -> JoinHandle<()> {
        let members = self.members.clone();
        let observer = self.observer.clone();
        let departures = self.departures.clone();
        let scope = self.scope.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let (snapshot, departed) = {
                    let mut set = members.write().await;
                    let before = set.peers();
                    set.apply(&event);
                    let departed: Vec<Peer> =
                        before.into_iter().filter(|p| !set.contains(&p.name)).collect();
                    (set.peers(), departed)
                };
                if !departed.is_empty() {
                    let _ = departures.send(departed);
                }
                match &event {
                    PresenceEvent::Sync(_) => {
                        debug!("Presence sync in {}: {} online", scope, snapshot.len());
                        if let Some(o) = &observer {
                            o.on_sync(&snapshot);
                        }
                    }
                    PresenceEvent::Join { peers, .. } => {
                        debug!("Presence join in {}: {:?}", scope, names(peers));
                        if let Some(o) = &observer {
                            o.on_join(peers);
                        }
                    }
                    PresenceEvent::Leave { peers, .. } => {
                        debug!("Presence leave in {}: {:?}", scope, names(peers));
                        if let Some(o) = &observer {
                            o.on_leave(peers);
                        }
                    }
                }
            }
            debug!("Presence stream for {} ended", scope);
        })
    }

    /// Deregister and release the subscription. Best effort, never fails.
    pub async fn leave(&self) {
        let pump = self.pump.lock().await.take();
        if let Some(task) = pump {
            task.abort();
            if let Err(e) = self.channel.untrack().await {
                debug!("Untrack in {} failed: {}", self.scope, e);
            }
            info!("Left presence scope {}", self.scope);
        }
        self.channel.unsubscribe().await;
        self.members.write().await.replace(Vec::new());
        self.status.send_replace(PresenceStatus::Left);
    }
}

fn names(peers: &[Peer]) -> Vec<&str> {
    peers.iter().map(|p| p.name.as_str()).collect()
}
