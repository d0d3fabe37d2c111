//! Per-identity signaling transport
//!
//! Inbound signals addressed to the local peer are dispatched one at a time, in
//! arrival order, to the single installed handler.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{Peer, SignalMessage};
use crate::error::SignalingError;

/// Addressable unicast channel provided by a signaling backend
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Subscribe to the inbound channel addressed by `identity.name`
    async fn subscribe(
        &self,
        identity: &Peer,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError>;

    /// Deliver `message` to the inbound channel of `to`
    async fn send(&self, to: &str, message: SignalMessage) -> Result<(), SignalingError>;

    async fn unsubscribe(&self, identity: &str);
}

/// Receiver of inbound signals
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_signal(&self, from: Peer, message: String);
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn SignalHandler>>>>;

pub struct SignalingTransport {
    local: Peer,
    channel: Arc<dyn SignalingChannel>,
    handler: HandlerSlot,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingTransport {
    pub fn new(local: Peer, channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            local,
            channel,
            handler: Arc::new(RwLock::new(None)),
            dispatch: Mutex::new(None),
        }
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    /// Install the message handler, replacing any previous one
    pub async fn set_handler(&self, handler: Arc<dyn SignalHandler>) {
        let previous = self.handler.write().await.replace(handler);
        if previous.is_some() {
            debug!("Replaced signaling handler for {}", self.local.name);
        }
    }

    pub async fn clear_handler(&self) {
        self.handler.write().await.take();
    }

    /// Subscribe to our own inbound channel. Idempotent while connected.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let mut dispatch = self.dispatch.lock().await;
        if dispatch.is_some() {
            return Ok(());
        }

        let mut inbound = self.channel.subscribe(&self.local).await?;
        let handler = self.handler.clone();
        let name = self.local.name.clone();

        *dispatch = Some(tokio::spawn(async move {
            while let Some(signal) = inbound.recv().await {
                let current = handler.read().await.clone();
                match current {
                    Some(h) => h.on_signal(signal.from, signal.message).await,
                    None => debug!(
                        "No signaling handler installed, dropping message from {}",
                        signal.from.name
                    ),
                }
            }
            debug!("Signaling inbox for {} closed", name);
        }));

        info!("Signaling connected as {}", self.local.name);
        Ok(())
    }

    /// Fire-and-forget delivery of `payload` to `to`
    pub async fn send_message(&self, to: &Peer, payload: &str) -> Result<(), SignalingError> {
        let message = SignalMessage {
            from: self.local.clone(),
            message: payload.to_string(),
        };
        self.channel.send(&to.name, message).await
    }

    /// Release the inbound subscription. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let Some(task) = self.dispatch.lock().await.take() else {
            return;
        };
        task.abort();
        self.channel.unsubscribe(&self.local.name).await;
        info!("Signaling disconnected for {}", self.local.name);
    }

    pub async fn is_connected(&self) -> bool {
        self.dispatch.lock().await.is_some()
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch.get_mut().take() {
            warn!("Signaling transport for {} dropped while connected", self.local.name);
            task.abort();
        }
    }
}
