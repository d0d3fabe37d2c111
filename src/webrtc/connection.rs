//! NAT-traversal capability interface
//!
//! The handshake state machine drives these traits; the `webrtc` crate adapter
//! (`peer` module) and the in-memory simulation (`memory` module) implement them.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::types::SdpKind;
use crate::error::ConnectionError;

/// Events emitted by a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Error(String),
    Close,
}

/// One directed leg of a peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Send one message. Fails unless the channel is open.
    async fn send(&self, data: Bytes) -> Result<(), ConnectionError>;

    /// Bytes accepted by `send` but not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    async fn close(&self);
}

/// A data channel together with its event stream
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.channel.label())
            .finish()
    }
}

/// Events emitted by a peer connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A locally discovered ICE candidate, JSON-serialized (trickle ICE)
    LocalCandidate(String),
    /// The remote side opened a data channel towards us
    InboundChannel(ChannelHandle),
}

/// A peer connection as provided by the NAT-traversal engine
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, ConnectionError>;

    async fn create_answer(&self) -> Result<String, ConnectionError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), ConnectionError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str)
        -> Result<(), ConnectionError>;

    /// Rejected by the engine until a remote description is applied
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), ConnectionError>;

    /// Create an ordered data channel
    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, ConnectionError>;

    async fn close(&self);
}

/// Factory for fresh peer connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<
        (
            Arc<dyn PeerConnection>,
            mpsc::UnboundedReceiver<ConnectionEvent>,
        ),
        ConnectionError,
    >;
}
