//! Peer-to-peer session establishment
//!
//! Offer/answer and trickle-ICE exchange over a per-identity signaling transport.
//! Handshake payloads are JSON envelopes:
//! - `{"type":"offer","sdp":"..."}`
//! - `{"type":"answer","sdp":"..."}`
//! - `{"type":"candidate","candidate":"<JSON ICE candidate>"}`

mod connection;
mod handshake;
mod peer;
mod signaling;
mod types;

#[cfg(test)]
mod tests;

pub use connection::{
    ChannelEvent, ChannelHandle, ConnectionEvent, Connector, DataChannel, PeerConnection,
};
pub use handshake::{
    CoordinatorPool, HandshakeCoordinator, ReliableChannel, SessionEvent, DEFAULT_OPEN_TIMEOUT,
};
pub use peer::RtcConnector;
pub use signaling::{SignalHandler, SignalingChannel, SignalingTransport};
pub use types::{
    generate_name, HandshakePhase, Peer, SdpKind, SignalMessage, SignalingEnvelope,
    DATA_CHANNEL_LABEL,
};
