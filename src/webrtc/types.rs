//! Peer identity and signaling wire types

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Label of the ordered data channel carrying file frames
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Generate a random display name for peers that did not configure one
pub fn generate_name() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .filter_map(|_| char::from_digit(rng.gen_range(0..36), 36))
        .collect();
    format!("peer-{}", suffix)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An online peer. `name` is both the display identity and the signaling address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    /// Unix seconds
    pub online_since: u64,
}

impl Peer {
    /// A peer coming online now
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            online_since: now_secs(),
        }
    }

    pub fn with_online_since(name: impl Into<String>, online_since: u64) -> Self {
        Self {
            name: name.into(),
            online_since,
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Handshake payload carried as the opaque string of a signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingEnvelope {
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
    /// `candidate` is itself a JSON-serialized ICE candidate record
    #[serde(rename = "candidate")]
    Candidate { candidate: String },
}

impl SignalingEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::Offer { .. } => "offer",
            SignalingEnvelope::Answer { .. } => "answer",
            SignalingEnvelope::Candidate { .. } => "candidate",
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        SignalingEnvelope::Offer { sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SignalingEnvelope::Answer { sdp: sdp.into() }
    }

    pub fn candidate(candidate: impl Into<String>) -> Self {
        SignalingEnvelope::Candidate {
            candidate: candidate.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// A signaling message as delivered to a peer's inbound channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: Peer,
    pub message: String,
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// Handshake state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Idle,
    /// Initiator: offer applied locally and being sent
    LocalOfferSent,
    /// Initiator: offer sent, waiting for the answer
    AwaitingRemoteDescription,
    /// Responder: remote offer being applied
    RemoteOfferReceived,
    /// Responder: answer sent
    LocalAnswerSent,
    Connected,
    Failed,
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakePhase::Idle => write!(f, "idle"),
            HandshakePhase::LocalOfferSent => write!(f, "local-offer-sent"),
            HandshakePhase::AwaitingRemoteDescription => write!(f, "awaiting-remote-description"),
            HandshakePhase::RemoteOfferReceived => write!(f, "remote-offer-received"),
            HandshakePhase::LocalAnswerSent => write!(f, "local-answer-sent"),
            HandshakePhase::Connected => write!(f, "connected"),
            HandshakePhase::Failed => write!(f, "failed"),
        }
    }
}
