//! Error types for peerdrop
//!
//! Every failure is scoped to one peer, one session or one file; none of these
//! is fatal to the process.

use std::time::Duration;

use thiserror::Error;

/// Presence channel failures
#[derive(Error, Debug, Clone)]
pub enum PresenceError {
    #[error("Presence subscription failed after {attempts} attempt(s): {reason}")]
    Subscription { attempts: u32, reason: String },

    #[error("Presence channel not ready: {0}")]
    NotReady(String),

    #[error("Presence transport error: {0}")]
    Transport(String),
}

/// Signaling transport failures
#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Signaling subscription failed: {0}")]
    Subscription(String),

    #[error("Signaling send failed: {0}")]
    Send(String),

    #[error("Signaling transport not connected")]
    NotConnected,
}

/// Failures reported by the NAT-traversal connection primitive
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Connection setup failed: {0}")]
    Setup(String),

    #[error("Session description rejected: {0}")]
    Description(String),

    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    #[error("Data channel error: {0}")]
    Channel(String),

    #[error("Connection closed")]
    Closed,
}

/// Handshake failures, fatal to one session only
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Data channel failed to open: {0}")]
    ChannelOpen(String),

    #[error("Data channel did not open within {0:?}")]
    Timeout(Duration),

    #[error("Handshake superseded by a newer session")]
    Superseded,

    #[error("Failed to apply {step}: {source}")]
    Apply {
        step: &'static str,
        #[source]
        source: ConnectionError,
    },

    #[error("Malformed signaling envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("Unexpected {kind} from {from} in phase {phase}")]
    UnexpectedSignal {
        kind: &'static str,
        from: String,
        phase: String,
    },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// File frame encode/decode failures
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Metadata length {declared} exceeds available {available} bytes")]
    MetadataTruncated { declared: usize, available: usize },

    #[error("Invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Declared size {declared} does not match content length {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Frame of {len} bytes exceeds maximum of {max} bytes")]
    TooLarge { len: usize, max: usize },
}

/// Per-file transfer failures
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Unable to read {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to frame {name}: {source}")]
    Frame {
        name: String,
        #[source]
        source: FrameError,
    },

    #[error("Unable to send {name}: {source}")]
    Send {
        name: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Unable to save {name}: {source}")]
    Save {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Failures bringing a peer online
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}
