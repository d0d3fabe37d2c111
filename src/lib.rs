pub mod config;
pub mod error;
pub mod framing;
pub mod memory;
pub mod mime;
pub mod presence;
pub mod relay;
pub mod transfer;
pub mod webrtc;

pub use config::{ensure_keys_at, get_config_path, get_nsec_path, Config, RetryConfig};
pub use error::{
    ConnectionError, FrameError, HandshakeError, OrchestratorError, PresenceError,
    SignalingError, TransferError,
};
pub use framing::{DecodedFile, FileFramer, FileMetadata};
pub use memory::{MemoryHub, SimNetwork};
pub use presence::{
    PresenceChannel, PresenceDirectory, PresenceEvent, PresenceObserver, PresenceSet,
    PresenceStatus,
};
pub use relay::{NostrRelay, RelaySettings, DEFAULT_SCOPE};
pub use transfer::{
    AcceptAll, DeclineAll, DownloadDir, OutgoingFile, ReceivePrompt, SendReport,
    TransferEvent, TransferOrchestrator, TransferSettings,
};
pub use webrtc::{HandshakeCoordinator, Peer, RtcConnector, SignalingTransport};
