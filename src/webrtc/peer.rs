//! Connection primitive backed by the `webrtc` crate

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::connection::{
    ChannelEvent, ChannelHandle, ConnectionEvent, Connector, DataChannel, PeerConnection,
};
use super::types::SdpKind;
use crate::error::ConnectionError;

/// Creates `RTCPeerConnection`s configured with the given STUN servers
#[derive(Debug, Clone)]
pub struct RtcConnector {
    stun_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection, webrtc::Error> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config).await
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(
        &self,
    ) -> Result<
        (
            Arc<dyn PeerConnection>,
            mpsc::UnboundedReceiver<ConnectionEvent>,
        ),
        ConnectionError,
    > {
        let pc = Arc::new(
            self.new_peer_connection()
                .await
                .map_err(|e| ConnectionError::Setup(e.to_string()))?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(c) = candidate else {
                    trace!("ICE gathering complete");
                    return;
                };
                match c.to_json().map(|init| serde_json::to_string(&init)) {
                    Ok(Ok(json)) => {
                        let _ = candidate_tx.send(ConnectionEvent::LocalCandidate(json));
                    }
                    Ok(Err(e)) => warn!("Failed to serialize ICE candidate: {}", e),
                    Err(e) => warn!("Failed to convert ICE candidate: {}", e),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            Box::pin(async move {
                info!("Peer connection state: {:?}", state);
            })
        }));

        let channel_tx = events_tx;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel_tx = channel_tx.clone();
            Box::pin(async move {
                debug!("Received data channel '{}'", dc.label());
                let events = attach_channel(&dc);
                let handle = ChannelHandle {
                    channel: Arc::new(RtcDataChannel { dc }),
                    events,
                };
                let _ = channel_tx.send(ConnectionEvent::InboundChannel(handle));
            })
        }));

        let connection: Arc<dyn PeerConnection> = Arc::new(RtcPeerConnection { pc });
        Ok((connection, events_rx))
    }
}

/// Route data channel callbacks into an event stream
fn attach_channel(dc: &Arc<RTCDataChannel>) -> mpsc::UnboundedReceiver<ChannelEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        let _ = open_tx.send(ChannelEvent::Open);
        Box::pin(async {})
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = message_tx.send(ChannelEvent::Message(msg.data));
        Box::pin(async {})
    }));

    let error_tx = tx.clone();
    dc.on_error(Box::new(move |err: webrtc::Error| {
        let _ = error_tx.send(ChannelEvent::Error(err.to_string()));
        Box::pin(async {})
    }));

    let close_tx = tx.clone();
    dc.on_close(Box::new(move || {
        let _ = close_tx.send(ChannelEvent::Close);
        Box::pin(async {})
    }));

    // Inbound channels may already be open by the time handlers are attached
    if dc.ready_state() == RTCDataChannelState::Open {
        let _ = tx.send(ChannelEvent::Open);
    }

    rx
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

fn description(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription, ConnectionError> {
    let desc = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
        SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
    };
    desc.map_err(|e| ConnectionError::Description(e.to_string()))
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<String, ConnectionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| ConnectionError::Description(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, ConnectionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ConnectionError::Description(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), ConnectionError> {
        self.pc
            .set_local_description(description(kind, sdp)?)
            .await
            .map_err(|e| ConnectionError::Description(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(description(kind, sdp)?)
            .await
            .map_err(|e| ConnectionError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), ConnectionError> {
        let value: serde_json::Value = serde_json::from_str(candidate)
            .map_err(|e| ConnectionError::Candidate(e.to_string()))?;

        let candidate_str = value
            .get("candidate")
            .and_then(|c| c.as_str())
            .unwrap_or("");
        if candidate_str.is_empty() {
            // End-of-candidates marker
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate_str.to_string(),
            sdp_mid: value
                .get("sdpMid")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string()),
            sdp_mline_index: value
                .get("sdpMLineIndex")
                .and_then(|i| i.as_u64())
                .map(|i| i as u16),
            username_fragment: value
                .get("usernameFragment")
                .and_then(|u| u.as_str())
                .map(|s| s.to_string()),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ConnectionError::Candidate(e.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, ConnectionError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| ConnectionError::Channel(e.to_string()))?;
        let events = attach_channel(&dc);
        Ok(ChannelHandle {
            channel: Arc::new(RtcDataChannel { dc }),
            events,
        })
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}

struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send(&self, data: Bytes) -> Result<(), ConnectionError> {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            return Err(ConnectionError::Channel(format!(
                "channel is {}",
                self.dc.ready_state()
            )));
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::Channel(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("Error closing data channel: {}", e);
        }
    }
}
