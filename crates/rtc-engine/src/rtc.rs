use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::{
    ChannelEvent, ChannelMessage, ChannelState, DataChannel, EngineConfig, EngineError,
    EngineResult, GatheringComplete, PeerContext, PeerState, SdpKind, SessionDescriptor,
    TransportEngine,
};

/// Engine backed by the `webrtc` crate. One instance is shared by every peer.
pub struct WebRtcEngine {
    api: API,
    config: EngineConfig,
}

impl WebRtcEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            api: APIBuilder::new().build(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_peer(&self) -> EngineResult<Arc<dyn PeerContext>> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|err| EngineError::Create(err.to_string()))?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(PeerState::New);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let next = peer_state(state);
            debug!(state = ?next, "peer connection state changed");
            state_tx.send_replace(next);
            Box::pin(async {})
        }));

        // Installed at creation so a channel announced during negotiation is queued.
        let (channel_tx, channel_rx) = mpsc::unbounded_channel::<Arc<dyn DataChannel>>();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel_tx = channel_tx.clone();
            Box::pin(async move {
                debug!(
                    label = %dc.label(),
                    id = dc.id(),
                    "remote data channel announced"
                );
                if channel_tx.send(WebRtcChannel::wrap(dc)).is_err() {
                    warn!("data channel announced after subscriber went away");
                }
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            channels: Mutex::new(Some(channel_rx)),
            state: state_rx,
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    channels: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>>,
    state: watch::Receiver<PeerState>,
}

#[async_trait]
impl PeerContext for WebRtcPeer {
    async fn set_remote_description(&self, desc: SessionDescriptor) -> EngineResult<()> {
        let desc = to_rtc(desc).map_err(|err| EngineError::RemoteDescription(err.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|err| EngineError::RemoteDescription(err.to_string()))
    }

    async fn create_answer(&self) -> EngineResult<SessionDescriptor> {
        self.pc
            .create_answer(None)
            .await
            .map_err(|err| EngineError::Answer(err.to_string()))
            .and_then(|desc| {
                from_rtc(desc).ok_or_else(|| {
                    EngineError::Answer("answer has no session description type".into())
                })
            })
    }

    async fn gathering_complete(&self) -> GatheringComplete {
        GatheringComplete::new(self.pc.gathering_complete_promise().await)
    }

    async fn set_local_description(&self, desc: SessionDescriptor) -> EngineResult<()> {
        let desc = to_rtc(desc).map_err(|err| EngineError::LocalDescription(err.to_string()))?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|err| EngineError::LocalDescription(err.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescriptor> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    fn data_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>> {
        self.channels.lock().take()
    }

    fn state(&self) -> watch::Receiver<PeerState> {
        self.state.clone()
    }

    async fn close(&self) -> EngineResult<()> {
        self.pc
            .close()
            .await
            .map_err(|err| EngineError::Other(err.to_string()))
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl WebRtcChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<dyn DataChannel> {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = message_tx.send(ChannelEvent::Message(ChannelMessage {
                is_string: msg.is_string,
                data: msg.data,
            }));
            Box::pin(async {})
        }));

        dc.on_close(Box::new(move || {
            let _ = tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        Arc::new(WebRtcChannel {
            dc,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn id(&self) -> u16 {
        self.dc.id()
    }

    fn ready_state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send_text(&self, text: String) -> EngineResult<usize> {
        if self.ready_state() != ChannelState::Open {
            return Err(EngineError::ChannelClosed);
        }
        self.dc
            .send_text(text)
            .await
            .map_err(|err| EngineError::Send(err.to_string()))
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }
}

fn to_rtc(desc: SessionDescriptor) -> Result<RTCSessionDescription, webrtc::Error> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        // Rollback carries no session to parse.
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = desc.sdp;
            Ok(rollback)
        }
    }
}

/// `None` for `Unspecified`, which never describes a usable session.
fn from_rtc(desc: RTCSessionDescription) -> Option<SessionDescriptor> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescriptor {
        kind,
        sdp: desc.sdp,
    })
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}
