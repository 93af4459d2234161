//! Capability interface over a peer-connection transport engine.
//!
//! The bridge never talks to the network directly. It drives an engine
//! through [`TransportEngine`], [`PeerContext`] and [`DataChannel`]; the
//! production adapter is [`WebRtcEngine`] and tests use [`MemoryEngine`].

mod memory;
mod rtc;

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use memory::{MemoryChannel, MemoryEngine, MemoryPeer, Stage};
pub use rtc::WebRtcEngine;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
            SdpKind::Pranswer => f.write_str("pranswer"),
            SdpKind::Rollback => f.write_str("rollback"),
        }
    }
}

/// A serialized session description, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Once a peer reaches a terminal state it never recovers.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub is_string: bool,
    pub data: Bytes,
}

impl ChannelMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            is_string: true,
            data: Bytes::from(text.into()),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            is_string: false,
            data: data.into(),
        }
    }

    /// Payload as text; invalid UTF-8 is replaced rather than rejected.
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Process-wide engine settings, read-only once the engine is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new(DEFAULT_STUN_URL)],
        }
    }
}

impl EngineConfig {
    /// No connectivity-assistance servers; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create peer connection: {0}")]
    Create(String),
    #[error("remote description rejected: {0}")]
    RemoteDescription(String),
    #[error("answer generation failed: {0}")]
    Answer(String),
    #[error("local description rejected: {0}")]
    LocalDescription(String),
    #[error("data channel closed")]
    ChannelClosed,
    #[error("data channel send failed: {0}")]
    Send(String),
    #[error("transport engine error: {0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Resolves once the engine finishes gathering connectivity candidates.
pub struct GatheringComplete {
    rx: mpsc::Receiver<()>,
}

impl GatheringComplete {
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Completes on the done signal or when the engine drops the notifier.
    pub async fn wait(mut self) {
        let _ = self.rx.recv().await;
    }
}

#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_peer(&self) -> EngineResult<Arc<dyn PeerContext>>;
}

#[async_trait]
pub trait PeerContext: Send + Sync {
    async fn set_remote_description(&self, desc: SessionDescriptor) -> EngineResult<()>;
    async fn create_answer(&self) -> EngineResult<SessionDescriptor>;
    /// Must be taken before the local description is committed.
    async fn gathering_complete(&self) -> GatheringComplete;
    async fn set_local_description(&self, desc: SessionDescriptor) -> EngineResult<()>;
    async fn local_description(&self) -> Option<SessionDescriptor>;
    /// Channels opened by the remote peer. Returns `None` after the first call.
    fn data_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>;
    fn state(&self) -> watch::Receiver<PeerState>;
    async fn close(&self) -> EngineResult<()>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn id(&self) -> u16;
    fn ready_state(&self) -> ChannelState;
    async fn send_text(&self, text: String) -> EngineResult<usize>;
    /// Lifecycle and message events. Returns `None` after the first call.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_uses_browser_field_names() {
        let desc = SessionDescriptor::answer("v=0");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0");

        let pranswer: SessionDescriptor =
            serde_json::from_str(r#"{"type":"pranswer","sdp":"v=0"}"#).unwrap();
        assert_eq!(pranswer.kind, SdpKind::Pranswer);
        assert_eq!(SdpKind::Rollback.to_string(), "rollback");
    }

    #[test]
    fn default_config_points_at_public_stun() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ice_servers.len(), 1);
        assert_eq!(cfg.ice_servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert!(EngineConfig::localhost().ice_servers.is_empty());
    }

    #[test]
    fn lossy_text_decoding() {
        let msg = ChannelMessage::binary(Bytes::from_static(b"pi\xffng"));
        assert_eq!(msg.as_text(), "pi\u{fffd}ng");
        assert_eq!(ChannelMessage::text("ping").as_text(), "ping");
    }

    #[test]
    fn only_failed_and_closed_are_terminal() {
        assert!(PeerState::Failed.is_terminal());
        assert!(PeerState::Closed.is_terminal());
        assert!(!PeerState::Disconnected.is_terminal());
        assert_eq!(ChannelState::from_u8(ChannelState::Open as u8), ChannelState::Open);
    }
}
