use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::{
    ChannelEvent, ChannelMessage, ChannelState, DataChannel, EngineError, EngineResult,
    GatheringComplete, PeerContext, PeerState, SdpKind, SessionDescriptor, TransportEngine,
};

const HOST_CANDIDATE: &str = "a=candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host\r\n";

/// Negotiation step at which [`MemoryEngine`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Create,
    RemoteDescription,
    Answer,
    LocalDescription,
}

/// In-memory engine for tests and offline runs. Nothing touches the network:
/// answers are synthesized, gathering completes as soon as the local
/// description is committed and channels are opened by hand.
#[derive(Default)]
pub struct MemoryEngine {
    fail_at: Mutex<Option<Stage>>,
    stall_gathering: AtomicBool,
    next_session: AtomicU64,
    peers: Mutex<Vec<Arc<MemoryPeer>>>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_at(&self, stage: Stage) {
        *self.fail_at.lock() = Some(stage);
    }

    /// Gathering never completes for peers created after this call.
    pub fn stall_gathering(&self) {
        self.stall_gathering.store(true, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<MemoryPeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<MemoryPeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl TransportEngine for MemoryEngine {
    async fn create_peer(&self) -> EngineResult<Arc<dyn PeerContext>> {
        let fail_at = *self.fail_at.lock();
        if fail_at == Some(Stage::Create) {
            return Err(EngineError::Create("injected failure".into()));
        }
        let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let peer = Arc::new(MemoryPeer::new(
            session,
            fail_at,
            self.stall_gathering.load(Ordering::SeqCst),
        ));
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

pub struct MemoryPeer {
    session: u64,
    fail_at: Option<Stage>,
    stall_gathering: bool,
    remote: Mutex<Option<SessionDescriptor>>,
    local: Mutex<Option<SessionDescriptor>>,
    gathered: AtomicBool,
    gathering_tx: Mutex<Option<mpsc::Sender<()>>>,
    next_channel: AtomicU16,
    channel_tx: mpsc::UnboundedSender<Arc<dyn DataChannel>>,
    channel_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    state: watch::Sender<PeerState>,
}

impl MemoryPeer {
    fn new(session: u64, fail_at: Option<Stage>, stall_gathering: bool) -> Self {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(PeerState::New);
        Self {
            session,
            fail_at,
            stall_gathering,
            remote: Mutex::new(None),
            local: Mutex::new(None),
            gathered: AtomicBool::new(false),
            gathering_tx: Mutex::new(None),
            next_channel: AtomicU16::new(0),
            channel_tx,
            channel_rx: Mutex::new(Some(channel_rx)),
            channels: Mutex::new(Vec::new()),
            state,
        }
    }

    pub fn remote_description(&self) -> Option<SessionDescriptor> {
        self.remote.lock().clone()
    }

    pub fn peer_state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: PeerState) {
        self.state.send_replace(state);
    }

    pub fn is_closed(&self) -> bool {
        self.peer_state() == PeerState::Closed
    }

    pub fn channels(&self) -> Vec<Arc<MemoryChannel>> {
        self.channels.lock().clone()
    }

    /// Simulates the remote peer opening a channel: announce it, then open it.
    pub fn open_channel(&self, label: &str) -> Arc<MemoryChannel> {
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(MemoryChannel::new(label, id));
        self.channels.lock().push(channel.clone());
        let _ = self.channel_tx.send(channel.clone());
        channel.open();
        channel
    }

    fn check(&self, stage: Stage) -> bool {
        self.fail_at == Some(stage)
    }
}

#[async_trait]
impl PeerContext for MemoryPeer {
    async fn set_remote_description(&self, desc: SessionDescriptor) -> EngineResult<()> {
        if self.check(Stage::RemoteDescription) {
            return Err(EngineError::RemoteDescription("injected failure".into()));
        }
        if desc.kind != SdpKind::Offer {
            return Err(EngineError::RemoteDescription(format!(
                "expected offer, got {}",
                desc.kind
            )));
        }
        if desc.sdp.trim().is_empty() {
            return Err(EngineError::RemoteDescription(
                "empty session description".into(),
            ));
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(EngineError::RemoteDescription(
                "session description must start with v=0".into(),
            ));
        }
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn create_answer(&self) -> EngineResult<SessionDescriptor> {
        if self.check(Stage::Answer) {
            return Err(EngineError::Answer("injected failure".into()));
        }
        if self.remote.lock().is_none() {
            return Err(EngineError::Answer("no remote description".into()));
        }
        Ok(SessionDescriptor::answer(format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=setup:active\r\n",
            self.session
        )))
    }

    async fn gathering_complete(&self) -> GatheringComplete {
        let (tx, rx) = mpsc::channel(1);
        if !self.gathered.load(Ordering::SeqCst) {
            *self.gathering_tx.lock() = Some(tx);
        }
        GatheringComplete::new(rx)
    }

    async fn set_local_description(&self, desc: SessionDescriptor) -> EngineResult<()> {
        if self.check(Stage::LocalDescription) {
            return Err(EngineError::LocalDescription("injected failure".into()));
        }
        if desc.kind != SdpKind::Answer {
            return Err(EngineError::LocalDescription(format!(
                "expected answer, got {}",
                desc.kind
            )));
        }
        *self.local.lock() = Some(desc);
        self.set_state(PeerState::Connecting);
        if !self.stall_gathering {
            self.gathered.store(true, Ordering::SeqCst);
            if let Some(tx) = self.gathering_tx.lock().take() {
                let _ = tx.try_send(());
            }
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescriptor> {
        let local = self.local.lock().clone()?;
        if !self.gathered.load(Ordering::SeqCst) {
            return Some(local);
        }
        Some(SessionDescriptor {
            kind: local.kind,
            sdp: format!("{}{}", local.sdp, HOST_CANDIDATE),
        })
    }

    fn data_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>> {
        self.channel_rx.lock().take()
    }

    fn state(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    async fn close(&self) -> EngineResult<()> {
        for channel in self.channels() {
            channel.close();
        }
        self.gathering_tx.lock().take();
        self.set_state(PeerState::Closed);
        Ok(())
    }
}

pub struct MemoryChannel {
    label: String,
    id: u16,
    state: AtomicU8,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    outbound: Mutex<Vec<String>>,
}

impl MemoryChannel {
    fn new(label: &str, id: u16) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            label: label.to_string(),
            id,
            state: AtomicU8::new(ChannelState::Connecting as u8),
            fail_sends: AtomicBool::new(false),
            stall_sends: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            outbound: Mutex::new(Vec::new()),
        }
    }

    pub fn open(&self) {
        self.state.store(ChannelState::Open as u8, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Open);
    }

    /// Closes the channel. Idempotent; the close event is emitted once.
    pub fn close(&self) {
        let previous = self.state.swap(ChannelState::Closed as u8, Ordering::SeqCst);
        if ChannelState::from_u8(previous) != ChannelState::Closed {
            let _ = self.events_tx.send(ChannelEvent::Closed);
        }
    }

    /// Flips the state without emitting an event, as when the engine
    /// notices the close before it gets around to reporting it.
    pub fn close_silently(&self) {
        self.state.store(ChannelState::Closed as u8, Ordering::SeqCst);
    }

    pub fn deliver_text(&self, text: &str) {
        let _ = self
            .events_tx
            .send(ChannelEvent::Message(ChannelMessage::text(text)));
    }

    pub fn deliver_binary(&self, data: impl Into<Bytes>) {
        let _ = self
            .events_tx
            .send(ChannelEvent::Message(ChannelMessage::binary(data)));
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Sends issued while stalled never complete, like a full send buffer.
    pub fn stall_sends(&self, stall: bool) {
        self.stall_sends.store(stall, Ordering::SeqCst);
    }

    /// Every text successfully sent on this channel, oldest first.
    pub fn outbound(&self) -> Vec<String> {
        self.outbound.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn ready_state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn send_text(&self, text: String) -> EngineResult<usize> {
        if self.ready_state() != ChannelState::Open {
            return Err(EngineError::ChannelClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(EngineError::Send("injected backpressure".into()));
        }
        if self.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let len = text.len();
        self.outbound.lock().push(text);
        Ok(len)
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[tokio::test]
    async fn full_negotiation_appends_candidates() {
        let engine = MemoryEngine::new();
        let peer = engine.create_peer().await.unwrap();
        peer.set_remote_description(SessionDescriptor::offer(OFFER))
            .await
            .unwrap();
        let answer = peer.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        let gathered = peer.gathering_complete().await;
        peer.set_local_description(answer.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), gathered.wait())
            .await
            .expect("gathering completes");
        let local = peer.local_description().await.unwrap();
        assert!(local.sdp.starts_with(&answer.sdp));
        assert!(local.sdp.contains("typ host"));
    }

    #[tokio::test]
    async fn rejects_empty_and_malformed_offers() {
        let engine = MemoryEngine::new();
        let peer = engine.create_peer().await.unwrap();
        for sdp in ["", "   ", "hello"] {
            let err = peer
                .set_remote_description(SessionDescriptor::offer(sdp))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::RemoteDescription(_)));
        }
        assert!(peer.create_answer().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_gathering_never_resolves() {
        let engine = MemoryEngine::new();
        engine.stall_gathering();
        let peer = engine.create_peer().await.unwrap();
        peer.set_remote_description(SessionDescriptor::offer(OFFER))
            .await
            .unwrap();
        let answer = peer.create_answer().await.unwrap();
        let gathered = peer.gathering_complete().await;
        peer.set_local_description(answer).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(30), gathered.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn channel_send_respects_state() {
        let engine = MemoryEngine::new();
        engine.create_peer().await.unwrap();
        let peer = engine.last_peer().unwrap();
        let channel = peer.open_channel("chat");
        assert_eq!(channel.ready_state(), ChannelState::Open);
        channel.send_text("one".into()).await.unwrap();
        channel.fail_sends(true);
        assert!(matches!(
            channel.send_text("two".into()).await,
            Err(EngineError::Send(_))
        ));
        channel.close();
        channel.close();
        assert!(matches!(
            channel.send_text("three".into()).await,
            Err(EngineError::ChannelClosed)
        ));
        assert_eq!(channel.outbound(), vec!["one".to_string()]);

        let mut events = channel.events().unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(events.recv().await, Some(ChannelEvent::Closed));
        assert!(events.try_recv().is_err());
        assert!(channel.events().is_none());
    }

    #[tokio::test]
    async fn injected_failures_hit_the_requested_stage() {
        let engine = MemoryEngine::new();
        engine.fail_at(Stage::Create);
        assert!(matches!(
            engine.create_peer().await.err(),
            Some(EngineError::Create(_))
        ));
        assert!(engine.peers().is_empty());

        engine.fail_at(Stage::LocalDescription);
        let peer = engine.create_peer().await.unwrap();
        peer.set_remote_description(SessionDescriptor::offer(OFFER))
            .await
            .unwrap();
        let answer = peer.create_answer().await.unwrap();
        assert!(matches!(
            peer.set_local_description(answer).await,
            Err(EngineError::LocalDescription(_))
        ));
    }
}
