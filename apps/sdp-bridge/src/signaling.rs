use std::sync::Arc;
use std::time::Duration;

use rtc_engine::{DataChannel, PeerContext, SessionDescriptor, TransportEngine};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, ChannelSession};
use crate::error::NegotiateError;
use crate::metrics;
use crate::registry::{Connection, ConnectionRegistry};

/// Offer/answer progress for one connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    New,
    EngineReady,
    RemoteSet,
    AnswerCreated,
    LocalSet,
    Ready,
}

impl HandshakeState {
    pub fn next(self) -> Option<Self> {
        match self {
            HandshakeState::New => Some(HandshakeState::EngineReady),
            HandshakeState::EngineReady => Some(HandshakeState::RemoteSet),
            HandshakeState::RemoteSet => Some(HandshakeState::AnswerCreated),
            HandshakeState::AnswerCreated => Some(HandshakeState::LocalSet),
            HandshakeState::LocalSet => Some(HandshakeState::Ready),
            HandshakeState::Ready => None,
        }
    }
}

/// Wire body of `POST /sdp`, both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

pub fn decode_offer(body: &[u8]) -> Result<SessionDescriptor, NegotiateError> {
    let payload: SdpPayload =
        serde_json::from_slice(body).map_err(|err| NegotiateError::Decode(err.to_string()))?;
    Ok(SessionDescriptor::offer(payload.sdp))
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub gathering_timeout: Duration,
    pub channel: ChannelConfig,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            gathering_timeout: Duration::from_secs(10),
            channel: ChannelConfig::default(),
        }
    }
}

pub struct SignalingHandler {
    engine: Arc<dyn TransportEngine>,
    config: SignalingConfig,
    registry: ConnectionRegistry,
    shutdown: CancellationToken,
}

impl SignalingHandler {
    pub fn new(
        engine: Arc<dyn TransportEngine>,
        config: SignalingConfig,
        registry: ConnectionRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            config,
            registry,
            shutdown,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    /// Runs one offer/answer exchange and returns the finalized local answer.
    ///
    /// On failure the peer is closed before returning; nothing from a failed
    /// handshake outlives the call.
    pub async fn negotiate(
        &self,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, NegotiateError> {
        if self.shutdown.is_cancelled() {
            return Err(NegotiateError::ShuttingDown);
        }

        let peer = match self.engine.create_peer().await {
            Ok(peer) => peer,
            Err(err) => {
                metrics::HANDSHAKES.with_label_values(&["engine_init"]).inc();
                warn!(error = %err, "failed to create peer connection");
                return Err(NegotiateError::EngineInit(err));
            }
        };
        let connection = Arc::new(Connection::new(peer, self.shutdown.child_token()));
        connection.advance(HandshakeState::EngineReady);

        // Subscribe before the remote description lands so no channel is missed.
        match connection.peer().data_channels() {
            Some(channels) => self.spawn_channel_acceptor(connection.clone(), channels),
            None => warn!(connection = %connection.id(), "data channel stream already claimed"),
        }

        // Closes the peer if the caller drops this future mid-handshake.
        let guard = AbandonGuard::new(connection.clone());
        match self.drive(&connection, offer).await {
            Ok(answer) => {
                self.registry.insert(connection.clone()).await;
                guard.disarm();
                metrics::HANDSHAKES.with_label_values(&["ok"]).inc();
                info!(connection = %connection.id(), "handshake complete; answer ready");
                self.spawn_connection_watcher(connection);
                Ok(answer)
            }
            Err(err) => {
                metrics::HANDSHAKES.with_label_values(&[err.kind()]).inc();
                warn!(
                    connection = %connection.id(),
                    state = ?connection.handshake_state(),
                    error = %err,
                    "handshake failed"
                );
                connection.close().await;
                guard.disarm();
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        connection: &Connection,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, NegotiateError> {
        let peer = connection.peer();

        peer.set_remote_description(offer)
            .await
            .map_err(NegotiateError::InvalidRemoteDescription)?;
        connection.advance(HandshakeState::RemoteSet);

        let answer = peer
            .create_answer()
            .await
            .map_err(NegotiateError::AnswerGeneration)?;
        connection.advance(HandshakeState::AnswerCreated);

        let gathered = peer.gathering_complete().await;
        peer.set_local_description(answer)
            .await
            .map_err(NegotiateError::LocalDescription)?;
        connection.advance(HandshakeState::LocalSet);

        let timeout = self.config.gathering_timeout;
        tokio::select! {
            _ = self.shutdown.cancelled() => return Err(NegotiateError::ShuttingDown),
            waited = tokio::time::timeout(timeout, gathered.wait()) => {
                waited.map_err(|_| NegotiateError::GatheringTimeout(timeout))?;
            }
        }

        let local = peer
            .local_description()
            .await
            .ok_or(NegotiateError::MissingLocalDescription)?;
        connection.advance(HandshakeState::Ready);
        Ok(local)
    }

    fn spawn_channel_acceptor(
        &self,
        connection: Arc<Connection>,
        mut channels: mpsc::UnboundedReceiver<Arc<dyn DataChannel>>,
    ) {
        let config = self.config.channel.clone();
        tokio::spawn(async move {
            loop {
                let channel = tokio::select! {
                    _ = connection.token().cancelled() => break,
                    next = channels.recv() => match next {
                        Some(channel) => channel,
                        None => break,
                    },
                };
                info!(
                    connection = %connection.id(),
                    label = %channel.label(),
                    id = channel.id(),
                    "new data channel"
                );
                let session =
                    ChannelSession::spawn(channel, config.clone(), connection.token().child_token());
                connection.attach(session);
            }
            debug!(connection = %connection.id(), "channel acceptor stopped");
        });
    }

    /// Drops the connection from the registry once the engine reports a
    /// terminal state or the process shuts down.
    fn spawn_connection_watcher(&self, connection: Arc<Connection>) {
        let registry = self.registry.clone();
        let mut state = connection.peer().state();
        tokio::spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                if current.is_terminal() {
                    info!(connection = %connection.id(), state = ?current, "peer connection ended");
                    break;
                }
                tokio::select! {
                    _ = connection.token().cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            registry.remove(&connection.id()).await;
            connection.close().await;
        });
    }
}

/// Armed while a handshake is in flight. Dropping it armed cancels the
/// connection's tasks and closes the peer in the background.
struct AbandonGuard {
    connection: Option<Arc<Connection>>,
}

impl AbandonGuard {
    fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    fn disarm(mut self) {
        self.connection = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        connection.token().cancel();
        metrics::HANDSHAKES.with_label_values(&["abandoned"]).inc();
        warn!(
            connection = %connection.id(),
            state = ?connection.handshake_state(),
            "handshake abandoned by caller; closing peer"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { connection.close().await });
            }
            Err(_) => warn!(connection = %connection.id(), "no runtime to close abandoned peer"),
        }
    }
}
