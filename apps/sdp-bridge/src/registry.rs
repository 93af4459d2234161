use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rtc_engine::PeerContext;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::ChannelSession;
use crate::metrics;
use crate::signaling::HandshakeState;

/// One peer connection and everything hanging off it.
pub struct Connection {
    id: Uuid,
    peer: Arc<dyn PeerContext>,
    state: Mutex<HandshakeState>,
    sessions: Mutex<Vec<ChannelSession>>,
    token: CancellationToken,
}

impl Connection {
    pub fn new(peer: Arc<dyn PeerContext>, token: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            state: Mutex::new(HandshakeState::New),
            sessions: Mutex::new(Vec::new()),
            token,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &Arc<dyn PeerContext> {
        &self.peer
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn handshake_state(&self) -> HandshakeState {
        *self.state.lock()
    }

    /// Moves the handshake one step forward. Steps are strictly sequential.
    pub fn advance(&self, next: HandshakeState) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.next(), Some(next), "handshake skipped a step");
        debug!(connection = %self.id, from = ?*state, to = ?next, "handshake advanced");
        *state = next;
    }

    pub fn attach(&self, session: ChannelSession) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|existing| !existing.is_finished());
        sessions.push(session);
    }

    /// Channel sessions that are still running.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|session| !session.is_finished())
            .count()
    }

    /// Stops every task tied to this connection and closes the peer.
    pub async fn close(&self) {
        self.token.cancel();
        if let Err(err) = self.peer.close().await {
            warn!(connection = %self.id, error = %err, "failed to close peer connection");
        }
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, connection: Arc<Connection>) {
        let mut guard = self.inner.write().await;
        guard.insert(connection.id(), connection);
        metrics::ACTIVE_CONNECTIONS.set(guard.len() as i64);
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Connection>> {
        let mut guard = self.inner.write().await;
        let removed = guard.remove(id);
        metrics::ACTIVE_CONNECTIONS.set(guard.len() as i64);
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut guard = self.inner.write().await;
            guard.drain().map(|(_, connection)| connection).collect()
        };
        metrics::ACTIVE_CONNECTIONS.set(0);
        for connection in drained {
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtc_engine::{MemoryEngine, TransportEngine};

    async fn connection(engine: &MemoryEngine) -> Arc<Connection> {
        let peer = engine.create_peer().await.expect("peer");
        Arc::new(Connection::new(peer, CancellationToken::new()))
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let engine = MemoryEngine::new();
        let registry = ConnectionRegistry::new();
        let conn = connection(&engine).await;
        let id = conn.id();
        registry.insert(conn).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&id).await.is_some());
        assert!(registry.remove(&id).await.is_some());
        assert!(registry.remove(&id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn close_all_closes_every_peer() {
        let engine = MemoryEngine::new();
        let registry = ConnectionRegistry::new();
        let first = connection(&engine).await;
        let second = connection(&engine).await;
        let token = first.token().clone();
        registry.insert(first).await;
        registry.insert(second).await;

        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert!(token.is_cancelled());
        assert!(engine.peers().iter().all(|peer| peer.is_closed()));
    }

    #[tokio::test]
    async fn handshake_advances_in_order() {
        let engine = MemoryEngine::new();
        let conn = connection(&engine).await;
        for step in [
            HandshakeState::EngineReady,
            HandshakeState::RemoteSet,
            HandshakeState::AnswerCreated,
            HandshakeState::LocalSet,
            HandshakeState::Ready,
        ] {
            conn.advance(step);
            assert_eq!(conn.handshake_state(), step);
        }
        assert_eq!(conn.handshake_state().next(), None);
    }
}
