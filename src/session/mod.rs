//! Sessions: the registry, per-session context, and push channel.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::RwLock;

pub mod channel;
mod context;

pub use channel::{ChannelEvent, ChannelState, ChannelStream, ChannelWatch, StreamingChannel};
pub use context::{SessionContext, SessionState};

pub type SessionId = Arc<str>;

/// Generates a fresh, unguessable session id.
pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// Concurrent map from session id to its context.
///
/// The write lock serializes creation and removal; lookups run concurrently.
/// Calls against different sessions never contend on anything else.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionContext>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh id and inserts an uninitialized context for it.
    ///
    /// The context stays invisible to [`get`](Self::get) until it is activated.
    pub async fn create(&self) -> (SessionId, Arc<SessionContext>) {
        let mut sessions = self.sessions.write().await;
        let id = loop {
            let id = session_id();
            if !sessions.contains_key(&id) {
                break id;
            }
            tracing::warn!(session_id = %id, "session id collision, regenerating");
        };
        let context = Arc::new(SessionContext::new(id.clone()));
        sessions.insert(id.clone(), context.clone());
        tracing::debug!(session_id = %id, "session reserved");
        (id, context)
    }

    /// Looks up an active session.
    pub async fn get(&self, id: &str) -> Option<Arc<SessionContext>> {
        let context = self.sessions.read().await.get(id).cloned()?;
        context.is_active().await.then_some(context)
    }

    /// Removes a session and closes it. Idempotent.
    pub async fn remove(&self, id: &str) -> Option<Arc<SessionContext>> {
        let context = self.sessions.write().await.remove(id)?;
        context.close().await;
        tracing::debug!(session_id = %id, "session removed");
        Some(context)
    }

    /// Number of registered sessions, including reserved ones.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes and removes every session idle for longer than `max_idle`.
    /// Active sessions holding an open stream or running requests are never
    /// idle. Reservations that never finished initializing always are.
    pub async fn close_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        let candidates: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut closed = Vec::new();
        for context in candidates {
            let idle = context.idle_for().await;
            if idle.is_some_and(|idle| idle > max_idle) && self.remove(context.id()).await.is_some() {
                closed.push(context.id().clone());
            }
        }
        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "closed idle sessions");
        }
        closed
    }

    /// Closes and removes every session, for shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().map(|(_, c)| c).collect();
        let count = drained.len();
        futures::future::join_all(drained.iter().map(|context| context.close())).await;
        tracing::info!(count, "closed all sessions");
    }
}
