use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::{
    sync::{Mutex, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{
    SessionId,
    channel::{ChannelStream, ChannelWatch, StreamingChannel},
};
use crate::{
    error::TransportError,
    model::{ErrorData, JsonRpcMessage, RequestId},
};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        })
    }
}

type OutboundWaiter = oneshot::Sender<Result<Value, ErrorData>>;

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    last_activity: Instant,
    /// Client requests currently being handled, keyed by the client's id.
    in_flight: HashMap<RequestId, CancellationToken>,
    /// Server-initiated requests waiting for the client's response.
    outbound: HashMap<RequestId, OutboundWaiter>,
    channel: Option<StreamingChannel>,
}

/// Per-session state: request correlation, the optional push channel and
/// cleanup.
///
/// All mutation goes through one async mutex that is only held for the
/// individual operation, never across a handler's execution.
#[derive(Debug)]
pub struct SessionContext {
    id: SessionId,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    next_outbound_id: AtomicU64,
    dropped: AtomicU64,
}

impl SessionContext {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                last_activity: Instant::now(),
                in_flight: HashMap::new(),
                outbound: HashMap::new(),
                channel: None,
            }),
            next_outbound_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == SessionState::Active
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await == SessionState::Closed
    }

    /// `Uninitialized → Active`, once the initialize request has succeeded.
    pub(crate) async fn activate(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Closed => Err(TransportError::SessionClosed(self.id.clone())),
            _ => {
                inner.state = SessionState::Active;
                inner.last_activity = Instant::now();
                Ok(())
            }
        }
    }

    pub(crate) async fn touch(&self) {
        self.inner.lock().await.last_activity = Instant::now();
    }

    /// How long the session has been idle, or `None` when it is closed, holds
    /// an open stream, or is running requests.
    ///
    /// A reservation that never finished initializing counts as idle from the
    /// moment it was made, whatever it is still running.
    pub(crate) async fn idle_for(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        match inner.state {
            SessionState::Closed => None,
            SessionState::Uninitialized => Some(inner.last_activity.elapsed()),
            SessionState::Active => {
                let streaming = inner.channel.as_ref().is_some_and(StreamingChannel::is_open);
                (!streaming && inner.in_flight.is_empty()).then(|| inner.last_activity.elapsed())
            }
        }
    }

    /// Registers a client request as in flight and returns its cancellation
    /// token. The error is the reply to send instead of dispatching.
    pub(crate) async fn begin_request(&self, id: &RequestId) -> Result<CancellationToken, ErrorData> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(ErrorData::invalid_session("Bad Request: session is closed"));
        }
        if inner.in_flight.contains_key(id) {
            return Err(ErrorData::invalid_request(format!(
                "Invalid Request: request id {id} is already in flight"
            )));
        }
        let token = CancellationToken::new();
        inner.in_flight.insert(id.clone(), token.clone());
        Ok(token)
    }

    /// Clears an in-flight entry. Returns `false` when the session closed in
    /// the meantime, in which case the request's output must be discarded.
    pub(crate) async fn finish_request(&self, id: &RequestId) -> bool {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(id);
        inner.state != SessionState::Closed
    }

    pub(crate) async fn cancel_request(&self, id: &RequestId) -> bool {
        let inner = self.inner.lock().await;
        match inner.in_flight.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of client requests in flight plus server requests awaiting a
    /// response.
    pub async fn pending_requests(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.in_flight.len() + inner.outbound.len()
    }

    pub async fn has_open_channel(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.channel.as_ref().is_some_and(StreamingChannel::is_open)
    }

    /// Queues a message on the session's stream. Without an open stream the
    /// message is dropped and counted.
    pub async fn push(&self, message: JsonRpcMessage) -> bool {
        let inner = self.inner.lock().await;
        let delivered = match (&inner.channel, inner.state) {
            (Some(channel), SessionState::Active) => channel.push(message),
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        };
        if !delivered {
            tracing::debug!(session_id = %self.id, "no open stream, pushed message dropped");
        }
        delivered
    }

    /// Messages that could not be delivered, across the session and its stream.
    pub async fn dropped_messages(&self) -> u64 {
        let inner = self.inner.lock().await;
        let channel_drops = inner.channel.as_ref().map_or(0, StreamingChannel::dropped_count);
        self.dropped.load(Ordering::Relaxed) + channel_drops
    }

    /// Attaches a new push channel. At most one channel is ever attached; a
    /// second attempt fails without touching the first.
    pub(crate) async fn attach_channel(
        &self,
        grace_period: Duration,
    ) -> Result<(ChannelStream, ChannelWatch), TransportError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Active => {}
            SessionState::Closed => return Err(TransportError::SessionClosed(self.id.clone())),
            SessionState::Uninitialized => {
                return Err(TransportError::invalid_session("session is not initialized"));
            }
        }
        if inner.channel.is_some() {
            return Err(TransportError::ChannelAlreadyOpen(self.id.clone()));
        }
        let (channel, stream) = StreamingChannel::open(grace_period);
        let watch = channel.watch();
        inner.channel = Some(channel);
        inner.last_activity = Instant::now();
        Ok((stream, watch))
    }

    /// Sends a server-initiated request over the session's stream and returns
    /// a receiver for the client's answer.
    pub(crate) async fn send_request(
        &self,
        method: String,
        params: Option<Value>,
    ) -> Result<oneshot::Receiver<Result<Value, ErrorData>>, TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(TransportError::SessionClosed(self.id.clone()));
        }
        let Some(channel) = inner.channel.as_ref().filter(|c| c.is_open()) else {
            return Err(TransportError::StreamUnavailable(self.id.clone()));
        };

        let n = self.next_outbound_id.fetch_add(1, Ordering::Relaxed);
        let id = RequestId::String(format!("srv-{n}"));
        if !channel.push(JsonRpcMessage::request(id.clone(), method, params)) {
            return Err(TransportError::StreamUnavailable(self.id.clone()));
        }
        let (tx, rx) = oneshot::channel();
        inner.outbound.insert(id, tx);
        Ok(rx)
    }

    /// Completes a server-initiated request. Returns `false` for ids that are
    /// not pending.
    pub(crate) async fn resolve_response(
        &self,
        id: &RequestId,
        outcome: Result<Value, ErrorData>,
    ) -> bool {
        let waiter = self.inner.lock().await.outbound.remove(id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// `→ Closed`. Idempotent. Pending outbound waiters are dropped, running
    /// handlers keep going but their output is discarded, and the stream is
    /// flushed within its grace period.
    pub(crate) async fn close(&self) {
        let channel = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.in_flight.clear();
            inner.outbound.clear();
            inner.channel.take()
        };
        if let Some(mut channel) = channel {
            channel.close().await;
        }
        tracing::info!(session_id = %self.id, "session closed");
    }
}
