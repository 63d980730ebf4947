//! Method table consumed by the dispatcher, and the capabilities handed to
//! each handler invocation.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::AuthInfo,
    error::TransportError,
    model::{ErrorData, JsonRpcMessage, RequestId},
    session::{SessionContext, SessionId},
};

pub type HandlerFuture = BoxFuture<'static, Result<Value, ErrorData>>;

type Handler = Arc<dyn Fn(Option<Value>, RequestContext) -> HandlerFuture + Send + Sync>;

/// Failure of a server-initiated request.
#[derive(Debug, thiserror::Error)]
pub enum PeerRequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("client answered with an error: {0}")]
    Client(ErrorData),
}

/// A handler's view of its own session.
///
/// Bound to exactly one session; it cannot reach the registry or any other
/// session.
#[derive(Clone)]
pub struct Peer {
    session: Arc<SessionContext>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("session_id", self.session.id())
            .finish()
    }
}

impl Peer {
    pub(crate) fn new(session: Arc<SessionContext>) -> Self {
        Self { session }
    }

    pub fn session_id(&self) -> &SessionId {
        self.session.id()
    }

    /// Queues a message on the session's stream. Returns `false` when it was
    /// dropped because no stream is open.
    pub async fn push(&self, message: JsonRpcMessage) -> bool {
        self.session.push(message).await
    }

    pub async fn notify(&self, method: impl Into<String>, params: Option<Value>) -> bool {
        self.push(JsonRpcMessage::notification(method, params)).await
    }

    /// Sends a request to the client over the stream and waits for its answer,
    /// which arrives later as a POSTed response.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Value, PeerRequestError> {
        let rx = self.session.send_request(method.into(), params).await?;
        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(PeerRequestError::Client(error)),
            Err(_) => Err(TransportError::SessionClosed(self.session.id().clone()).into()),
        }
    }
}

/// Everything a handler invocation gets besides its params.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// `None` for notifications.
    pub request_id: Option<RequestId>,
    pub peer: Peer,
    pub auth: Option<AuthInfo>,
    /// Fires when the client cancels this request.
    pub ct: CancellationToken,
}

impl RequestContext {
    pub fn session_id(&self) -> &SessionId {
        self.peer.session_id()
    }
}

/// Method name → handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    methods: HashMap<String, Handler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("HandlerRegistry").field("methods", &methods).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorData>> + Send + 'static,
    {
        self.register(method, handler);
        self
    }

    /// Registers a handler, replacing any previous one for the same method.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorData>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |params: Option<Value>, context: RequestContext| {
            handler(params, context).boxed()
        });
        self.methods.insert(method.into(), boxed);
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Invokes the handler for `method`. Unknown methods resolve to `-32601`.
    pub fn dispatch(&self, method: &str, params: Option<Value>, context: RequestContext) -> HandlerFuture {
        match self.methods.get(method) {
            Some(handler) => handler(params, context),
            None => {
                tracing::debug!(method, "no handler registered");
                futures::future::ready(Err(ErrorData::method_not_found(method))).boxed()
            }
        }
    }
}
