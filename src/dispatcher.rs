//! Per-call entry point: decides the session lifecycle action for each
//! inbound call, drives the handlers and shapes the reply.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::{FutureExt, future::join_all};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::AuthInfo,
    codec::{DecodeError, Payload},
    error::TransportError,
    handler::{HandlerRegistry, Peer, RequestContext},
    model::{
        CANCELLED_NOTIFICATION_METHOD, ErrorCode, ErrorData, JsonRpcError, JsonRpcMessage,
        JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    },
    session::{ChannelStream, SessionContext, SessionId, SessionRegistry, session_id},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Sessions are created by `initialize` and referenced by header.
    #[default]
    Stateful,
    /// Every call runs against a throwaway context; no streams, no ids.
    Stateless,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionMode::Stateful => "stateful",
            SessionMode::Stateless => "stateless",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub session_mode: SessionMode,
    /// Upper bound on how long closing a stream waits for queued messages.
    pub close_grace_period: Duration,
    /// Handler error codes that close the session once the reply is built.
    pub session_fatal_codes: Vec<ErrorCode>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            session_mode: SessionMode::Stateful,
            close_grace_period: Duration::from_secs(5),
            session_fatal_codes: Vec::new(),
        }
    }
}

/// One inbound POST, already decoded and authenticated.
#[derive(Debug)]
pub struct InboundCall {
    pub session_id: Option<SessionId>,
    pub auth: Option<AuthInfo>,
    pub payload: Payload,
}

impl InboundCall {
    pub fn new(session_id: Option<SessionId>, payload: Payload) -> Self {
        Self {
            session_id,
            auth: None,
            payload,
        }
    }

    pub fn with_auth(mut self, auth: Option<AuthInfo>) -> Self {
        self.auth = auth;
        self
    }
}

/// A buffered reply body: one envelope for a single call, an array for a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcReply {
    Single(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Buffered JSON body. `session_id` is echoed as the session header.
    Json {
        session_id: Option<SessionId>,
        body: JsonRpcReply,
    },
    /// Nothing to answer inline: notifications and responses only, or every
    /// result goes out over the session's stream.
    Accepted,
}

/// Routes inbound calls to sessions and handlers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    handlers: Arc<HandlerRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(handlers: HandlerRegistry, config: DispatcherConfig) -> Self {
        Self::with_registry(Arc::new(SessionRegistry::new()), handlers, config)
    }

    pub fn with_registry(
        registry: Arc<SessionRegistry>,
        handlers: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            handlers: Arc::new(handlers),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn mode(&self) -> SessionMode {
        self.config.session_mode
    }

    /// Handles a POST body.
    pub async fn handle_post(&self, call: InboundCall) -> Result<Reply, TransportError> {
        let InboundCall {
            session_id,
            auth,
            payload,
        } = call;
        match (self.config.session_mode, session_id) {
            (SessionMode::Stateless, _) => self.handle_stateless(auth, payload).await,
            (SessionMode::Stateful, None) => self.handle_initialize(auth, payload).await,
            (SessionMode::Stateful, Some(id)) => self.handle_in_session(id, auth, payload).await,
        }
    }

    /// Attaches a push stream to an existing session.
    ///
    /// When the returned stream is dropped before it finished, the client is
    /// gone and the session is removed.
    pub async fn open_stream(&self, session_id: Option<&str>) -> Result<ChannelStream, TransportError> {
        let session = self.resolve(session_id).await?;
        let (stream, watch) = session
            .attach_channel(self.config.close_grace_period)
            .await?;

        let registry = self.registry.clone();
        let id = session.id().clone();
        tokio::spawn(async move {
            if watch.disconnected().await {
                tracing::info!(session_id = %id, "stream disconnected, closing session");
                registry.remove(&id).await;
            }
        });
        tracing::debug!(session_id = %session.id(), "stream opened");
        Ok(stream)
    }

    /// Explicit termination.
    pub async fn terminate(&self, session_id: Option<&str>) -> Result<(), TransportError> {
        let session = self.resolve(session_id).await?;
        self.registry.remove(session.id()).await;
        tracing::info!(session_id = %session.id(), "session terminated by client");
        Ok(())
    }

    /// Pushes a message to a session's stream from outside any handler.
    pub async fn push(&self, session_id: &str, message: JsonRpcMessage) -> Result<bool, TransportError> {
        let session = self.resolve(Some(session_id)).await?;
        Ok(session.push(message).await)
    }

    async fn resolve(&self, session_id: Option<&str>) -> Result<Arc<SessionContext>, TransportError> {
        if self.config.session_mode == SessionMode::Stateless {
            return Err(TransportError::Unsupported(SessionMode::Stateless));
        }
        let id = session_id.ok_or_else(|| TransportError::invalid_session("missing session id"))?;
        match self.registry.get(id).await {
            Some(session) => Ok(session),
            None => {
                tracing::warn!(session_id = %id, "unknown session id");
                Err(TransportError::invalid_session("unknown session id"))
            }
        }
    }

    async fn handle_initialize(
        &self,
        auth: Option<AuthInfo>,
        payload: Payload,
    ) -> Result<Reply, TransportError> {
        let request = match payload {
            Payload::Single(JsonRpcMessage::Request(request))
                if request.method == crate::model::INITIALIZE_METHOD =>
            {
                request
            }
            Payload::Batch(_) => {
                tracing::warn!("batch received without a session id");
                return Err(TransportError::invalid_session(
                    "a batch cannot initialize a session",
                ));
            }
            Payload::Single(message) => {
                tracing::warn!(method = ?message.method(), "non-initialize call without a session id");
                return Err(TransportError::invalid_session("missing session id"));
            }
        };

        let (id, session) = self.registry.create().await;
        let reservation = Reservation::new(self.registry.clone(), id.clone());

        // Runs detached so a dropped POST cannot strand the in-flight entry.
        let this = self.clone();
        let reply = tokio::spawn(async move {
            let reply = this.process_request(&session, auth, request).await;
            if matches!(reply, Some(JsonRpcMessage::Response(_))) {
                session.activate().await?;
            }
            Ok::<_, TransportError>(reply)
        })
        .await
        .map_err(|e| TransportError::Internal(e.to_string()))??;

        match reply {
            Some(reply @ JsonRpcMessage::Response(_)) => {
                let id = reservation.keep();
                tracing::info!(session_id = %id, "session initialized");
                Ok(Reply::Json {
                    session_id: Some(id),
                    body: JsonRpcReply::Single(reply),
                })
            }
            Some(reply) => {
                tracing::debug!(session_id = %id, "initialize failed, releasing reserved session");
                reservation.release().await;
                Ok(Reply::Json {
                    session_id: None,
                    body: JsonRpcReply::Single(reply),
                })
            }
            None => {
                reservation.release().await;
                Err(TransportError::SessionClosed(id))
            }
        }
    }

    async fn handle_in_session(
        &self,
        id: SessionId,
        auth: Option<AuthInfo>,
        payload: Payload,
    ) -> Result<Reply, TransportError> {
        let session = self.resolve(Some(&*id)).await?;
        session.touch().await;
        let is_batch = payload.is_batch();
        let items = payload.into_items();

        if session.has_open_channel().await {
            let this = self.clone();
            tokio::spawn(async move {
                let session = &session;
                join_all(items.into_iter().map(|item| {
                    let auth = auth.clone();
                    let this = &this;
                    async move {
                        let Some(output) = this.process_item(session, auth, item).await else {
                            return;
                        };
                        let fatal = this.is_session_fatal(&output);
                        session.push(output).await;
                        if fatal {
                            this.close_fatal(session).await;
                        }
                    }
                }))
                .await;
            });
            return Ok(Reply::Accepted);
        }

        // Buffered work is detached too: if the client goes away mid-call the
        // handlers still finish, clear their in-flight entries, and the
        // outputs are dropped.
        let this = self.clone();
        let (outputs, closed) = tokio::spawn(async move {
            let session = &session;
            let outputs = join_all(
                items
                    .into_iter()
                    .map(|item| this.process_item(session, auth.clone(), item)),
            )
            .await;
            if session.is_closed().await {
                return (Vec::new(), true);
            }
            let outputs: Vec<_> = outputs.into_iter().flatten().collect();
            if outputs.iter().any(|output| this.is_session_fatal(output)) {
                this.close_fatal(session).await;
            }
            (outputs, false)
        })
        .await
        .map_err(|e| TransportError::Internal(e.to_string()))?;

        if closed {
            tracing::debug!(session_id = %id, "session closed during the call, discarding outputs");
            return Err(TransportError::SessionClosed(id));
        }
        Ok(build_reply(Some(id), is_batch, outputs))
    }

    async fn handle_stateless(
        &self,
        auth: Option<AuthInfo>,
        payload: Payload,
    ) -> Result<Reply, TransportError> {
        let session = Arc::new(SessionContext::new(session_id()));
        session.activate().await?;
        let is_batch = payload.is_batch();

        let outputs = join_all(
            payload
                .into_items()
                .into_iter()
                .map(|item| self.process_item(&session, auth.clone(), item)),
        )
        .await;
        session.close().await;

        Ok(build_reply(
            None,
            is_batch,
            outputs.into_iter().flatten().collect(),
        ))
    }

    /// Handles one envelope. Returns the output to send back, if any.
    async fn process_item(
        &self,
        session: &Arc<SessionContext>,
        auth: Option<AuthInfo>,
        item: Result<JsonRpcMessage, DecodeError>,
    ) -> Option<JsonRpcMessage> {
        match item {
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "rejected envelope");
                Some(e.to_message())
            }
            Ok(JsonRpcMessage::Request(request)) => {
                self.process_request(session, auth, request).await
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                self.process_notification(session, auth, notification).await;
                None
            }
            Ok(JsonRpcMessage::Response(JsonRpcResponse { id, result, .. })) => {
                self.resolve_outbound(session, &id, Ok(result)).await;
                None
            }
            Ok(JsonRpcMessage::Error(JsonRpcError { id, error, .. })) => {
                match id {
                    Some(id) => self.resolve_outbound(session, &id, Err(error)).await,
                    None => {
                        tracing::warn!(session_id = %session.id(), %error, "client reported an error without id");
                    }
                }
                None
            }
        }
    }

    async fn process_request(
        &self,
        session: &Arc<SessionContext>,
        auth: Option<AuthInfo>,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcMessage> {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let ct = match session.begin_request(&id).await {
            Ok(ct) => ct,
            Err(error) => return Some(JsonRpcMessage::error(Some(id), error)),
        };
        tracing::debug!(session_id = %session.id(), request_id = %id, method = %method, "dispatching request");

        let context = RequestContext {
            request_id: Some(id.clone()),
            peer: Peer::new(session.clone()),
            auth,
            ct: ct.clone(),
        };
        let handler =
            AssertUnwindSafe(async { self.handlers.dispatch(&method, params, context).await })
                .catch_unwind();

        let outcome = tokio::select! {
            result = handler => match result {
                Ok(outcome) => outcome,
                Err(panic) => {
                    tracing::error!(
                        session_id = %session.id(),
                        request_id = %id,
                        method = %method,
                        panic = panic_message(&*panic),
                        "handler panicked"
                    );
                    Err(ErrorData::internal_error("Internal error", None))
                }
            },
            _ = ct.cancelled() => {
                tracing::debug!(session_id = %session.id(), request_id = %id, "request cancelled");
                Err(ErrorData::request_cancelled())
            }
        };

        if !session.finish_request(&id).await {
            tracing::debug!(session_id = %session.id(), request_id = %id, "session closed, output discarded");
            return None;
        }
        Some(JsonRpcMessage::reply(id, outcome))
    }

    async fn process_notification(
        &self,
        session: &Arc<SessionContext>,
        auth: Option<AuthInfo>,
        notification: JsonRpcNotification,
    ) {
        let JsonRpcNotification { method, params, .. } = notification;
        if method == CANCELLED_NOTIFICATION_METHOD {
            let target = params
                .as_ref()
                .and_then(|p| p.get("requestId"))
                .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
            match target {
                Some(id) if session.cancel_request(&id).await => {}
                Some(id) => {
                    tracing::debug!(session_id = %session.id(), request_id = %id, "cancel for a request not in flight");
                }
                None => tracing::warn!(session_id = %session.id(), "cancel notification without requestId"),
            }
            return;
        }
        if !self.handlers.contains(&method) {
            tracing::debug!(session_id = %session.id(), method = %method, "ignoring unhandled notification");
            return;
        }

        let context = RequestContext {
            request_id: None,
            peer: Peer::new(session.clone()),
            auth,
            ct: CancellationToken::new(),
        };
        let result = AssertUnwindSafe(async { self.handlers.dispatch(&method, params, context).await })
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::debug!(session_id = %session.id(), method = %method, %error, "notification handler failed");
            }
            Err(panic) => {
                tracing::error!(
                    session_id = %session.id(),
                    method = %method,
                    panic = panic_message(&*panic),
                    "notification handler panicked"
                );
            }
        }
    }

    async fn resolve_outbound(
        &self,
        session: &SessionContext,
        id: &RequestId,
        outcome: Result<serde_json::Value, ErrorData>,
    ) {
        if !session.resolve_response(id, outcome).await {
            tracing::debug!(session_id = %session.id(), request_id = %id, "dropping unmatched response");
        }
    }

    fn is_session_fatal(&self, output: &JsonRpcMessage) -> bool {
        output
            .error_code()
            .is_some_and(|code| self.config.session_fatal_codes.contains(&code))
    }

    async fn close_fatal(&self, session: &SessionContext) {
        tracing::warn!(session_id = %session.id(), "session-fatal error, closing session");
        if self.config.session_mode == SessionMode::Stateful {
            self.registry.remove(session.id()).await;
        } else {
            session.close().await;
        }
    }
}

/// A session reserved for an `initialize` call that has not answered yet.
///
/// Dropping it without [`keep`](Self::keep) removes the reservation, so a
/// client that disconnects mid-initialize leaves nothing in the registry.
struct Reservation {
    registry: Arc<SessionRegistry>,
    id: SessionId,
    armed: bool,
}

impl Reservation {
    fn new(registry: Arc<SessionRegistry>, id: SessionId) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    fn keep(mut self) -> SessionId {
        self.armed = false;
        self.id.clone()
    }

    async fn release(mut self) {
        self.armed = false;
        self.registry.remove(&self.id).await;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = self.registry.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(session_id = %id, "initialize abandoned, releasing reserved session");
                handle.spawn(async move {
                    registry.remove(&id).await;
                });
            }
            Err(_) => tracing::warn!(session_id = %id, "no runtime to release reserved session"),
        }
    }
}

fn build_reply(session_id: Option<SessionId>, is_batch: bool, mut outputs: Vec<JsonRpcMessage>) -> Reply {
    let body = match (is_batch, outputs.len()) {
        (_, 0) => return Reply::Accepted,
        (false, _) => match outputs.pop() {
            Some(output) => JsonRpcReply::Single(output),
            None => return Reply::Accepted,
        },
        (true, _) => JsonRpcReply::Batch(outputs),
    };
    Reply::Json { session_id, body }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::StreamExt;
    use serde_json::{Value, json};

    use super::*;
    use crate::codec::decode;

    const FATAL: ErrorCode = ErrorCode(-32050);

    fn handlers() -> HandlerRegistry {
        HandlerRegistry::new()
            .with_method("initialize", |_, _| async {
                Ok(json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "test", "version": "0.0.0"}
                }))
            })
            .with_method("tools/call", |params, _| async move {
                let message = params
                    .as_ref()
                    .and_then(|p| p.pointer("/arguments/message"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| ErrorData::invalid_params("missing message", None))?;
                Ok(json!({"content": [{"type": "text", "text": format!("Echo: {message}")}]}))
            })
            .with_method("slow", |params, _| async move {
                let ms = params
                    .as_ref()
                    .and_then(|p| p.get("ms"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"slept": ms}))
            })
            .with_method("fail", |_, _| async {
                Err(ErrorData::new(ErrorCode(-32001), "domain failure", None))
            })
            .with_method("fatal", |_, _| async { Err(ErrorData::new(FATAL, "fatal", None)) })
            .with_method("boom", |_, _| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(Value::Null)
            })
            .with_method("ask", |_, ctx| async move {
                ctx.peer
                    .request("roots/list", None)
                    .await
                    .map_err(|e| ErrorData::internal_error(e.to_string(), None))
            })
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            handlers(),
            DispatcherConfig {
                session_fatal_codes: vec![FATAL],
                close_grace_period: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    fn call(session_id: Option<&SessionId>, body: Value) -> InboundCall {
        let payload = decode(body.to_string().as_bytes()).expect("test payload decodes");
        InboundCall::new(session_id.cloned(), payload)
    }

    fn initialize_body() -> Value {
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})
    }

    async fn initialize(dispatcher: &Dispatcher) -> SessionId {
        match dispatcher.handle_post(call(None, initialize_body())).await {
            Ok(Reply::Json {
                session_id: Some(id),
                ..
            }) => id,
            other => panic!("initialize failed: {other:?}"),
        }
    }

    fn body(reply: Reply) -> Value {
        match reply {
            Reply::Json { body, .. } => serde_json::to_value(body).unwrap(),
            Reply::Accepted => panic!("expected a JSON reply"),
        }
    }

    #[tokio::test]
    async fn test_initialize_then_echo() {
        let dispatcher = dispatcher();

        let reply = dispatcher
            .handle_post(call(None, initialize_body()))
            .await
            .unwrap();
        let Reply::Json {
            session_id: Some(id),
            body: init,
        } = reply
        else {
            panic!("expected a session header");
        };
        let init = serde_json::to_value(init).unwrap();
        assert_eq!(init["jsonrpc"], "2.0");
        assert_eq!(init["id"], 1);
        assert!(init["result"].is_object());

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({
                    "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                    "params": {"name": "echo", "arguments": {"message": "hi"}}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(
            body(reply),
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {"content": [{"type": "text", "text": "Echo: hi"}]}
            })
        );
    }

    #[tokio::test]
    async fn test_non_initialize_without_session_never_reaches_handler() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().with_method("tools/list", move |_, _| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
            DispatcherConfig::default(),
        );

        let result = dispatcher
            .handle_post(call(
                None,
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            ))
            .await;

        assert!(matches!(result, Err(TransportError::InvalidSession(_))));
        assert!(!invoked.load(Ordering::SeqCst));
        assert!(dispatcher.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_batch_without_session_is_rejected() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .handle_post(call(None, json!([initialize_body()])))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidSession(_))));
    }

    #[tokio::test]
    async fn test_concurrent_initializes_get_distinct_sessions() {
        let dispatcher = dispatcher();
        let (a, b) = tokio::join!(initialize(&dispatcher), initialize(&dispatcher));

        assert_ne!(a, b);
        assert!(dispatcher.registry().get(&a).await.is_some());
        assert!(dispatcher.registry().get(&b).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_initialize_releases_reservation() {
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().with_method("initialize", |_, _| async {
                Err(ErrorData::invalid_params("unsupported protocol version", None))
            }),
            DispatcherConfig::default(),
        );

        let reply = dispatcher
            .handle_post(call(None, initialize_body()))
            .await
            .unwrap();

        let Reply::Json { session_id, body } = reply else {
            panic!("expected an error body");
        };
        assert!(session_id.is_none());
        assert_eq!(
            serde_json::to_value(body).unwrap()["error"]["code"],
            ErrorCode::INVALID_PARAMS.0
        );
        assert!(dispatcher.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_initialize_leaves_no_reservation() {
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().with_method("initialize", |_, _| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({"capabilities": {}}))
            }),
            DispatcherConfig::default(),
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            dispatcher.handle_post(call(None, initialize_body())),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dispatcher.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_still_clears_its_request() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;
        let session = dispatcher.registry().get(&id).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            dispatcher.handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "id": 7, "method": "slow", "params": {"ms": 50}}),
            )),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.pending_requests().await, 0);

        // The id is free again.
        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "id": 7, "method": "slow"}),
            ))
            .await
            .unwrap();
        assert_eq!(body(reply)["result"]["slept"], 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(dispatcher.registry().close_idle(Duration::ZERO).await, vec![id]);
    }

    #[tokio::test]
    async fn test_unmatched_responses_are_dropped() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "id": "srv-99", "result": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Accepted);

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32603, "message": "oops"}}),
            ))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Accepted);

        let session = dispatcher.registry().get(&id).await.expect("still active");
        assert_eq!(session.pending_requests().await, 0);
        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({
                    "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                    "params": {"name": "echo", "arguments": {"message": "after"}}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(body(reply)["result"]["content"][0]["text"], "Echo: after");
    }

    #[tokio::test]
    async fn test_batch_keeps_input_order_with_failures() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!([
                    {"jsonrpc": "2.0", "id": "a", "method": "slow", "params": {"ms": 40}},
                    {"jsonrpc": "2.0", "id": "b", "method": "fail"},
                    {"jsonrpc": "2.0", "method": "notifications/progress"},
                    {"jsonrpc": "2.0", "id": "c", "method": "slow", "params": {"ms": 0}},
                    {"jsonrpc": "2.0", "id": "d", "method": "nope"},
                ]),
            ))
            .await
            .unwrap();

        let body = body(reply);
        let entries = body.as_array().expect("batch reply is an array");
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["id"], "a");
        assert_eq!(entries[0]["result"]["slept"], 40);
        assert_eq!(entries[1]["id"], "b");
        assert_eq!(entries[1]["error"]["code"], -32001);
        assert_eq!(entries[2]["id"], "c");
        assert_eq!(entries[3]["error"]["code"], ErrorCode::METHOD_NOT_FOUND.0);
    }

    #[tokio::test]
    async fn test_malformed_batch_element_only_fails_itself() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!([
                    {"jsonrpc": "1.0", "id": 1, "method": "slow"},
                    {"jsonrpc": "2.0", "id": 2, "method": "slow"},
                ]),
            ))
            .await
            .unwrap();

        let body = body(reply);
        assert_eq!(body[0]["id"], 1);
        assert_eq!(body[0]["error"]["code"], ErrorCode::INVALID_PARAMS.0);
        assert_eq!(body[1]["result"]["slept"], 0);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_is_invalid_request() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!([
                    {"jsonrpc": "2.0", "id": 5, "method": "slow", "params": {"ms": 20}},
                    {"jsonrpc": "2.0", "id": 5, "method": "slow"},
                ]),
            ))
            .await
            .unwrap();

        let body = body(reply);
        assert_eq!(body[0]["result"]["slept"], 20);
        assert_eq!(body[1]["error"]["code"], ErrorCode::INVALID_REQUEST.0);
    }

    #[tokio::test]
    async fn test_notifications_only_are_accepted() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            ))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Accepted);
    }

    #[tokio::test]
    async fn test_terminated_session_is_invalid() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        dispatcher.terminate(Some(&*id)).await.unwrap();

        assert!(dispatcher.registry().get(&id).await.is_none());
        let result = dispatcher
            .handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "id": 3, "method": "slow"}),
            ))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidSession(_))));
        assert!(matches!(
            dispatcher.terminate(Some(&*id)).await,
            Err(TransportError::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_open_stream_requires_known_session() {
        let dispatcher = dispatcher();
        assert!(matches!(
            dispatcher.open_stream(None).await,
            Err(TransportError::InvalidSession(_))
        ));
        assert!(matches!(
            dispatcher.open_stream(Some("not-a-session")).await,
            Err(TransportError::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_second_stream_is_rejected() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        let _first = dispatcher.open_stream(Some(&*id)).await.unwrap();
        let second = dispatcher.open_stream(Some(&*id)).await;

        assert!(matches!(second, Err(TransportError::ChannelAlreadyOpen(_))));
        assert!(dispatcher.registry().get(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_results_are_pushed_when_stream_is_open() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;
        let mut stream = dispatcher.open_stream(Some(&*id)).await.unwrap();

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({
                    "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                    "params": {"name": "echo", "arguments": {"message": "hi"}}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Accepted);

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("result pushed in time")
            .expect("stream still open");
        assert_eq!(event.message.id(), Some(&RequestId::from(2)));
        assert_eq!(
            serde_json::to_value(&event.message).unwrap()["result"]["content"][0]["text"],
            "Echo: hi"
        );
    }

    #[tokio::test]
    async fn test_server_request_is_answered_by_posted_response() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;
        let mut stream = dispatcher.open_stream(Some(&*id)).await.unwrap();

        dispatcher
            .handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "id": 10, "method": "ask"}),
            ))
            .await
            .unwrap();

        let outbound = stream.next().await.expect("server request pushed");
        assert_eq!(outbound.message.method(), Some("roots/list"));
        let server_id = outbound.message.id().cloned().unwrap();

        dispatcher
            .handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "id": server_id, "result": {"roots": []}}),
            ))
            .await
            .unwrap();

        let answer = stream.next().await.expect("handler result pushed");
        assert_eq!(answer.message.id(), Some(&RequestId::from(10)));
        assert_eq!(
            serde_json::to_value(&answer.message).unwrap()["result"],
            json!({"roots": []})
        );
    }

    #[tokio::test]
    async fn test_dropped_stream_closes_session() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;
        let session = dispatcher.registry().get(&id).await.unwrap();

        let stream = dispatcher.open_stream(Some(&*id)).await.unwrap();
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), async {
            while dispatcher.registry().get(&id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session removed after disconnect");
        assert!(session.is_closed().await);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_only_its_envelope() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "boom"},
                    {"jsonrpc": "2.0", "id": 2, "method": "slow"},
                ]),
            ))
            .await
            .unwrap();

        let body = body(reply);
        assert_eq!(body[0]["error"]["code"], ErrorCode::INTERNAL_ERROR.0);
        assert_eq!(body[1]["result"]["slept"], 0);
        let session = dispatcher.registry().get(&id).await.expect("still active");
        assert_eq!(session.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_replies_with_cancel_error() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;
        let session = dispatcher.registry().get(&id).await.unwrap();

        let pending = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let id = id.clone();
            async move {
                dispatcher
                    .handle_post(call(
                        Some(&id),
                        json!({"jsonrpc": "2.0", "id": 7, "method": "slow", "params": {"ms": 10_000}}),
                    ))
                    .await
            }
        });
        while session.pending_requests().await == 0 {
            tokio::task::yield_now().await;
        }

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/cancelled",
                    "params": {"requestId": 7}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Accepted);

        let reply = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("cancelled promptly")
            .unwrap()
            .unwrap();
        assert_eq!(body(reply)["error"]["code"], ErrorCode::REQUEST_CANCELLED.0);
    }

    #[tokio::test]
    async fn test_session_fatal_code_closes_after_reply() {
        let dispatcher = dispatcher();
        let id = initialize(&dispatcher).await;

        let reply = dispatcher
            .handle_post(call(
                Some(&id),
                json!({"jsonrpc": "2.0", "id": 1, "method": "fatal"}),
            ))
            .await
            .unwrap();

        assert_eq!(body(reply)["error"]["code"], FATAL.0);
        assert!(dispatcher.registry().get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_stateless_mode_needs_no_session() {
        let dispatcher = Dispatcher::new(
            handlers(),
            DispatcherConfig {
                session_mode: SessionMode::Stateless,
                ..Default::default()
            },
        );

        let reply = dispatcher
            .handle_post(call(
                None,
                json!({
                    "jsonrpc": "2.0", "id": "x", "method": "tools/call",
                    "params": {"name": "echo", "arguments": {"message": "hi"}}
                }),
            ))
            .await
            .unwrap();

        let Reply::Json { session_id, body } = reply else {
            panic!("expected a JSON reply");
        };
        assert!(session_id.is_none());
        assert_eq!(serde_json::to_value(body).unwrap()["id"], "x");
        assert!(dispatcher.registry().is_empty().await);
        assert!(matches!(
            dispatcher.open_stream(None).await,
            Err(TransportError::Unsupported(SessionMode::Stateless))
        ));
    }
}
