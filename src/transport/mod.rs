//! HTTP-facing transport abstraction and its actix-web binding.
//!
//! [`Transport`] is the capability set an HTTP binding needs from the core:
//! decode a body, dispatch a call, push to a session, open and close session
//! streams. [`Dispatcher`] is the one implementation; the binding in
//! [`streamable_http_server`] is generic over the trait so tests can swap in
//! their own.
//!
//! ## Endpoints
//!
//! Mounted through [`StreamableHttpService::scope`](crate::StreamableHttpService::scope):
//!
//! - `POST` with a JSON-RPC body (single or batch), creating a session when it
//!   carries an `initialize` request and no `mcp-session-id` header
//! - `GET` with `mcp-session-id` opens the session's SSE stream
//! - `DELETE` with `mcp-session-id` terminates the session
//! - `GET /health` reports liveness without touching any session
//!
//! ## Example
//!
//! ```rust,no_run
//! use actix_web::{App, HttpServer, web};
//! use mcp_session_http::{Dispatcher, DispatcherConfig, HandlerRegistry, StreamableHttpService};
//! use serde_json::json;
//! use std::{sync::Arc, time::Duration};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let handlers = HandlerRegistry::new()
//!         .with_method("initialize", |_, _| async { Ok(json!({"capabilities": {}})) });
//!     let dispatcher = Arc::new(Dispatcher::new(handlers, DispatcherConfig::default()));
//!
//!     HttpServer::new(move || {
//!         let http_service = StreamableHttpService::builder()
//!             .transport(dispatcher.clone())
//!             .sse_keep_alive(Duration::from_secs(30))
//!             .build();
//!
//!         App::new().service(web::scope("/api/v1/mcp").service(http_service.scope()))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```

use std::future::Future;

use crate::{
    codec::{self, DecodeError, Payload},
    dispatcher::{Dispatcher, InboundCall, Reply, SessionMode},
    error::TransportError,
    model::JsonRpcMessage,
    session::ChannelStream,
};

#[cfg(feature = "transport-streamable-http")]
pub mod oauth_metadata;
/// Streamable HTTP transport implementation.
///
/// Binds a [`Transport`] to actix-web routes.
#[cfg(feature = "transport-streamable-http")]
pub mod streamable_http_server;
#[cfg(feature = "transport-streamable-http")]
pub use streamable_http_server::{StreamableHttpService, StreamableHttpServiceBuilder};

/// Core operations behind the HTTP endpoints.
pub trait Transport: Send + Sync + 'static {
    fn mode(&self) -> SessionMode;

    fn decode(&self, body: &[u8]) -> Result<Payload, DecodeError> {
        codec::decode(body)
    }

    /// Handles one decoded POST.
    fn dispatch(&self, call: InboundCall) -> impl Future<Output = Result<Reply, TransportError>> + Send;

    /// Queues a message on a session's stream.
    fn push(
        &self,
        session_id: &str,
        message: JsonRpcMessage,
    ) -> impl Future<Output = Result<bool, TransportError>> + Send;

    /// Attaches the stream for a session.
    fn open(
        &self,
        session_id: Option<&str>,
    ) -> impl Future<Output = Result<ChannelStream, TransportError>> + Send;

    /// Terminates a session.
    fn close(&self, session_id: Option<&str>) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl Transport for Dispatcher {
    fn mode(&self) -> SessionMode {
        Dispatcher::mode(self)
    }

    fn dispatch(&self, call: InboundCall) -> impl Future<Output = Result<Reply, TransportError>> + Send {
        self.handle_post(call)
    }

    fn push(
        &self,
        session_id: &str,
        message: JsonRpcMessage,
    ) -> impl Future<Output = Result<bool, TransportError>> + Send {
        Dispatcher::push(self, session_id, message)
    }

    fn open(
        &self,
        session_id: Option<&str>,
    ) -> impl Future<Output = Result<ChannelStream, TransportError>> + Send {
        self.open_stream(session_id)
    }

    fn close(&self, session_id: Option<&str>) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.terminate(session_id)
    }
}
