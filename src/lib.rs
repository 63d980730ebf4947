//! Session-aware JSON-RPC 2.0 over HTTP, with Server-Sent-Events streaming for
//! server-initiated messages.
//!
//! The core is transport-agnostic: a [`Dispatcher`] owns a
//! [`SessionRegistry`](session::SessionRegistry) and a [`HandlerRegistry`],
//! and turns decoded calls into replies. [`StreamableHttpService`] binds it to
//! actix-web.

pub mod auth;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod model;
pub mod session;
pub mod transport;

pub use auth::{AuthError, AuthInfo, AuthServerMetadata, StaticTokenVerifier, TokenVerifier};
#[cfg(feature = "auth-jwt")]
pub use auth::{JwtError, JwtVerifier};
pub use dispatcher::{Dispatcher, DispatcherConfig, InboundCall, JsonRpcReply, Reply, SessionMode};
pub use error::TransportError;
pub use handler::{HandlerRegistry, Peer, PeerRequestError, RequestContext};
pub use model::{ErrorCode, ErrorData, JsonRpcMessage, RequestId};
pub use session::{SessionId, SessionRegistry};
pub use transport::Transport;

#[cfg(feature = "transport-streamable-http")]
pub use transport::streamable_http_server::StreamableHttpService;
