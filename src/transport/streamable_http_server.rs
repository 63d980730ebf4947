//! Streamable HTTP transport for actix-web.
//!
//! One endpoint serves three methods:
//! - **POST**: JSON-RPC calls. Replies are buffered `application/json`, or
//!   `202 Accepted` when results go out over the session's stream
//! - **GET**: the session's Server-Sent-Events stream
//! - **DELETE**: explicit session termination
//!
//! Bearer authentication, when a [`TokenVerifier`] is configured, runs before
//! any of these reach the transport.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_session_http::{Dispatcher, DispatcherConfig, HandlerRegistry, StreamableHttpService};
//! use actix_web::{App, HttpServer};
//! use std::sync::Arc;
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let dispatcher = Arc::new(Dispatcher::new(HandlerRegistry::new(), DispatcherConfig::default()));
//!     HttpServer::new(move || {
//!         let service = StreamableHttpService::builder()
//!             .transport(dispatcher.clone())
//!             .build();
//!
//!         App::new()
//!             .service(service.scope())
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```

use std::{sync::Arc, time::Duration};

use actix_web::{
    HttpRequest, HttpResponse, ResponseError, Result, Scope,
    error::InternalError,
    http::{
        StatusCode,
        header::{self, CACHE_CONTROL},
    },
    middleware,
    web::{self, Bytes, Data},
};
use futures::StreamExt;

use super::Transport;
use crate::{
    auth::{self, AuthError, AuthInfo, TokenVerifier},
    codec,
    dispatcher::{Dispatcher, InboundCall, Reply},
    error::TransportError,
    session::{ChannelEvent, SessionId},
};

/// Header carrying the session id on every call after `initialize`.
pub const HEADER_SESSION_ID: &str = "mcp-session-id";

const HEADER_X_ACCEL_BUFFERING: &str = "X-Accel-Buffering";
const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
const JSON_MIME_TYPE: &str = "application/json";

/// Streamable HTTP service for actix-web integration.
///
/// Built with [`StreamableHttpService::builder`] and mounted with
/// [`scope`](Self::scope).
///
/// # Type Parameters
///
/// * `T` - The transport core handling decoded calls (defaults to [`Dispatcher`])
///
/// # Example
///
/// ```rust,no_run
/// use mcp_session_http::{
///     Dispatcher, DispatcherConfig, HandlerRegistry, StaticTokenVerifier, StreamableHttpService,
///     auth::AuthInfo,
/// };
/// use actix_web::{App, HttpServer, web};
/// use std::{sync::Arc, time::Duration};
///
/// #[actix_web::main]
/// async fn main() -> std::io::Result<()> {
///     let dispatcher = Arc::new(Dispatcher::new(HandlerRegistry::new(), DispatcherConfig::default()));
///     let verifier = Arc::new(
///         StaticTokenVerifier::new().with_token("secret", AuthInfo::new("me", ["mcp:read"])),
///     );
///     HttpServer::new(move || {
///         let service = StreamableHttpService::builder()
///             .transport(dispatcher.clone())
///             .token_verifier(verifier.clone())
///             .required_scopes(vec!["mcp:read".to_string()])
///             .sse_keep_alive(Duration::from_secs(30))
///             .build();
///
///         App::new()
///             .service(web::scope("/mcp").service(service.scope()))
///     })
///     .bind("127.0.0.1:8080")?
///     .run()
///     .await
/// }
/// ```
#[derive(bon::Builder)]
pub struct StreamableHttpService<T = Dispatcher> {
    /// The transport core every call is handed to
    transport: Arc<T>,

    /// Verifier for bearer tokens; calls are unauthenticated without one
    token_verifier: Option<Arc<dyn TokenVerifier>>,

    /// Scopes every token must carry
    #[builder(default)]
    required_scopes: Vec<String>,

    /// Optional keep-alive interval for SSE connections
    sse_keep_alive: Option<Duration>,
}

impl<T> Clone for StreamableHttpService<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            token_verifier: self.token_verifier.clone(),
            required_scopes: self.required_scopes.clone(),
            sse_keep_alive: self.sse_keep_alive,
        }
    }
}

/// Per-scope state shared by the route handlers.
struct AppData<T> {
    transport: Arc<T>,
    token_verifier: Option<Arc<dyn TokenVerifier>>,
    required_scopes: Vec<String>,
    sse_keep_alive: Option<Duration>,
}

impl<T> AppData<T> {
    /// Checks the bearer token when a verifier is configured.
    async fn authenticate(&self, req: &HttpRequest) -> Result<Option<AuthInfo>, AuthError> {
        let Some(verifier) = self.token_verifier.as_deref() else {
            return Ok(None);
        };
        let header = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let info = auth::authenticate(verifier, header, &self.required_scopes)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, path = req.path(), "request rejected"))?;
        tracing::debug!(subject = %info.subject, "request authenticated");
        Ok(Some(info))
    }
}

impl<T: Transport> StreamableHttpService<T> {
    /// Creates a scope with this service's routes for mounting at any path.
    ///
    /// The method consumes `self`; clone the service to mount it more than
    /// once.
    pub fn scope(
        self,
    ) -> Scope<
        impl actix_web::dev::ServiceFactory<
            actix_web::dev::ServiceRequest,
            Config = (),
            Response = actix_web::dev::ServiceResponse,
            Error = actix_web::Error,
            InitError = (),
        >,
    > {
        let app_data = AppData {
            transport: self.transport,
            token_verifier: self.token_verifier,
            required_scopes: self.required_scopes,
            sse_keep_alive: self.sse_keep_alive,
        };

        web::scope("")
            .app_data(Data::new(app_data))
            .wrap(middleware::NormalizePath::trim())
            .route("", web::get().to(Self::handle_get))
            .route("", web::post().to(Self::handle_post))
            .route("", web::delete().to(Self::handle_delete))
            .route("/health", web::get().to(Self::handle_health))
    }

    async fn handle_get(req: HttpRequest, service: Data<AppData<T>>) -> Result<HttpResponse> {
        // Check accept header
        let accept = req
            .headers()
            .get(header::ACCEPT)
            .and_then(|h| h.to_str().ok());

        if !accept.is_some_and(|header| header.contains(EVENT_STREAM_MIME_TYPE)) {
            return Ok(HttpResponse::NotAcceptable()
                .body("Not Acceptable: Client must accept text/event-stream"));
        }

        service.authenticate(&req).await?;

        let session_id = session_id_header(&req);
        tracing::debug!(session_id = ?session_id, "GET request for SSE stream");

        let stream = service.transport.open(session_id.as_deref()).await?;

        let keep_alive = service.sse_keep_alive;
        let sse_stream = async_stream::stream! {
            let mut stream = stream;
            // First ping only after a full period.
            let mut keep_alive_timer = keep_alive
                .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));

            loop {
                tokio::select! {
                    event = stream.next() => match event {
                        Some(event) => match sse_frame(&event) {
                            Ok(frame) => yield Ok::<_, actix_web::Error>(frame),
                            Err(error) => {
                                tracing::error!(event_id = event.event_id, %error, "failed to encode SSE event, skipping");
                            }
                        },
                        None => break,
                    },
                    _ = async {
                        match keep_alive_timer.as_mut() {
                            Some(timer) => {
                                timer.tick().await;
                            }
                            None => {
                                std::future::pending::<()>().await;
                            }
                        }
                    } => {
                        yield Ok(Bytes::from(":ping\n\n"));
                    }
                }
            }
        };

        let mut response = HttpResponse::Ok();
        response
            .content_type(EVENT_STREAM_MIME_TYPE)
            .append_header((CACHE_CONTROL, "no-cache"))
            .append_header((HEADER_X_ACCEL_BUFFERING, "no"));
        if let Some(session_id) = &session_id {
            response.append_header((HEADER_SESSION_ID, session_id.as_ref()));
        }
        Ok(response.streaming(sse_stream))
    }

    async fn handle_post(
        req: HttpRequest,
        body: Bytes,
        service: Data<AppData<T>>,
    ) -> Result<HttpResponse> {
        // Check content type
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok());

        if !content_type.is_some_and(|header| header.starts_with(JSON_MIME_TYPE)) {
            return Ok(HttpResponse::UnsupportedMediaType()
                .body("Unsupported Media Type: Content-Type must be application/json"));
        }

        // Check accept header, when the client sent one
        let accept = req
            .headers()
            .get(header::ACCEPT)
            .and_then(|h| h.to_str().ok());

        if accept.is_some_and(|header| !accepts_json(header)) {
            return Ok(HttpResponse::NotAcceptable()
                .body("Not Acceptable: Client must accept application/json"));
        }

        let auth = service.authenticate(&req).await?;

        let payload = service
            .transport
            .decode(&body)
            .map_err(TransportError::from)
            .inspect_err(|e| tracing::warn!(error = %e, "undecodable POST body"))?;

        let session_id = session_id_header(&req);
        tracing::debug!(session_id = ?session_id, envelopes = payload.len(), "POST request");

        let reply = service
            .transport
            .dispatch(InboundCall::new(session_id, payload).with_auth(auth))
            .await?;

        match reply {
            Reply::Json { session_id, body } => {
                let body = codec::encode_reply(&body)
                    .map_err(|e| InternalError::new(e, StatusCode::INTERNAL_SERVER_ERROR))?;
                let mut response = HttpResponse::Ok();
                response.content_type(JSON_MIME_TYPE);
                if let Some(session_id) = session_id {
                    response.append_header((HEADER_SESSION_ID, session_id.as_ref()));
                }
                Ok(response.body(body))
            }
            Reply::Accepted => Ok(HttpResponse::Accepted().finish()),
        }
    }

    async fn handle_delete(req: HttpRequest, service: Data<AppData<T>>) -> Result<HttpResponse> {
        service.authenticate(&req).await?;

        let session_id = session_id_header(&req);
        tracing::debug!(session_id = ?session_id, "DELETE request to close session");

        service.transport.close(session_id.as_deref()).await?;

        Ok(HttpResponse::NoContent().finish())
    }

    async fn handle_health(service: Data<AppData<T>>) -> HttpResponse {
        HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "authenticated": service.token_verifier.is_some(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }
}

fn session_id_header(req: &HttpRequest) -> Option<SessionId> {
    req.headers()
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(SessionId::from)
}

fn accepts_json(accept: &str) -> bool {
    accept.split(',').any(|range| {
        let range = range.split(';').next().unwrap_or_default().trim();
        matches!(range, JSON_MIME_TYPE | "application/*" | "*/*")
    })
}

/// Formats one channel event as an SSE frame.
pub fn sse_frame(event: &ChannelEvent) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(&event.message)?;
    Ok(Bytes::from(format!(
        "id: {}\nevent: message\ndata: {data}\n\n",
        event.event_id
    )))
}

impl ResponseError for TransportError {
    fn status_code(&self) -> StatusCode {
        match self {
            TransportError::ChannelAlreadyOpen(_) => StatusCode::CONFLICT,
            TransportError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            TransportError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TransportError::InvalidSession(_)
            | TransportError::SessionClosed(_)
            | TransportError::StreamUnavailable(_)
            | TransportError::Decode(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_message())
    }
}

impl ResponseError for AuthError {
    fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientScope { .. } => StatusCode::FORBIDDEN,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let challenge = match self {
            AuthError::MissingToken => "Bearer".to_string(),
            AuthError::InvalidToken => "Bearer error=\"invalid_token\"".to_string(),
            AuthError::InsufficientScope { required, .. } => format!(
                "Bearer error=\"insufficient_scope\", scope=\"{}\"",
                required.join(" ")
            ),
        };
        HttpResponse::build(self.status_code())
            .append_header((header::WWW_AUTHENTICATE, challenge))
            .json(self.to_body())
    }
}
