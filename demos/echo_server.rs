//! Echo server over the streamable HTTP transport.
//!
//! Mounts the echo service at `/v1/mcp`, with optional bearer authentication
//! and periodic reaping of idle sessions. With authentication enabled a second
//! mount at `/v1/mcp/protected` requires its own scopes (`mcp:admin` by
//! default).
//!
//! ## Running the Example
//!
//! ```bash
//! cargo run --example echo_server
//! # JWT authentication against an OIDC issuer's JWKS
//! MCP_AUTH_ISSUER=https://auth.example.com cargo run --example echo_server
//! # or a single static token
//! MCP_AUTH_TOKEN=secret REQUIRED_SCOPES=mcp:read,mcp:write cargo run --example echo_server
//! ```
//!
//! ## Testing with curl
//!
//! Initialize (the reply carries the `mcp-session-id` header):
//! ```bash
//! curl -i -X POST http://localhost:8080/v1/mcp \
//!   -H "Content-Type: application/json" \
//!   -d '{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}'
//! ```
//!
//! Call the echo tool:
//! ```bash
//! curl -X POST http://localhost:8080/v1/mcp \
//!   -H "Content-Type: application/json" \
//!   -H "mcp-session-id: <id>" \
//!   -d '{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"}}}'
//! ```
//!
//! Open the notification stream:
//! ```bash
//! curl -N -H "mcp-session-id: <id>" -H "Accept: text/event-stream" http://localhost:8080/v1/mcp
//! ```
//!
//! Close the session:
//! ```bash
//! curl -X DELETE -H "mcp-session-id: <id>" http://localhost:8080/v1/mcp
//! ```

use std::{sync::Arc, time::Duration};

use actix_web::{App, HttpServer, middleware, web};
use mcp_session_http::{
    AuthInfo, AuthServerMetadata, Dispatcher, DispatcherConfig, JwtVerifier, StaticTokenVerifier,
    StreamableHttpService, TokenVerifier, auth::AuthServerType,
    transport::oauth_metadata::oauth_metadata_resource,
};
use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    {self},
};

mod common;
use common::echo_service;

const BIND_ADDRESS: &str = "127.0.0.1:8080";
const BASE_PATH: &str = "/v1/mcp";
const PROTECTED_PATH: &str = "/v1/mcp/protected";
const DEFAULT_REQUIRED_SCOPES: &str = "mcp:read,mcp:write";
const DEFAULT_PROTECTED_SCOPES: &str = "mcp:admin";
const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const REAP_INTERVAL: Duration = Duration::from_secs(60);

fn scopes_from_env(var: &str, default: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Picks the verifier from the environment: a JWT issuer wins over a static
/// token. The issuer's metadata is returned so it can be republished.
async fn token_verifier(
    required_scopes: &[String],
) -> anyhow::Result<(Option<Arc<dyn TokenVerifier>>, Option<AuthServerMetadata>)> {
    if let Ok(issuer) = std::env::var("MCP_AUTH_ISSUER") {
        let metadata =
            AuthServerMetadata::discover(&reqwest::Client::new(), &issuer, AuthServerType::Oidc)
                .await?;
        let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::from_metadata(&metadata)?);
        tracing::info!(issuer = %metadata.issuer, "JWT authentication enabled");
        return Ok((Some(verifier), Some(metadata)));
    }
    if let Ok(token) = std::env::var("MCP_AUTH_TOKEN") {
        let info = AuthInfo::new("demo-client", required_scopes.iter().cloned());
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(StaticTokenVerifier::new().with_token(token, info));
        tracing::info!("static token authentication enabled");
        return Ok((Some(verifier), None));
    }
    Ok((None, None))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mcp_session_http=debug".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let required_scopes = scopes_from_env("REQUIRED_SCOPES", DEFAULT_REQUIRED_SCOPES);
    let protected_scopes = scopes_from_env("PROTECTED_REQUIRED_SCOPES", DEFAULT_PROTECTED_SCOPES);
    let (token_verifier, metadata) = token_verifier(&required_scopes).await?;

    let dispatcher = Arc::new(Dispatcher::new(
        echo_service::handlers(),
        DispatcherConfig::default(),
    ));

    let registry = dispatcher.registry().clone();
    actix_rt::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            registry.close_idle(IDLE_TIMEOUT).await;
        }
    });

    println!("\nEcho server running at http://{BIND_ADDRESS}{BASE_PATH}");
    println!("POST   {BASE_PATH}        - JSON-RPC calls (initialize without a session id)");
    println!("GET    {BASE_PATH}        - SSE stream for a session");
    println!("DELETE {BASE_PATH}        - close a session");
    println!("GET    {BASE_PATH}/health - health check");
    match &token_verifier {
        Some(_) => {
            println!("POST   {PROTECTED_PATH} - same service, requires {protected_scopes:?}");
            if metadata.is_some() {
                println!("GET    /.well-known/oauth-authorization-server - issuer metadata");
            }
            println!("Authentication: bearer token required\n");
        }
        None => println!("Authentication: disabled\n"),
    }

    let server_dispatcher = dispatcher.clone();
    HttpServer::new(move || {
        let http_service = StreamableHttpService::builder()
            .transport(server_dispatcher.clone())
            .maybe_token_verifier(token_verifier.clone())
            .required_scopes(required_scopes.clone())
            .sse_keep_alive(Duration::from_secs(30))
            .build();

        let mut app = App::new().wrap(middleware::Logger::default());
        if let Some(metadata) = &metadata {
            app = app.service(oauth_metadata_resource(metadata.clone()));
        }
        // The protected mount must come first: the base scope would
        // otherwise claim its prefix.
        if let Some(verifier) = &token_verifier {
            let protected = StreamableHttpService::builder()
                .transport(server_dispatcher.clone())
                .token_verifier(verifier.clone())
                .required_scopes(protected_scopes.clone())
                .build();
            app = app.service(web::scope(PROTECTED_PATH).service(protected.scope()));
        }
        app.service(web::scope(BASE_PATH).service(http_service.scope()))
    })
    .bind(BIND_ADDRESS)?
    .run()
    .await?;

    dispatcher.registry().close_all().await;
    println!("Server stopped");
    Ok(())
}
