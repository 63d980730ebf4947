//! `/.well-known/oauth-authorization-server` for actix-web.
//!
//! Mount it at the application root next to the MCP scope:
//!
//! ```rust,no_run
//! use actix_web::App;
//! use mcp_session_http::{AuthServerMetadata, transport::oauth_metadata::oauth_metadata_resource};
//!
//! let metadata = AuthServerMetadata::new("https://auth.example.com", "https://auth.example.com/jwks");
//! let app = App::new().service(oauth_metadata_resource(metadata));
//! ```

use actix_web::{
    HttpResponse, HttpResponseBuilder, Resource,
    http::{Method, header},
    web::{self, Data},
};
use serde_json::json;

use crate::auth::{AuthServerMetadata, OAUTH_METADATA_PATH};

/// Serves `metadata` with permissive CORS so browser clients can discover it.
pub fn oauth_metadata_resource(metadata: AuthServerMetadata) -> Resource {
    web::resource(OAUTH_METADATA_PATH)
        .app_data(Data::new(metadata))
        .route(web::get().to(handle_metadata))
        .route(web::method(Method::OPTIONS).to(handle_preflight))
        .default_service(web::to(handle_other))
}

fn with_cors(builder: &mut HttpResponseBuilder) -> &mut HttpResponseBuilder {
    builder
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization"))
}

async fn handle_metadata(metadata: Data<AuthServerMetadata>) -> HttpResponse {
    with_cors(&mut HttpResponse::Ok()).json(metadata.get_ref())
}

async fn handle_preflight() -> HttpResponse {
    with_cors(&mut HttpResponse::NoContent()).finish()
}

async fn handle_other() -> HttpResponse {
    with_cors(&mut HttpResponse::MethodNotAllowed()).json(json!({"error": "Method not allowed"}))
}
