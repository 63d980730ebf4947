//! Tests for framework-level scope composition
//!
//! These tests verify that the streamable HTTP service can be mounted at
//! custom paths using actix-web's scope composition.

use actix_web::{App, http::StatusCode, test, web};
use mcp_session_http::StreamableHttpService;
use serde_json::Value;

mod common;
use common::{dispatcher, initialize_request};

#[actix_web::test]
async fn test_streamable_http_service_scope_composition() {
    let http_service = StreamableHttpService::builder()
        .transport(dispatcher())
        .build();

    let app = test::init_service(
        App::new().service(web::scope("/api/v2/mcp").service(http_service.scope())),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v2/mcp")
        .insert_header(("content-type", "application/json"))
        .insert_header(("accept", "application/json, text/event-stream"))
        .set_json(initialize_request(1))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("mcp-session-id"));
}

#[actix_web::test]
async fn test_multiple_services_keep_separate_sessions() {
    let first = StreamableHttpService::builder()
        .transport(dispatcher())
        .build();
    let second = StreamableHttpService::builder()
        .transport(dispatcher())
        .build();

    let app = test::init_service(
        App::new()
            .service(web::scope("/a").service(first.scope()))
            .service(web::scope("/b").service(second.scope())),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/a")
        .insert_header(("content-type", "application/json"))
        .set_json(initialize_request(1))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let session_id = resp
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .expect("session header")
        .to_owned();

    // The session belongs to the first mount only.
    let req = test::TestRequest::post()
        .uri("/b")
        .insert_header(("content-type", "application/json"))
        .insert_header(("mcp-session-id", session_id))
        .set_json(common::echo_request(2, "hi"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], -32000);
}

#[actix_web::test]
async fn test_health_route_under_custom_scope() {
    let http_service = StreamableHttpService::builder()
        .transport(dispatcher())
        .build();

    let app = test::init_service(
        App::new().service(web::scope("/v1/mcp").service(http_service.scope())),
    )
    .await;

    let req = test::TestRequest::get().uri("/v1/mcp/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["authenticated"], false);
    assert!(body["timestamp"].is_string());
}
